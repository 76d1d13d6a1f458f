use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{ContextBackend, ExecutionContext, MergeOutcome, Workspace, list_files};
use crate::work::WorkUnit;

/// Plain directory copies for projects without a git repository.
///
/// Each context holds a pristine `base/` snapshot of the trunk next to the
/// `work/` copy handed to the worker. Changes are the difference between the
/// two; merging copies them into the trunk.
pub struct ScratchBackend {
    trunk: PathBuf,
    root: PathBuf,
}

impl ScratchBackend {
    pub fn new(trunk: &Path, root: &Path) -> Self {
        Self {
            trunk: trunk.to_path_buf(),
            root: root.to_path_buf(),
        }
    }

    fn context_dir(&self, context_id: &str) -> PathBuf {
        self.root.join(context_id)
    }
}

#[async_trait]
impl ContextBackend for ScratchBackend {
    fn name(&self) -> &'static str {
        "scratch"
    }

    async fn create(&self, context_id: &str, _unit: &WorkUnit) -> Result<Workspace> {
        let dir = self.context_dir(context_id);
        let trunk = self.trunk.clone();
        let work = dir.join("work");
        let base = dir.join("base");
        {
            let work = work.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                copy_tree(&trunk, &base)?;
                copy_tree(&trunk, &work)?;
                Ok(())
            })
            .await
            .context("Scratch copy task panicked")??;
        }
        Ok(Workspace {
            path: work,
            branch: None,
        })
    }

    async fn changed_files(&self, ctx: &ExecutionContext) -> Result<BTreeSet<String>> {
        let dir = self.context_dir(&ctx.id);
        tokio::task::spawn_blocking(move || diff_trees(&dir.join("base"), &dir.join("work")))
            .await
            .context("Scratch diff task panicked")?
    }

    async fn merge(&self, ctx: &ExecutionContext) -> Result<MergeOutcome> {
        let dir = self.context_dir(&ctx.id);
        let trunk = self.trunk.clone();
        tokio::task::spawn_blocking(move || -> Result<MergeOutcome> {
            let base = dir.join("base");
            let work = dir.join("work");
            let changed = diff_trees(&base, &work)?;
            if changed.is_empty() {
                return Ok(MergeOutcome::NothingToMerge);
            }
            // The trunk copy must still match our base, otherwise someone
            // else changed the same file since the context was created.
            let mut diverged = Vec::new();
            for rel in &changed {
                if read_optional(&base.join(rel))? != read_optional(&trunk.join(rel))? {
                    diverged.push(rel.clone());
                }
            }
            if !diverged.is_empty() {
                return Ok(MergeOutcome::Conflict(format!(
                    "trunk changed since context creation: {}",
                    diverged.join(", ")
                )));
            }
            for rel in &changed {
                let src = work.join(rel);
                let dst = trunk.join(rel);
                if src.exists() {
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&src, &dst)
                        .with_context(|| format!("Failed to copy {} into trunk", rel))?;
                } else if dst.exists() {
                    std::fs::remove_file(&dst)
                        .with_context(|| format!("Failed to remove {} from trunk", rel))?;
                }
            }
            debug!(files = changed.len(), "Scratch context merged");
            Ok(MergeOutcome::Merged)
        })
        .await
        .context("Scratch merge task panicked")?
    }

    async fn destroy(&self, ctx: &ExecutionContext) -> Result<()> {
        let dir = self.context_dir(&ctx.id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to).with_context(|| format!("Failed to create {}", to.display()))?;
    for rel in list_files(from)? {
        let dst = to.join(&rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from.join(&rel), &dst)
            .with_context(|| format!("Failed to copy {}", rel))?;
    }
    Ok(())
}

fn diff_trees(base: &Path, work: &Path) -> Result<BTreeSet<String>> {
    let before = list_files(base)?;
    let after = list_files(work)?;
    let mut changed = BTreeSet::new();
    for rel in before.union(&after) {
        if read_optional(&base.join(rel))? != read_optional(&work.join(rel))? {
            changed.insert(rel.clone());
        }
    }
    Ok(changed)
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
