//! Isolated execution contexts, one per running worker.
//!
//! The [`ContextAllocator`] owns the set of active contexts and enforces the
//! concurrency limit and file-overlap rule. Creating, diffing, merging and
//! destroying the actual working copies is delegated to a [`ContextBackend`].

pub mod git;
pub mod scratch;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::AllocatorError;
use crate::work::WorkUnit;

pub use git::GitWorktreeBackend;
pub use scratch::ScratchBackend;

/// A mutable workspace granted to exactly one worker.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: String,
    pub work_id: String,
    pub path: PathBuf,
    /// VCS branch backing the context, when the backend uses one.
    pub branch: Option<String>,
    pub assigned_files: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    revoked: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        id: impl Into<String>,
        work_id: impl Into<String>,
        path: PathBuf,
        branch: Option<String>,
        assigned_files: BTreeSet<String>,
    ) -> Self {
        Self {
            id: id.into(),
            work_id: work_id.into(),
            path,
            branch,
            assigned_files,
            created_at: Utc::now(),
            revoked: CancellationToken::new(),
        }
    }

    /// Token cancelled when the context is revoked.
    pub fn revocation(&self) -> CancellationToken {
        self.revoked.clone()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }
}

/// What a backend created for a new context.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    NothingToMerge,
    Conflict(String),
}

/// Result of a successful release.
#[derive(Debug, Clone, Default)]
pub struct ReleaseReport {
    pub merged: bool,
    pub changed_files: Vec<String>,
}

/// Storage for execution contexts.
#[async_trait]
pub trait ContextBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, context_id: &str, unit: &WorkUnit) -> Result<Workspace>;

    /// Files the context changed relative to its base. Backends may
    /// checkpoint pending edits first.
    async fn changed_files(&self, ctx: &ExecutionContext) -> Result<BTreeSet<String>>;

    async fn merge(&self, ctx: &ExecutionContext) -> Result<MergeOutcome>;

    async fn destroy(&self, ctx: &ExecutionContext) -> Result<()>;
}

/// Hands out execution contexts and integrates them back into the trunk.
pub struct ContextAllocator {
    backend: Arc<dyn ContextBackend>,
    limit: usize,
    active: Mutex<HashMap<String, ExecutionContext>>,
}

impl ContextAllocator {
    pub fn new(backend: Arc<dyn ContextBackend>, limit: usize) -> Self {
        Self {
            backend,
            limit: limit.max(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.limit
    }

    pub async fn active(&self) -> Vec<ExecutionContext> {
        let active = self.active.lock().await;
        let mut contexts: Vec<_> = active.values().cloned().collect();
        contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        contexts
    }

    pub async fn available(&self) -> usize {
        self.limit.saturating_sub(self.active.lock().await.len())
    }

    /// Create an isolated working copy for `unit`.
    pub async fn acquire(&self, unit: &WorkUnit) -> Result<ExecutionContext, AllocatorError> {
        let mut active = self.active.lock().await;
        if active.len() >= self.limit {
            return Err(AllocatorError::ResourceExhausted { limit: self.limit });
        }

        let mut overlap: BTreeSet<String> = BTreeSet::new();
        for ctx in active.values() {
            overlap.extend(unit.overlapping_files(&ctx.assigned_files));
        }
        if !overlap.is_empty() {
            return Err(AllocatorError::FileConflict {
                work_id: unit.id.clone(),
                files: overlap.into_iter().collect(),
            });
        }

        let id = format!("ctx-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let workspace = self
            .backend
            .create(&id, unit)
            .await
            .map_err(AllocatorError::Backend)?;
        let ctx = ExecutionContext::new(
            id.clone(),
            unit.id.clone(),
            workspace.path,
            workspace.branch,
            unit.assigned_files.clone(),
        );
        info!(context = %ctx.id, work_id = %ctx.work_id, backend = self.backend.name(), path = %ctx.path.display(), "Execution context acquired");
        active.insert(id, ctx.clone());
        Ok(ctx)
    }

    /// Tear down a context, merging its changes into the trunk first when
    /// `merge` is set. The context is gone afterwards even if merging fails.
    pub async fn release(
        &self,
        ctx: &ExecutionContext,
        merge: bool,
    ) -> Result<ReleaseReport, AllocatorError> {
        let mut active = self.active.lock().await;
        let Some(ctx) = active.remove(&ctx.id) else {
            return Err(AllocatorError::UnknownContext { id: ctx.id.clone() });
        };

        let result = if merge {
            self.integrate(&ctx, &active).await
        } else {
            Ok(ReleaseReport::default())
        };

        if let Err(e) = self.backend.destroy(&ctx).await {
            warn!(context = %ctx.id, error = %e, "Failed to destroy execution context");
        }
        info!(context = %ctx.id, work_id = %ctx.work_id, merge, ok = result.is_ok(), "Execution context released");
        result
    }

    async fn integrate(
        &self,
        ctx: &ExecutionContext,
        others: &HashMap<String, ExecutionContext>,
    ) -> Result<ReleaseReport, AllocatorError> {
        let changed = self
            .backend
            .changed_files(ctx)
            .await
            .map_err(AllocatorError::Backend)?;

        let mut held_elsewhere: BTreeSet<String> = BTreeSet::new();
        for other in others.values() {
            held_elsewhere.extend(changed.intersection(&other.assigned_files).cloned());
        }
        if !held_elsewhere.is_empty() {
            let files: Vec<String> = held_elsewhere.into_iter().collect();
            warn!(work_id = %ctx.work_id, files = ?files, "Changed files are assigned to another active context");
            return Err(AllocatorError::MergeConflict {
                work_id: ctx.work_id.clone(),
                detail: format!("files held by another context: {}", files.join(", ")),
            });
        }

        let stray: Vec<&String> = changed
            .iter()
            .filter(|f| !ctx.assigned_files.is_empty() && !ctx.assigned_files.contains(*f))
            .collect();
        if !stray.is_empty() {
            warn!(work_id = %ctx.work_id, files = ?stray, "Context changed files outside its assignment");
        }

        match self
            .backend
            .merge(ctx)
            .await
            .map_err(AllocatorError::Backend)?
        {
            MergeOutcome::Merged => Ok(ReleaseReport {
                merged: true,
                changed_files: changed.into_iter().collect(),
            }),
            MergeOutcome::NothingToMerge => Ok(ReleaseReport {
                merged: false,
                changed_files: Vec::new(),
            }),
            MergeOutcome::Conflict(detail) => Err(AllocatorError::MergeConflict {
                work_id: ctx.work_id.clone(),
                detail,
            }),
        }
    }

    /// Mark a context revoked; its worker is expected to stop.
    pub async fn revoke(&self, context_id: &str) -> Result<(), AllocatorError> {
        let active = self.active.lock().await;
        let ctx = active
            .get(context_id)
            .ok_or_else(|| AllocatorError::UnknownContext {
                id: context_id.to_string(),
            })?;
        ctx.revoked.cancel();
        warn!(context = %context_id, work_id = %ctx.work_id, "Execution context revoked");
        Ok(())
    }

    pub async fn is_revoked(&self, context_id: &str) -> bool {
        self.active
            .lock()
            .await
            .get(context_id)
            .is_some_and(|ctx| ctx.is_revoked())
    }

    pub async fn context_for_work(&self, work_id: &str) -> Option<ExecutionContext> {
        self.active
            .lock()
            .await
            .values()
            .find(|ctx| ctx.work_id == work_id)
            .cloned()
    }
}

/// Recursively list files under `root` as normalised relative paths,
/// skipping tandem state and VCS metadata.
pub(crate) fn list_files(root: &std::path::Path) -> Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_ignored(e.file_name()))
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root)?;
        files.insert(crate::work::normalize_path(&rel.to_string_lossy()));
    }
    Ok(files)
}

fn is_ignored(name: &std::ffi::OsStr) -> bool {
    name == ".git" || name == ".tandem"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkStatus, WorkUnit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that records calls and reports a fixed set of changed files.
    struct FakeBackend {
        root: tempfile::TempDir,
        changed: std::sync::Mutex<BTreeSet<String>>,
        conflict: bool,
        destroyed: AtomicUsize,
    }

    impl FakeBackend {
        fn new(conflict: bool) -> Self {
            Self {
                root: tempfile::TempDir::new().expect("tempdir"),
                changed: std::sync::Mutex::new(BTreeSet::new()),
                conflict,
                destroyed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContextBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn create(&self, context_id: &str, _unit: &WorkUnit) -> Result<Workspace> {
            let path = self.root.path().join(context_id);
            std::fs::create_dir_all(&path)?;
            Ok(Workspace { path, branch: None })
        }

        async fn changed_files(&self, _ctx: &ExecutionContext) -> Result<BTreeSet<String>> {
            Ok(self.changed.lock().expect("lock").clone())
        }

        async fn merge(&self, _ctx: &ExecutionContext) -> Result<MergeOutcome> {
            if self.conflict {
                Ok(MergeOutcome::Conflict("both modified".into()))
            } else {
                Ok(MergeOutcome::Merged)
            }
        }

        async fn destroy(&self, _ctx: &ExecutionContext) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn unit(id: &str, files: &[&str]) -> WorkUnit {
        WorkUnit {
            id: id.into(),
            priority_number: 1,
            related_works_id: None,
            priority_order: 1,
            scope_description: String::new(),
            assigned_files: files.iter().map(|f| f.to_string()).collect(),
            status: WorkStatus::Claimed,
            claimed_by: Some("w".into()),
            claimed_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            attempts: 1,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn acquire_enforces_limit() -> Result<()> {
        let alloc = ContextAllocator::new(Arc::new(FakeBackend::new(false)), 1);
        let ctx = alloc.acquire(&unit("a", &["a.txt"])).await?;
        let err = alloc.acquire(&unit("b", &["b.txt"])).await.unwrap_err();
        assert!(matches!(err, AllocatorError::ResourceExhausted { limit: 1 }));
        alloc.release(&ctx, false).await?;
        assert_eq!(alloc.available().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn acquire_rejects_overlapping_files() -> Result<()> {
        let alloc = ContextAllocator::new(Arc::new(FakeBackend::new(false)), 4);
        alloc.acquire(&unit("g1", &["a.txt"])).await?;
        alloc.acquire(&unit("g2", &["b.txt"])).await?;
        let err = alloc.acquire(&unit("g3", &["a.txt", "c.txt"])).await.unwrap_err();
        match err {
            AllocatorError::FileConflict { work_id, files } => {
                assert_eq!(work_id, "g3");
                assert_eq!(files, vec!["a.txt".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn release_with_merge_rejects_files_held_elsewhere() -> Result<()> {
        let backend = Arc::new(FakeBackend::new(false));
        backend.changed.lock().expect("lock").insert("b.txt".into());
        let alloc = ContextAllocator::new(backend.clone(), 4);
        let a = alloc.acquire(&unit("a", &["a.txt"])).await?;
        alloc.acquire(&unit("b", &["b.txt"])).await?;

        let err = alloc.release(&a, true).await.unwrap_err();
        assert!(matches!(err, AllocatorError::MergeConflict { .. }));
        // Torn down anyway.
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert!(alloc.context_for_work("a").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn vcs_conflict_surfaces_as_merge_conflict() -> Result<()> {
        let backend = Arc::new(FakeBackend::new(true));
        backend.changed.lock().expect("lock").insert("a.txt".into());
        let alloc = ContextAllocator::new(backend, 2);
        let a = alloc.acquire(&unit("a", &["a.txt"])).await?;
        let err = alloc.release(&a, true).await.unwrap_err();
        assert!(!err.is_recoverable());
        assert!(matches!(err, AllocatorError::MergeConflict { ref detail, .. } if detail == "both modified"));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_cancels_context_token() -> Result<()> {
        let alloc = ContextAllocator::new(Arc::new(FakeBackend::new(false)), 2);
        let ctx = alloc.acquire(&unit("a", &[])).await?;
        let token = ctx.revocation();
        alloc.revoke(&ctx.id).await?;
        assert!(token.is_cancelled());
        assert!(alloc.is_revoked(&ctx.id).await);
        assert!(matches!(
            alloc.revoke("ctx-missing").await,
            Err(AllocatorError::UnknownContext { .. })
        ));
        // Double release is an error.
        alloc.release(&ctx, false).await?;
        assert!(alloc.release(&ctx, false).await.is_err());
        Ok(())
    }

    #[test]
    fn list_files_skips_vcs_and_state_dirs() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("src"))?;
        std::fs::create_dir_all(dir.path().join(".git"))?;
        std::fs::create_dir_all(dir.path().join(".tandem"))?;
        std::fs::write(dir.path().join("src/lib.rs"), "x")?;
        std::fs::write(dir.path().join(".git/HEAD"), "x")?;
        std::fs::write(dir.path().join(".tandem/state.db"), "x")?;
        let files = list_files(dir.path())?;
        assert_eq!(files.into_iter().collect::<Vec<_>>(), vec!["src/lib.rs".to_string()]);
        Ok(())
    }
}
