use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ContextBackend, ExecutionContext, MergeOutcome, Workspace};
use crate::work::{WorkUnit, normalize_path};

/// Identity used for checkpoint and merge commits.
const GIT_IDENTITY: [&str; 4] = ["-c", "user.name=tandem", "-c", "user.email=tandem@localhost"];

/// One `git worktree` per context, merged back with `--no-ff`.
pub struct GitWorktreeBackend {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
    branch_prefix: String,
    trunk: String,
}

impl GitWorktreeBackend {
    /// Open the repository at `repo_root`. The branch checked out there is
    /// the trunk every context branches from and merges into.
    pub fn open(repo_root: &Path, worktrees_dir: &Path, branch_prefix: &str) -> Result<Self> {
        let trunk = detect_trunk(repo_root)?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
            branch_prefix: branch_prefix.trim_end_matches('/').to_string(),
            trunk,
        })
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    fn branch_for(&self, context_id: &str, unit: &WorkUnit) -> String {
        let slug: String = unit
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .take(40)
            .collect();
        format!("{}/{}-{}", self.branch_prefix, slug, context_id)
    }

    /// Commit whatever the worker left uncommitted in its worktree.
    async fn checkpoint(&self, ctx: &ExecutionContext) -> Result<()> {
        let status = git_ok(&ctx.path, &["status", "--porcelain"]).await?;
        if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
            return Ok(());
        }
        git_ok(&ctx.path, &["add", "-A"]).await?;
        let message = format!("tandem: checkpoint {}", ctx.work_id);
        git_ok(&ctx.path, &["commit", "--no-verify", "-m", &message]).await?;
        debug!(context = %ctx.id, "Checkpointed uncommitted changes");
        Ok(())
    }
}

#[async_trait]
impl ContextBackend for GitWorktreeBackend {
    fn name(&self) -> &'static str {
        "git-worktree"
    }

    async fn create(&self, context_id: &str, unit: &WorkUnit) -> Result<Workspace> {
        let branch = self.branch_for(context_id, unit);
        let path = self.worktrees_dir.join(context_id);
        tokio::fs::create_dir_all(&self.worktrees_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.worktrees_dir.display()))?;
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;

        git_ok(
            &self.repo_root,
            &["worktree", "add", "-b", &branch, path_str, &self.trunk],
        )
        .await
        .context("Git worktree creation failed")?;

        Ok(Workspace {
            path,
            branch: Some(branch),
        })
    }

    async fn changed_files(&self, ctx: &ExecutionContext) -> Result<BTreeSet<String>> {
        self.checkpoint(ctx).await?;
        let branch = ctx.branch.as_deref().context("Git context has no branch")?;
        let range = format!("{}...{}", self.trunk, branch);
        let out = git_ok(&self.repo_root, &["diff", "--name-only", &range]).await?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(normalize_path)
            .filter(|p| !p.is_empty())
            .collect())
    }

    async fn merge(&self, ctx: &ExecutionContext) -> Result<MergeOutcome> {
        let branch = ctx.branch.as_deref().context("Git context has no branch")?;
        let current = detect_trunk(&self.repo_root)?;
        if current != self.trunk {
            anyhow::bail!(
                "Repository root has {} checked out, expected trunk {}",
                current,
                self.trunk
            );
        }

        let ahead = git_ok(
            &self.repo_root,
            &["rev-list", "--count", &format!("{}..{}", self.trunk, branch)],
        )
        .await?;
        if String::from_utf8_lossy(&ahead.stdout).trim() == "0" {
            return Ok(MergeOutcome::NothingToMerge);
        }

        let message = format!("Merge {} ({})", branch, ctx.work_id);
        let output = git(
            &self.repo_root,
            &["merge", "--no-ff", "--no-verify", "-m", &message, branch],
        )
        .await?;
        if output.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let detail = merge_failure_detail(&output);
        warn!(work_id = %ctx.work_id, branch, detail = %detail, "Merge into trunk failed");
        if let Err(e) = git(&self.repo_root, &["merge", "--abort"]).await {
            warn!(error = %e, "git merge --abort failed");
        }
        Ok(MergeOutcome::Conflict(detail))
    }

    async fn destroy(&self, ctx: &ExecutionContext) -> Result<()> {
        let path_str = ctx
            .path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        git_ok(&self.repo_root, &["worktree", "remove", "--force", path_str])
            .await
            .context("git worktree remove failed")?;
        if let Some(branch) = &ctx.branch
            && let Err(e) = git_ok(&self.repo_root, &["branch", "-D", branch]).await
        {
            warn!(branch = %branch, error = %e, "Failed to delete context branch");
        }
        Ok(())
    }
}

/// Name of the branch checked out at `repo_root`.
pub fn detect_trunk(repo_root: &Path) -> Result<String> {
    let repo = git2::Repository::open(repo_root)
        .with_context(|| format!("{} is not a git repository", repo_root.display()))?;
    let head = repo.head().context("Repository has no HEAD commit")?;
    if !head.is_branch() {
        anyhow::bail!("Repository HEAD is detached");
    }
    head.shorthand()
        .map(str::to_string)
        .context("HEAD branch name is not valid UTF-8")
}

async fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .args(GIT_IDENTITY)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))
}

async fn git_ok(dir: &Path, args: &[&str]) -> Result<Output> {
    let output = git(dir, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(output)
}

fn merge_failure_detail(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let conflicts: Vec<&str> = stdout
        .lines()
        .filter(|l| l.starts_with("CONFLICT"))
        .collect();
    if conflicts.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        conflicts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AllocatorError;
    use crate::work::WorkStatus;
    use crate::worktree::ContextAllocator;
    use chrono::Utc;
    use std::sync::Arc;

    fn init_repo(dir: &Path) -> Result<()> {
        let repo = git2::Repository::init(dir)?;
        std::fs::write(dir.join("a.txt"), "a\n")?;
        std::fs::write(dir.join("b.txt"), "b\n")?;
        let mut index = repo.index()?;
        index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = git2::Signature::now("test", "test@example.com")?;
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])?;
        Ok(())
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
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            attempts: 1,
            failure_reason: None,
        }
    }

    #[test]
    fn detect_trunk_reads_checked_out_branch() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        init_repo(dir.path())?;
        let trunk = detect_trunk(dir.path())?;
        assert!(!trunk.is_empty());
        Ok(())
    }

    #[test]
    fn detect_trunk_fails_outside_repository() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        assert!(detect_trunk(dir.path()).is_err());
    }

    #[tokio::test]
    async fn worktree_changes_merge_into_trunk() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        init_repo(dir.path())?;
        let backend = GitWorktreeBackend::open(
            dir.path(),
            &dir.path().join(".tandem/worktrees"),
            "tandem",
        )?;
        let alloc = ContextAllocator::new(Arc::new(backend), 2);

        let ctx = alloc.acquire(&unit("wu-a", &["a.txt"])).await?;
        assert!(ctx.path.join("a.txt").exists());
        std::fs::write(ctx.path.join("a.txt"), "changed\n")?;

        let report = alloc.release(&ctx, true).await?;
        assert!(report.merged);
        assert_eq!(report.changed_files, vec!["a.txt".to_string()]);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt"))?, "changed\n");
        assert!(!ctx.path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn release_without_merge_leaves_trunk_untouched() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        init_repo(dir.path())?;
        let backend = GitWorktreeBackend::open(
            dir.path(),
            &dir.path().join(".tandem/worktrees"),
            "tandem",
        )?;
        let alloc = ContextAllocator::new(Arc::new(backend), 2);
        let ctx = alloc.acquire(&unit("wu-b", &["b.txt"])).await?;
        std::fs::write(ctx.path.join("b.txt"), "crashed midway\n")?;
        let report = alloc.release(&ctx, false).await?;
        assert!(!report.merged);
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt"))?, "b\n");
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_merges_are_aborted() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        init_repo(dir.path())?;
        let backend = GitWorktreeBackend::open(
            dir.path(),
            &dir.path().join(".tandem/worktrees"),
            "tandem",
        )?;
        let alloc = ContextAllocator::new(Arc::new(backend), 2);

        // Two units with no declared files both edit a.txt.
        let first = alloc.acquire(&unit("wu-1", &[])).await?;
        let second = alloc.acquire(&unit("wu-2", &[])).await?;
        std::fs::write(first.path.join("a.txt"), "first\n")?;
        std::fs::write(second.path.join("a.txt"), "second\n")?;

        alloc.release(&first, true).await?;
        let err = alloc.release(&second, true).await.unwrap_err();
        assert!(matches!(err, AllocatorError::MergeConflict { .. }));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt"))?, "first\n");
        Ok(())
    }
}
