//! The orchestrator loop, `tandem run`.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tandem::config::{BackendKind, Project};
use tandem::orchestrator::{Orchestrator, ProcessRunner};
use tandem::worktree::{ContextAllocator, ContextBackend, GitWorktreeBackend, ScratchBackend};

use super::{open_bus, open_work, print_json};

pub async fn cmd_run(project: &Project, json: bool) -> Result<()> {
    for warning in project.validate() {
        tracing::warn!(warning = %warning, "Configuration warning");
    }

    let config = &project.config;
    let worker_cmd = config.orchestrator.worker_cmd.clone().ok_or_else(|| {
        anyhow!("No worker command configured. Set [orchestrator] worker_cmd, TANDEM_WORKER_CMD or --worker-cmd")
    })?;

    let work = open_work(project)?;
    let bus = open_bus(project)?;
    let settings = config.orchestrator_settings();

    let backend: Arc<dyn ContextBackend> = match config.worktree.backend {
        BackendKind::Git => Arc::new(
            GitWorktreeBackend::open(
                &project.root,
                &project.worktrees_dir(),
                &config.worktree.branch_prefix,
            )
            .context("Failed to open git backend (use backend = \"scratch\" outside a repository)")?,
        ),
        BackendKind::Scratch => Arc::new(ScratchBackend::new(&project.root, &project.worktrees_dir())),
    };
    let allocator = Arc::new(ContextAllocator::new(backend, settings.max_workers));
    let runner = Arc::new(
        ProcessRunner::new(worker_cmd)
            .with_timeout(config.orchestrator.worker_timeout_secs.map(Duration::from_secs)),
    );

    let orchestrator = Orchestrator::new(work, allocator, bus, runner, settings);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let summary = orchestrator.run(shutdown).await?;
    orchestrator.join_all().await;

    if json {
        return print_json(&summary);
    }
    println!();
    println!("Run finished");
    println!("  spawned:   {}", summary.spawned);
    println!("  completed: {}", console::style(summary.completed).green());
    println!("  failed:    {}", console::style(summary.failed).red());
    println!("  retried:   {}", summary.retried);
    println!("  released:  {}", summary.released);
    println!();
    Ok(())
}
