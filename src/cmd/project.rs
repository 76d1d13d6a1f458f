//! Project setup and overview, `tandem init` and `tandem status`.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

use tandem::config::{BackendKind, CONFIG_FILE, Project, TANDEM_DIR, TandemConfig};
use tandem::work::{UnitFilter, WorkStatus};

use super::{open_bus, open_migration, open_work, print_json};

pub fn cmd_init(
    project_dir: &Path,
    backend: Option<BackendKind>,
    force: bool,
    json: bool,
) -> Result<()> {
    let tandem_dir = project_dir.join(TANDEM_DIR);
    let config_path = tandem_dir.join(CONFIG_FILE);
    std::fs::create_dir_all(&tandem_dir)
        .with_context(|| format!("Failed to create {}", tandem_dir.display()))?;

    let is_repo = git2::Repository::open(project_dir).is_ok();
    let wrote_config = if config_path.exists() && !force {
        false
    } else {
        let mut config = TandemConfig::default();
        config.worktree.backend = backend.unwrap_or(if is_repo {
            BackendKind::Git
        } else {
            BackendKind::Scratch
        });
        config.save(&config_path)?;
        true
    };

    if is_repo {
        exclude_tandem_dir(project_dir)?;
    }

    // Opening each store creates its schema.
    let project = Project::new(project_dir.to_path_buf())?;
    open_work(&project)?;
    open_bus(&project)?;
    open_migration(&project)?;

    if json {
        return print_json(&json!({
            "tandem_dir": project.tandem_dir,
            "config_written": wrote_config,
            "backend": project.config.worktree.backend.to_string(),
        }));
    }

    println!();
    if wrote_config {
        println!("Created {}", config_path.display());
    } else {
        println!("{} already exists (use --force to overwrite)", config_path.display());
    }
    println!("Database: {}", project.db_file().display());
    println!("Flags:    {}", project.flags_file().display());
    println!("Backend:  {}", project.config.worktree.backend);
    println!();
    if project.config.orchestrator.worker_cmd.is_none() {
        println!("Set [orchestrator] worker_cmd in {} before 'tandem run'.", CONFIG_FILE);
        println!();
    }
    Ok(())
}

/// Keep `.tandem/` out of `git status` without touching tracked files.
fn exclude_tandem_dir(project_dir: &Path) -> Result<()> {
    let info_dir = project_dir.join(".git").join("info");
    if !info_dir.is_dir() {
        return Ok(());
    }
    let exclude = info_dir.join("exclude");
    let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
    let entry = format!("/{}/", TANDEM_DIR);
    if existing.lines().any(|l| l.trim() == entry) {
        return Ok(());
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&entry);
    content.push('\n');
    std::fs::write(&exclude, content)
        .with_context(|| format!("Failed to update {}", exclude.display()))
}

pub async fn cmd_status(project: &Project, json: bool) -> Result<()> {
    let work = open_work(project)?;
    let bus = open_bus(project)?;
    let migration = open_migration(project)?;

    let counts = work.status_counts().await?;
    let mut active = Vec::new();
    for status in [WorkStatus::Claimed, WorkStatus::InProgress] {
        active.extend(
            work.list_units(UnitFilter {
                status: Some(status),
                ..Default::default()
            })
            .await?,
        );
    }
    let enabled = migration.flags.enabled_keys();
    let outstanding = migration.rollback.outstanding()?;
    let dead_letters = bus.dead_letters().await?.len();

    if json {
        return print_json(&json!({
            "counts": counts,
            "active": active,
            "enabled_flags": enabled.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            "outstanding_rollbacks": outstanding.len(),
            "dead_letters": dead_letters,
        }));
    }

    println!();
    println!("Work units: {} total", counts.total());
    println!(
        "  {} pending, {} claimed, {} in progress, {} completed, {} failed",
        counts.pending,
        counts.claimed,
        counts.in_progress,
        console::style(counts.completed).green(),
        console::style(counts.failed).red()
    );
    if !active.is_empty() {
        println!();
        println!("{:<38} {:<12} {:<16} Claimed at", "Unit", "Status", "Worker");
        for unit in &active {
            println!(
                "{:<38} {:<12} {:<16} {}",
                unit.id,
                unit.status,
                unit.claimed_by.as_deref().unwrap_or("-"),
                unit.claimed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default()
            );
        }
    }
    println!();
    println!("Flags enabled: {}", enabled.len());
    if !outstanding.is_empty() {
        println!(
            "{}",
            console::style(format!("Rolled back, awaiting re-enable: {}", outstanding.len())).yellow()
        );
    }
    println!("Dead letters: {}", dead_letters);
    println!();
    Ok(())
}
