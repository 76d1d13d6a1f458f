use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tandem::config::{BackendKind, Project};

mod cmd;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(version, about = "Coordinate concurrent workers over one codebase")]
pub struct Cli {
    /// Debug logging (TANDEM_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .tandem/ with a default tandem.toml, database and flag file
    Init {
        /// Execution-context backend (defaults to git when run inside a repository)
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Overwrite an existing tandem.toml
        #[arg(long)]
        force: bool,
    },
    /// Summarise work units, flags, rollbacks and the message bus
    Status,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Create, inspect and drive work units by hand
    Work {
        #[command(subcommand)]
        command: WorkCommands,
    },
    /// Run the orchestrator until no work is claimable
    Run {
        /// Concurrent workers (overrides config and TANDEM_MAX_WORKERS)
        #[arg(long)]
        max_workers: Option<usize>,
        /// Worker shell command (overrides config and TANDEM_WORKER_CMD)
        #[arg(long)]
        worker_cmd: Option<String>,
    },
    /// Inspect and change feature flags
    Flags {
        #[command(subcommand)]
        command: FlagsCommands,
    },
    /// Disable flags at role, phase or system scope
    Rollback {
        #[command(subcommand)]
        command: RollbackCommands,
    },
    /// Restore flags disabled by earlier rollbacks
    ReEnable {
        #[arg(long, conflicts_with_all = ["phase", "all"])]
        role: Option<String>,
        #[arg(long, conflicts_with = "all")]
        phase: Option<u32>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        reason: String,
    },
    /// Send, receive and acknowledge bus messages
    Bus {
        #[command(subcommand)]
        command: BusCommands,
    },
    /// Export journals as JSON arrays
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum WorkCommands {
    /// Create a work unit
    Add {
        #[arg(long)]
        priority: i64,
        #[arg(long, default_value = "0")]
        order: i64,
        /// Related-works group; units in a group run strictly in order
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value = "")]
        scope: String,
        /// File the unit may modify (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// List work units
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
    },
    /// Show one unit and its commits
    Show { id: String },
    /// Preview the next claimable unit for a backlog entry
    Next {
        #[arg(long)]
        priority: i64,
    },
    /// Claim the next eligible unit
    Claim {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        group: Option<String>,
    },
    Start { id: String },
    Complete { id: String },
    Fail {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Return an active unit to pending
    Release { id: String },
    /// Return a failed unit to pending
    Reset { id: String },
    /// Record a commit against a unit
    Commit {
        id: String,
        reference: String,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Attach review results to a commit
    Review {
        commit_id: i64,
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Return claims older than the given age to pending
    Reclaim {
        #[arg(long, default_value = "300")]
        older_than_secs: u64,
    },
}

#[derive(Subcommand, Clone)]
pub enum FlagsCommands {
    /// Show every flag
    Status,
    /// Enable every role of a phase
    EnablePhase { number: u32 },
    /// Enable a role and all its operations
    EnableRole { role: String },
    /// Set one flag: `role` or `role.operation`
    Set { key: String, value: OnOff },
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum OnOff {
    On,
    Off,
}

#[derive(Subcommand, Clone)]
pub enum RollbackCommands {
    /// Disable a role and everything depending on it
    Role {
        role: String,
        #[arg(long)]
        reason: String,
    },
    /// Disable every role of a phase
    Phase {
        number: u32,
        #[arg(long)]
        reason: String,
    },
    /// Disable everything
    All {
        #[arg(long)]
        reason: String,
    },
    /// Show rollback and re-enable events
    History,
}

#[derive(Subcommand, Clone)]
pub enum BusCommands {
    Register { identity: String },
    Unregister { identity: String },
    /// Send a JSON payload
    Send {
        #[arg(long, default_value = tandem::bus::ORCHESTRATOR_IDENTITY)]
        from: String,
        to: String,
        payload: String,
    },
    /// Lease pending messages for an identity
    Recv {
        identity: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    Ack { identity: String, id: i64 },
    DeadLetters,
}

#[derive(Subcommand, Clone)]
pub enum ExportCommands {
    /// Wrapper comparison records
    Comparisons { output: PathBuf },
    /// Rollback events
    Rollbacks { output: PathBuf },
    /// Per-operation performance report built from the comparison journal
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Init { backend, force } = &cli.command {
        return cmd::cmd_init(&project_dir, *backend, *force, cli.json);
    }

    let project = Project::new(project_dir)?;
    let mut logging = project.config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    let _log_guard = tandem::logging::init(&logging, project.log_file().as_deref())?;

    match &cli.command {
        Commands::Init { .. } => {}
        Commands::Status => cmd::cmd_status(&project, cli.json).await?,
        Commands::Config { command } => cmd::cmd_config(&project, command.clone(), cli.json)?,
        Commands::Work { command } => cmd::cmd_work(&project, command.clone(), cli.json).await?,
        Commands::Run {
            max_workers,
            worker_cmd,
        } => {
            let project = project.with_cli_overrides(*max_workers, worker_cmd.clone());
            cmd::cmd_run(&project, cli.json).await?;
        }
        Commands::Flags { command } => cmd::cmd_flags(&project, command.clone(), cli.json)?,
        Commands::Rollback { command } => cmd::cmd_rollback(&project, command.clone(), cli.json)?,
        Commands::ReEnable {
            role,
            phase,
            all,
            reason,
        } => cmd::cmd_re_enable(&project, role.clone(), *phase, *all, reason, cli.json)?,
        Commands::Bus { command } => cmd::cmd_bus(&project, command.clone(), cli.json).await?,
        Commands::Export { command } => cmd::cmd_export(&project, command.clone(), cli.json)?,
    }

    Ok(())
}
