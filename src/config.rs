//! Configuration for tandem, read from `.tandem/tandem.toml`.
//!
//! Layering is file → environment → CLI. Every section is optional and
//! falls back to defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_workers = 4
//! max_retries = 2
//! worker_cmd = "./scripts/worker.sh"
//! heartbeat_timeout_secs = 600
//!
//! [worktree]
//! backend = "git"
//! dir = "worktrees"
//! branch_prefix = "tandem"
//!
//! [bus]
//! ack_timeout_secs = 30
//! max_delivery_attempts = 5
//!
//! [migration]
//! flags_file = "flags.json"
//! backup_retention = 10
//!
//! [[migration.phases]]
//! number = 1
//! name = "foundation"
//! roles = ["planner"]
//!
//! [migration.roles.planner]
//! operations = ["plan", "estimate"]
//!
//! [migration.roles.builder]
//! operations = ["build"]
//! depends_on = ["planner"]
//!
//! [logging]
//! level = "info"
//! json = false
//! file = "logs/tandem.log"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::BusSettings;
use crate::migration::flags::{FlagDocument, FlagLayout, PhaseLayout, RoleLayout};
use crate::orchestrator::OrchestratorSettings;

pub const TANDEM_DIR: &str = ".tandem";
pub const CONFIG_FILE: &str = "tandem.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Shell command run once per claimed unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_cmd: Option<String>,
    /// Hard limit on one worker run; unset means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_timeout_secs: Option<u64>,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_prefix")]
    pub worker_prefix: String,
}

fn default_max_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_heartbeat_timeout_secs() -> u64 {
    600
}

fn default_stale_claim_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_worker_prefix() -> String {
    "worker".to_string()
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            worker_cmd: None,
            worker_timeout_secs: None,
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            stale_claim_timeout_secs: default_stale_claim_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_prefix: default_worker_prefix(),
        }
    }
}

/// Which execution-context backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One git worktree and branch per context.
    #[default]
    Git,
    /// Plain directory copies, for projects that are not git repositories.
    Scratch,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Git => write!(f, "git"),
            BackendKind::Scratch => write!(f, "scratch"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "git" => Ok(BackendKind::Git),
            "scratch" => Ok(BackendKind::Scratch),
            _ => anyhow::bail!("Invalid worktree backend '{}'. Valid values: git, scratch", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSection {
    #[serde(default)]
    pub backend: BackendKind,
    /// Relative to `.tandem/`.
    #[serde(default = "default_worktree_dir")]
    pub dir: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_worktree_dir() -> String {
    "worktrees".to_string()
}

fn default_branch_prefix() -> String {
    "tandem".to_string()
}

impl Default for WorktreeSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            dir: default_worktree_dir(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_max_delivery_attempts() -> u32 {
    5
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout_secs(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSection {
    /// Relative to `.tandem/`.
    #[serde(default = "default_flags_file")]
    pub flags_file: String,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    /// Relative to `.tandem/`.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,
    #[serde(default)]
    pub phases: Vec<PhaseLayout>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleLayout>,
}

fn default_flags_file() -> String {
    "flags.json".to_string()
}

fn default_backup_retention() -> usize {
    10
}

fn default_journal_dir() -> String {
    "journal".to_string()
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            flags_file: default_flags_file(),
            backup_retention: default_backup_retention(),
            journal_dir: default_journal_dir(),
            phases: Vec::new(),
            roles: BTreeMap::new(),
        }
    }
}

impl MigrationSection {
    pub fn layout(&self) -> FlagLayout {
        FlagLayout {
            phases: self.phases.clone(),
            roles: self.roles.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `TANDEM_LOG` or `RUST_LOG` override it.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily-rolling log file, relative to `.tandem/` unless absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

/// The complete tandem.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TandemConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub worktree: WorktreeSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub migration: MigrationSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TandemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tandem.toml")
    }

    /// Load `.tandem/tandem.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(tandem_dir: &Path) -> Result<Self> {
        let config_path = tandem_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize tandem.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `TANDEM_MAX_WORKERS` and `TANDEM_WORKER_CMD`.
    pub fn apply_env(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Ok(raw) = std::env::var("TANDEM_MAX_WORKERS") {
            match raw.parse() {
                Ok(n) => self.orchestrator.max_workers = n,
                Err(_) => warnings.push(format!("Ignoring TANDEM_MAX_WORKERS='{}': not a number", raw)),
            }
        }
        if let Ok(cmd) = std::env::var("TANDEM_WORKER_CMD")
            && !cmd.trim().is_empty()
        {
            self.orchestrator.worker_cmd = Some(cmd);
        }
        warnings
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let o = &self.orchestrator;
        OrchestratorSettings {
            max_workers: o.max_workers,
            max_retries: o.max_retries,
            heartbeat_timeout: Duration::from_secs(o.heartbeat_timeout_secs),
            stale_claim_timeout: Duration::from_secs(o.stale_claim_timeout_secs),
            poll_interval: Duration::from_millis(o.poll_interval_ms),
            worker_prefix: o.worker_prefix.clone(),
        }
    }

    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            ack_timeout: Duration::from_secs(self.bus.ack_timeout_secs),
            max_delivery_attempts: self.bus.max_delivery_attempts,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_workers == 0 {
            warnings.push("orchestrator.max_workers is 0: no worker will ever be spawned".into());
        }
        if self.orchestrator.poll_interval_ms == 0 {
            warnings.push("orchestrator.poll_interval_ms must be greater than 0".into());
        }
        if self.bus.max_delivery_attempts == 0 {
            warnings.push("bus.max_delivery_attempts is 0: every message will be dead-lettered".into());
        }

        let roles = &self.migration.roles;
        let mut seen_phases = BTreeSet::new();
        for phase in &self.migration.phases {
            if !seen_phases.insert(phase.number) {
                warnings.push(format!("Duplicate migration phase number {}", phase.number));
            }
            for role in &phase.roles {
                if !roles.contains_key(role) {
                    warnings.push(format!(
                        "Phase {} ('{}') references unknown role '{}'",
                        phase.number, phase.name, role
                    ));
                }
            }
        }
        for (name, role) in roles {
            for dep in &role.depends_on {
                if !roles.contains_key(dep) {
                    warnings.push(format!("Role '{}' depends on unknown role '{}'", name, dep));
                }
            }
        }
        if let Err(e) = FlagDocument::from_layout(&self.migration.layout()).dependency_order() {
            warnings.push(e.to_string());
        }

        warnings
    }
}

/// Resolved project configuration: tandem.toml plus environment and CLI
/// overrides, and the paths derived from the project root.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub tandem_dir: PathBuf,
    pub config: TandemConfig,
    /// Warnings collected while applying environment overrides.
    pub env_warnings: Vec<String>,
}

impl Project {
    pub fn new(root: PathBuf) -> Result<Self> {
        let root = root
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let tandem_dir = root.join(TANDEM_DIR);
        let mut config = TandemConfig::load_or_default(&tandem_dir)?;
        let env_warnings = config.apply_env();
        Ok(Self {
            root,
            tandem_dir,
            config,
            env_warnings,
        })
    }

    /// CLI flags win over file and environment.
    pub fn with_cli_overrides(mut self, max_workers: Option<usize>, worker_cmd: Option<String>) -> Self {
        if let Some(n) = max_workers {
            self.config.orchestrator.max_workers = n;
        }
        if worker_cmd.is_some() {
            self.config.orchestrator.worker_cmd = worker_cmd;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.tandem_dir.join(CONFIG_FILE)
    }

    /// Work store and message bus share this database.
    pub fn db_file(&self) -> PathBuf {
        self.tandem_dir.join("tandem.db")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.tandem_dir.join(&self.config.worktree.dir)
    }

    pub fn flags_file(&self) -> PathBuf {
        self.tandem_dir.join(&self.config.migration.flags_file)
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.tandem_dir.join(&self.config.migration.journal_dir)
    }

    pub fn comparisons_journal(&self) -> PathBuf {
        self.journal_dir().join("comparisons.jsonl")
    }

    pub fn rollbacks_journal(&self) -> PathBuf {
        self.journal_dir().join("rollbacks.jsonl")
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.config.logging.file.as_ref().map(|f| {
            if f.is_absolute() {
                f.clone()
            } else {
                self.tandem_dir.join(f)
            }
        })
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        warnings.extend(self.config.validate());
        warnings
    }
}
