//! CLI command implementations.
//!
//! | Module     | Commands handled                               |
//! |------------|------------------------------------------------|
//! | `project`  | `Init`, `Status`                               |
//! | `config`   | `Config`                                       |
//! | `work`     | `Work`                                         |
//! | `run`      | `Run`                                          |
//! | `flags`    | `Flags`, `Rollback`, `ReEnable`, `Export`      |
//! | `bus`      | `Bus`                                          |

pub mod bus;
pub mod config;
pub mod flags;
pub mod project;
pub mod run;
pub mod work;

use anyhow::{Result, bail};
use serde::Serialize;

use tandem::bus::MessageBus;
use tandem::config::Project;
use tandem::migration::Migration;
use tandem::work::WorkManager;

pub use bus::cmd_bus;
pub use config::cmd_config;
pub use flags::{cmd_export, cmd_flags, cmd_re_enable, cmd_rollback};
pub use project::{cmd_init, cmd_status};
pub use run::cmd_run;
pub use work::cmd_work;

fn ensure_initialized(project: &Project) -> Result<()> {
    if !project.tandem_dir.exists() {
        bail!(
            "No {} directory in {}. Run 'tandem init' first.",
            tandem::config::TANDEM_DIR,
            project.root.display()
        );
    }
    Ok(())
}

pub(crate) fn open_work(project: &Project) -> Result<WorkManager> {
    ensure_initialized(project)?;
    Ok(WorkManager::open(&project.db_file())?)
}

pub(crate) fn open_bus(project: &Project) -> Result<MessageBus> {
    ensure_initialized(project)?;
    Ok(MessageBus::open(&project.db_file(), project.config.bus_settings())?)
}

pub(crate) fn open_migration(project: &Project) -> Result<Migration> {
    ensure_initialized(project)?;
    Ok(Migration::open(project)?)
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
