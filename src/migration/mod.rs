//! Guarded migration from the legacy to the new implementation of each
//! worker role: persisted flags, side-by-side validation, and rollback.

pub mod flags;
pub mod journal;
pub mod rollback;
pub mod wrapper;

use std::sync::Arc;

use crate::config::Project;
use crate::errors::FlagError;

pub use flags::{FlagDocument, FlagKey, FlagLayout, FlagStore, PhaseLayout, RoleLayout};
pub use journal::Journal;
pub use rollback::{EventKind, Outstanding, RollbackEvent, RollbackManager, Scope};
pub use wrapper::{ComparisonRecord, ParallelWrapper, PerformanceReport};

/// The flag store with the wrapper and rollback manager sharing it.
pub struct Migration {
    pub flags: Arc<FlagStore>,
    pub wrapper: ParallelWrapper,
    pub rollback: RollbackManager,
}

impl Migration {
    pub fn open(project: &Project) -> Result<Self, FlagError> {
        let migration = &project.config.migration;
        let flags = Arc::new(FlagStore::open(
            &project.flags_file(),
            &migration.layout(),
            migration.backup_retention,
        )?);
        Ok(Self {
            wrapper: ParallelWrapper::new(
                Arc::clone(&flags),
                Journal::new(project.comparisons_journal()),
            ),
            rollback: RollbackManager::new(
                Arc::clone(&flags),
                Journal::new(project.rollbacks_journal()),
            ),
            flags,
        })
    }
}
