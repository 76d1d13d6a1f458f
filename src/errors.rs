//! Typed error hierarchy for tandem.
//!
//! One enum per subsystem:
//! - `WorkError`: Work Manager and Work Store failures
//! - `AllocatorError`: execution-context allocation and merge failures
//! - `BusError`: message bus failures
//! - `FlagError`: feature flag store failures
//! - `OrchestratorError`: worker lifecycle failures (wraps the others)

use thiserror::Error;

use crate::work::WorkStatus;

/// Errors from the Work Manager.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("No eligible work available")]
    NoEligibleWork,

    #[error("Work unit {id} not found")]
    NotFound { id: String },

    #[error("Invalid transition for work unit {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: WorkStatus,
        to: WorkStatus,
    },

    #[error("Group {group} already has a unit with priority_order {order}")]
    DuplicateOrder { group: String, order: i64 },

    #[error("Commit {id} not found")]
    CommitNotFound { id: i64 },

    #[error("Work unit {id} cannot accept commits while {status}")]
    CommitRejected { id: String, status: WorkStatus },

    #[error("Work store error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<anyhow::Error> for WorkError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

impl WorkError {
    /// Whether the caller should simply retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoEligibleWork)
    }
}

/// Errors from the execution-context allocator.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("Execution context limit reached ({limit} active)")]
    ResourceExhausted { limit: usize },

    #[error("Work unit {work_id} overlaps active context on files: {}", files.join(", "))]
    FileConflict { work_id: String, files: Vec<String> },

    #[error("Merge conflict for work unit {work_id}: {detail}")]
    MergeConflict { work_id: String, detail: String },

    #[error("Execution context {id} is not active")]
    UnknownContext { id: String },

    #[error("Context backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<anyhow::Error> for AllocatorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Backend(err)
    }
}

impl AllocatorError {
    /// Whether the caller should back off and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. } | Self::FileConflict { .. })
    }
}

/// Errors from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message {id} not found for {identity}")]
    MessageNotFound { id: i64, identity: String },

    #[error("Message bus storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<anyhow::Error> for BusError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// Errors from the feature flag store.
#[derive(Debug, Error)]
pub enum FlagError {
    #[error("Unknown worker role '{0}'")]
    UnknownRole(String),

    #[error("Unknown operation '{operation}' for role '{role}'")]
    UnknownOperation { role: String, operation: String },

    #[error("Unknown rollout phase {0}")]
    UnknownPhase(u32),

    #[error("Flag file I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Flag document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Role dependency cycle involving '{0}'")]
    DependencyCycle(String),

    #[error("Journal error: {0}")]
    Journal(#[source] anyhow::Error),

    #[error("Flag store lock poisoned")]
    LockPoisoned,
}

/// Errors from the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Work(#[from] WorkError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Failed to spawn worker for {work_id}: {source}")]
    SpawnFailed {
        work_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No active worker for work unit {0}")]
    UnknownWorker(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_error_invalid_transition_mentions_both_states() {
        let err = WorkError::InvalidTransition {
            id: "wu-1".to_string(),
            from: WorkStatus::Pending,
            to: WorkStatus::Completed,
        };
        let msg = err.to_string();
        assert!(msg.contains("wu-1"));
        assert!(msg.contains("pending"));
        assert!(msg.contains("completed"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn no_eligible_work_is_recoverable() {
        assert!(WorkError::NoEligibleWork.is_recoverable());
    }

    #[test]
    fn allocator_resource_exhausted_is_recoverable_merge_conflict_is_not() {
        assert!(AllocatorError::ResourceExhausted { limit: 2 }.is_recoverable());
        let conflict = AllocatorError::MergeConflict {
            work_id: "wu-2".into(),
            detail: "a.txt".into(),
        };
        assert!(!conflict.is_recoverable());
        assert!(conflict.to_string().contains("wu-2"));
    }

    #[test]
    fn file_conflict_lists_files() {
        let err = AllocatorError::FileConflict {
            work_id: "wu-3".into(),
            files: vec!["a.txt".into(), "b.txt".into()],
        };
        assert!(err.to_string().contains("a.txt, b.txt"));
    }

    #[test]
    fn orchestrator_error_converts_from_work_error() {
        let err: OrchestratorError = WorkError::NoEligibleWork.into();
        assert!(matches!(
            err,
            OrchestratorError::Work(WorkError::NoEligibleWork)
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkError::NoEligibleWork);
        assert_std_error(&AllocatorError::ResourceExhausted { limit: 1 });
        assert_std_error(&FlagError::UnknownPhase(3));
        assert_std_error(&BusError::MessageNotFound {
            id: 1,
            identity: "w".into(),
        });
    }
}
