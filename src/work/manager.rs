use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::DbHandle;
use crate::errors::WorkError;

use super::models::*;
use super::store::{CommitOutcome, CreateOutcome, Transition, WorkStore};

type Result<T> = std::result::Result<T, WorkError>;

/// Enforces ordering and claim rules on top of the [`WorkStore`].
///
/// Every mutation is one conditional statement inside the store; the manager
/// only translates outcomes into [`WorkError`]s and logs transitions.
#[derive(Clone)]
pub struct WorkManager {
    db: DbHandle<WorkStore>,
}

impl WorkManager {
    pub fn new(store: WorkStore) -> Self {
        Self {
            db: DbHandle::new(store),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let store = WorkStore::open(path)
            .with_context(|| format!("Failed to open work store at {}", path.display()))?;
        Ok(Self::new(store))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(WorkStore::open_in_memory()?))
    }

    pub async fn create_unit(&self, new: NewWorkUnit) -> Result<WorkUnit> {
        let group = new.related_works_id.clone();
        let order = new.priority_order;
        let outcome = self
            .db
            .call(move |store| Ok::<_, WorkError>(store.create_unit(&new)?))
            .await?;
        match outcome {
            CreateOutcome::Created(unit) => {
                info!(work_id = %unit.id, group = ?unit.related_works_id, order = unit.priority_order, "Work unit created");
                Ok(unit)
            }
            CreateOutcome::DuplicateOrder => Err(WorkError::DuplicateOrder {
                group: group.unwrap_or_default(),
                order,
            }),
        }
    }

    pub async fn get_unit(&self, id: &str) -> Result<WorkUnit> {
        let id = id.to_string();
        self.db
            .call(move |store| match store.get_unit(&id)? {
                Some(unit) => Ok(unit),
                None => Err(WorkError::NotFound { id }),
            })
            .await
    }

    pub async fn list_units(&self, filter: UnitFilter) -> Result<Vec<WorkUnit>> {
        self.db
            .call(move |store| Ok::<_, WorkError>(store.list_units(&filter)?))
            .await
    }

    /// Atomically claim the next eligible unit for `worker`.
    pub async fn claim_next(&self, worker: &str, group: Option<&str>) -> Result<WorkUnit> {
        let worker = worker.to_string();
        let group = group.map(str::to_string);
        let claimed = self
            .db
            .call({
                let worker = worker.clone();
                let group = group.clone();
                move |store| Ok::<_, WorkError>(store.claim_next(&worker, group.as_deref())?)
            })
            .await?;
        match claimed {
            Some(unit) => {
                info!(
                    work_id = %unit.id,
                    worker = %worker,
                    group = ?unit.related_works_id,
                    attempt = unit.attempts,
                    "Work unit claimed"
                );
                Ok(unit)
            }
            None => {
                debug!(worker = %worker, group = ?group, "No eligible work");
                Err(WorkError::NoEligibleWork)
            }
        }
    }

    pub async fn mark_started(&self, id: &str) -> Result<WorkUnit> {
        let unit = self
            .apply(id, WorkStatus::InProgress, |store, id| store.mark_started(id))
            .await?;
        info!(work_id = %unit.id, "Work unit started");
        Ok(unit)
    }

    pub async fn mark_completed(&self, id: &str) -> Result<WorkUnit> {
        let unit = self
            .apply(id, WorkStatus::Completed, |store, id| store.mark_completed(id))
            .await?;
        info!(work_id = %unit.id, "Work unit completed");
        Ok(unit)
    }

    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<WorkUnit> {
        let reason = reason.to_string();
        let unit = self
            .apply(id, WorkStatus::Failed, move |store, id| {
                store.mark_failed(id, &reason)
            })
            .await?;
        warn!(work_id = %unit.id, reason = ?unit.failure_reason, "Work unit failed");
        Ok(unit)
    }

    /// Return an active unit to `pending` without counting it as a failure.
    pub async fn release_claim(&self, id: &str) -> Result<WorkUnit> {
        let unit = self
            .apply(id, WorkStatus::Pending, |store, id| store.release_claim(id))
            .await?;
        info!(work_id = %unit.id, "Work unit released back to pending");
        Ok(unit)
    }

    /// Operator action: allow a failed unit to be claimed again.
    pub async fn reset_failed(&self, id: &str) -> Result<WorkUnit> {
        let unit = self
            .apply(id, WorkStatus::Pending, |store, id| store.reset_failed(id))
            .await?;
        info!(work_id = %unit.id, "Failed work unit reset");
        Ok(unit)
    }

    /// Reset units that have sat in `claimed` longer than `timeout`.
    pub async fn reclaim_stale(&self, timeout: Duration) -> Result<Vec<WorkUnit>> {
        let timeout = chrono::Duration::from_std(timeout)
            .context("Stale-claim timeout out of range")?;
        let cutoff = Utc::now() - timeout;
        let units = self
            .db
            .call(move |store| Ok::<_, WorkError>(store.reclaim_stale(cutoff)?))
            .await?;
        for unit in &units {
            warn!(work_id = %unit.id, "Reclaimed stale claim");
        }
        Ok(units)
    }

    pub async fn record_commit(
        &self,
        work_id: &str,
        commit_reference: &str,
        message: &str,
    ) -> Result<Commit> {
        let id = work_id.to_string();
        let reference = commit_reference.to_string();
        let message = message.to_string();
        let outcome = self
            .db
            .call({
                let id = id.clone();
                move |store| Ok::<_, WorkError>(store.record_commit(&id, &reference, &message)?)
            })
            .await?;
        match outcome {
            CommitOutcome::Recorded(commit) => {
                info!(work_id = %commit.work_id, commit = %commit.commit_reference, "Commit recorded");
                Ok(commit)
            }
            CommitOutcome::Rejected(status) => Err(WorkError::CommitRejected { id, status }),
            CommitOutcome::Missing => Err(WorkError::NotFound { id }),
        }
    }

    pub async fn commits_for(&self, work_id: &str) -> Result<Vec<Commit>> {
        let id = work_id.to_string();
        self.db
            .call(move |store| Ok::<_, WorkError>(store.commits_for(&id)?))
            .await
    }

    pub async fn attach_review(
        &self,
        commit_id: i64,
        reviewer: &str,
        status: ReviewStatus,
        notes: Option<&str>,
    ) -> Result<Commit> {
        let reviewer = reviewer.to_string();
        let notes = notes.map(str::to_string);
        self.db
            .call(move |store| {
                match store.attach_review(commit_id, &reviewer, status, notes.as_deref())? {
                    Some(commit) => Ok(commit),
                    None => Err(WorkError::CommitNotFound { id: commit_id }),
                }
            })
            .await
    }

    /// Read-only: the unit `claim_next` would pick within a backlog entry.
    pub async fn query_next_for_priority(&self, priority_number: i64) -> Result<Option<WorkUnit>> {
        self.db
            .call(move |store| Ok::<_, WorkError>(store.next_for_priority(priority_number)?))
            .await
    }

    pub async fn open_groups(&self) -> Result<Vec<String>> {
        self.db
            .call(|store| Ok::<_, WorkError>(store.open_groups()?))
            .await
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.db
            .call(|store| Ok::<_, WorkError>(store.status_counts()?))
            .await
    }

    async fn apply<F>(&self, id: &str, target: WorkStatus, f: F) -> Result<WorkUnit>
    where
        F: FnOnce(&WorkStore, &str) -> anyhow::Result<Transition> + Send + 'static,
    {
        let id = id.to_string();
        self.db
            .call(move |store| match f(store, &id)? {
                Transition::Applied(unit) | Transition::Unchanged(unit) => Ok(unit),
                Transition::Rejected(from) => Err(WorkError::InvalidTransition {
                    id,
                    from,
                    to: target,
                }),
                Transition::Missing => Err(WorkError::NotFound { id }),
            })
            .await
    }
}
