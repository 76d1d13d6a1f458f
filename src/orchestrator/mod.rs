//! Worker lifecycle: claim, isolate, run, integrate.
//!
//! The control loop claims units through the [`WorkManager`], gives each one
//! an [`ExecutionContext`] and a worker task, and settles the outcome when
//! the worker exits. Claims are serialised by the store's conditional
//! update; the loop itself holds no scheduling lock.

pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Delivery, MessageBus};
use crate::errors::{AllocatorError, OrchestratorError, WorkError};
use crate::work::{UnitFilter, WorkManager, WorkStatus, WorkUnit};
use crate::worktree::{ContextAllocator, ExecutionContext};

pub use runner::{ProcessRunner, WorkerEvent, WorkerExit, WorkerRunner, WorkerSpec, parse_line};

type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_workers: usize,
    /// Restarts allowed after a crash or failed exit.
    pub max_retries: u32,
    pub heartbeat_timeout: Duration,
    pub stale_claim_timeout: Duration,
    pub poll_interval: Duration,
    /// Prefix for worker identities (`<prefix>-<n>`).
    pub worker_prefix: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_retries: 2,
            heartbeat_timeout: Duration::from_secs(600),
            stale_claim_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            worker_prefix: "worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Revoked,
    HeartbeatLost,
    Reclaimed,
    Shutdown,
}

struct WorkerSlot {
    identity: String,
    unit: WorkUnit,
    context: ExecutionContext,
    last_seen: Arc<std::sync::Mutex<Instant>>,
    cancel: CancellationToken,
    kill_reason: Option<KillReason>,
    handle: JoinHandle<()>,
}

struct WorkerOutcome {
    identity: String,
    exit: anyhow::Result<WorkerExit>,
}

/// What happened to a unit when its worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Completed,
    Failed,
    /// Returned to pending for another attempt.
    Retried,
    /// Returned to pending without using up an attempt (revoked, shutdown).
    Released,
}

/// Units reclaimed and workers killed by one deadlock sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadlockReport {
    pub reclaimed: Vec<String>,
    pub killed: Vec<String>,
}

impl DeadlockReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.killed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub spawned: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub released: usize,
}

impl RunSummary {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Completed => self.completed += 1,
            Disposition::Failed => self.failed += 1,
            Disposition::Retried => self.retried += 1,
            Disposition::Released => self.released += 1,
        }
    }
}

/// Snapshot of one running worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub identity: String,
    pub work_id: String,
    pub context_id: String,
    pub path: std::path::PathBuf,
    pub idle_secs: u64,
}

pub struct Orchestrator {
    work: WorkManager,
    allocator: Arc<ContextAllocator>,
    bus: MessageBus,
    runner: Arc<dyn WorkerRunner>,
    settings: OrchestratorSettings,
    workers: Mutex<HashMap<String, WorkerSlot>>,
    outcomes_tx: mpsc::UnboundedSender<WorkerOutcome>,
    outcomes_rx: Mutex<mpsc::UnboundedReceiver<WorkerOutcome>>,
    next_worker: AtomicU64,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        work: WorkManager,
        allocator: Arc<ContextAllocator>,
        bus: MessageBus,
        runner: Arc<dyn WorkerRunner>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            work,
            allocator,
            bus,
            runner,
            settings,
            workers: Mutex::new(HashMap::new()),
            outcomes_tx,
            outcomes_rx: Mutex::new(outcomes_rx),
            next_worker: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn active_workers(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.lock().await;
        let mut infos: Vec<WorkerInfo> = workers
            .values()
            .map(|slot| WorkerInfo {
                identity: slot.identity.clone(),
                work_id: slot.unit.id.clone(),
                context_id: slot.context.id.clone(),
                path: slot.context.path.clone(),
                idle_secs: slot
                    .last_seen
                    .lock()
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or_default(),
            })
            .collect();
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }

    /// Claim and start workers until capacity or eligible work runs out.
    /// Each open group gets one claim attempt, then ungrouped work fills
    /// the remaining slots.
    pub async fn find_work(&self) -> Result<Vec<String>> {
        let mut started = Vec::new();
        if self.shutdown.is_cancelled() {
            return Ok(started);
        }

        for group in self.work.open_groups().await? {
            if self.allocator.available().await == 0 {
                return Ok(started);
            }
            if let Some(id) = self.claim_and_spawn(Some(&group)).await? {
                started.push(id);
            }
        }

        while self.allocator.available().await > 0 {
            match self.claim_and_spawn(None).await? {
                Some(id) => started.push(id),
                None => break,
            }
        }
        if !started.is_empty() {
            debug!(count = started.len(), "Workers started");
        }
        Ok(started)
    }

    async fn claim_and_spawn(&self, group: Option<&str>) -> Result<Option<String>> {
        let n = self.next_worker.fetch_add(1, Ordering::SeqCst);
        let identity = format!("{}-{}", self.settings.worker_prefix, n);
        let unit = match self.work.claim_next(&identity, group).await {
            Ok(unit) => unit,
            Err(e) => {
                // Hand the number back unless someone took the next one.
                let _ = self.next_worker.compare_exchange(
                    n + 1,
                    n,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                return match e {
                    WorkError::NoEligibleWork => Ok(None),
                    e => Err(e.into()),
                };
            }
        };

        let context = match self.allocator.acquire(&unit).await {
            Ok(ctx) => ctx,
            Err(e) => {
                if e.is_recoverable() {
                    debug!(work_id = %unit.id, error = %e, "No context available; returning claim");
                } else {
                    warn!(work_id = %unit.id, error = %e, "Context allocation failed; returning claim");
                }
                self.work.release_claim(&unit.id).await?;
                return Ok(None);
            }
        };

        self.bus.register(&identity).await?;
        self.spawn_worker(identity, unit.clone(), context).await;
        Ok(Some(unit.id))
    }

    async fn spawn_worker(&self, identity: String, unit: WorkUnit, context: ExecutionContext) {
        let cancel = self.shutdown.child_token();
        let last_seen = Arc::new(std::sync::Mutex::new(Instant::now()));

        let task = WorkerTask {
            work: self.work.clone(),
            bus: self.bus.clone(),
            runner: Arc::clone(&self.runner),
            identity: identity.clone(),
            unit: unit.clone(),
            context: context.clone(),
            last_seen: Arc::clone(&last_seen),
            cancel: cancel.clone(),
        };
        let tx = self.outcomes_tx.clone();
        let outcome_identity = identity.clone();
        let handle = tokio::spawn(async move {
            let exit = task.run().await;
            let _ = tx.send(WorkerOutcome {
                identity: outcome_identity,
                exit,
            });
        });

        info!(worker = %identity, work_id = %unit.id, context = %context.id, "Worker spawned");
        // Keyed by worker: a unit reclaimed and claimed again can briefly
        // have two slots.
        self.workers.lock().await.insert(
            identity.clone(),
            WorkerSlot {
                identity,
                unit,
                context,
                last_seen,
                cancel,
                kill_reason: None,
                handle,
            },
        );
    }

    /// Settle a finished worker: integrate or discard its context and move
    /// the unit to its next state.
    async fn finish(&self, outcome: WorkerOutcome) -> Result<Disposition> {
        let Some(slot) = self.workers.lock().await.remove(&outcome.identity) else {
            return Err(OrchestratorError::UnknownWorker(outcome.identity));
        };
        let work_id = slot.unit.id.clone();
        if let Err(e) = self.bus.unregister(&slot.identity).await {
            warn!(worker = %slot.identity, error = %e, "Failed to unregister worker mailbox");
        }

        // The claim was reclaimed (and maybe handed to another worker) while
        // this one ran; its result no longer belongs to the unit.
        let current = self.work.get_unit(&work_id).await?;
        if current.claimed_by.as_deref() != Some(slot.identity.as_str()) {
            self.discard(&slot.context).await;
            info!(work_id = %work_id, worker = %slot.identity, owner = ?current.claimed_by, "Worker lost its claim; result discarded");
            return Ok(Disposition::Released);
        }

        let disposition = match outcome.exit {
            Ok(WorkerExit::Succeeded) => match self.allocator.release(&slot.context, true).await {
                Ok(report) => {
                    self.work.mark_completed(&work_id).await?;
                    info!(work_id = %work_id, worker = %slot.identity, files = report.changed_files.len(), "Work merged");
                    Disposition::Completed
                }
                Err(AllocatorError::MergeConflict { detail, .. }) => {
                    self.work
                        .mark_failed(&work_id, &format!("merge conflict: {}", detail))
                        .await?;
                    Disposition::Failed
                }
                Err(e) => {
                    warn!(work_id = %work_id, error = %e, "Integration failed");
                    self.retry_or_fail(&slot.unit, &e.to_string()).await?
                }
            },
            Ok(WorkerExit::Failed { code, reason }) => {
                self.discard(&slot.context).await;
                warn!(work_id = %work_id, worker = %slot.identity, code = ?code, reason = %reason, "Worker failed");
                self.retry_or_fail(&slot.unit, &reason).await?
            }
            Ok(WorkerExit::Killed) => {
                self.discard(&slot.context).await;
                let reason = slot.kill_reason.unwrap_or(if slot.context.is_revoked() {
                    KillReason::Revoked
                } else {
                    KillReason::Shutdown
                });
                match reason {
                    KillReason::HeartbeatLost => {
                        self.retry_or_fail(&slot.unit, "heartbeat lost").await?
                    }
                    // Already back to pending in the store.
                    KillReason::Reclaimed => Disposition::Released,
                    KillReason::Revoked | KillReason::Shutdown => {
                        self.work.release_claim(&work_id).await?;
                        Disposition::Released
                    }
                }
            }
            Err(e) => {
                self.discard(&slot.context).await;
                error!(work_id = %work_id, worker = %slot.identity, error = %e, "Worker crashed");
                self.retry_or_fail(&slot.unit, &format!("{:#}", e)).await?
            }
        };
        info!(work_id = %work_id, disposition = ?disposition, "Worker finished");
        Ok(disposition)
    }

    async fn discard(&self, ctx: &ExecutionContext) {
        if let Err(e) = self.allocator.release(ctx, false).await {
            warn!(context = %ctx.id, error = %e, "Failed to release context");
        }
    }

    async fn retry_or_fail(&self, unit: &WorkUnit, reason: &str) -> Result<Disposition> {
        let current = self.work.get_unit(&unit.id).await?;
        if !current.status.is_active() {
            // Someone else (operator, stale reclaim) already moved it.
            return Ok(Disposition::Released);
        }
        if current.attempts <= self.settings.max_retries {
            warn!(work_id = %unit.id, attempt = current.attempts, max_retries = self.settings.max_retries, reason, "Retrying work unit");
            self.work.release_claim(&unit.id).await?;
            Ok(Disposition::Retried)
        } else {
            self.work.mark_failed(&unit.id, reason).await?;
            Ok(Disposition::Failed)
        }
    }

    /// Reclaim stale claims and kill workers that stopped heartbeating.
    pub async fn detect_deadlocks(&self) -> Result<DeadlockReport> {
        let mut report = DeadlockReport::default();

        for unit in self
            .work
            .reclaim_stale(self.settings.stale_claim_timeout)
            .await?
        {
            report.reclaimed.push(unit.id.clone());
            let mut workers = self.workers.lock().await;
            if let Some(slot) = workers
                .values_mut()
                .find(|s| s.unit.id == unit.id && s.kill_reason.is_none())
            {
                slot.kill_reason = Some(KillReason::Reclaimed);
                slot.cancel.cancel();
            }
        }

        let mut workers = self.workers.lock().await;
        for slot in workers.values_mut() {
            if slot.kill_reason.is_some() {
                continue;
            }
            let idle = slot
                .last_seen
                .lock()
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if idle > self.settings.heartbeat_timeout {
                warn!(worker = %slot.identity, work_id = %slot.unit.id, idle_secs = idle.as_secs(), "Worker heartbeat lost; killing");
                slot.kill_reason = Some(KillReason::HeartbeatLost);
                slot.cancel.cancel();
                report.killed.push(slot.unit.id.clone());
            }
        }
        Ok(report)
    }

    /// Deliver a message between workers.
    pub async fn route(
        &self,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        Ok(self.bus.send(from, to, payload).await?)
    }

    /// Revoke a context; its worker is killed and the unit returns to pending.
    pub async fn revoke_context(&self, context_id: &str) -> Result<()> {
        {
            let mut workers = self.workers.lock().await;
            if let Some(slot) = workers.values_mut().find(|s| s.context.id == context_id) {
                slot.kill_reason = Some(KillReason::Revoked);
            }
        }
        self.allocator.revoke(context_id).await?;
        Ok(())
    }

    /// Release claims held under this orchestrator's worker prefix that
    /// have no live worker, as left behind by a previous run that died.
    pub async fn recover_orphans(&self) -> Result<Vec<String>> {
        let prefix = format!("{}-", self.settings.worker_prefix);
        let live: Vec<String> = self
            .workers
            .lock()
            .await
            .values()
            .map(|slot| slot.unit.id.clone())
            .collect();
        let mut released = Vec::new();
        for status in [WorkStatus::Claimed, WorkStatus::InProgress] {
            let units = self
                .work
                .list_units(UnitFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await?;
            for unit in units {
                let ours = unit
                    .claimed_by
                    .as_deref()
                    .is_some_and(|w| w.starts_with(&prefix));
                if ours && !live.contains(&unit.id) {
                    warn!(work_id = %unit.id, worker = ?unit.claimed_by, "Releasing orphaned claim");
                    self.work.release_claim(&unit.id).await?;
                    released.push(unit.id);
                }
            }
        }
        Ok(released)
    }

    /// Main loop. Returns when nothing is claimable and no worker is active,
    /// or after `shutdown` fires and every worker has been settled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary> {
        let mut outcomes = self.outcomes_rx.lock().await;
        let mut summary = RunSummary::default();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let released = self.recover_orphans().await?;
        if !released.is_empty() {
            info!(count = released.len(), "Recovered orphaned claims");
        }
        info!(max_workers = self.allocator.capacity(), "Orchestrator started");

        loop {
            if shutdown.is_cancelled() {
                self.shutdown.cancel();
            }

            let started = self.find_work().await?;
            summary.spawned += started.len();

            let report = self.detect_deadlocks().await?;
            if !report.is_empty() {
                warn!(reclaimed = report.reclaimed.len(), killed = report.killed.len(), "Deadlock sweep acted");
            }

            if self.workers.lock().await.is_empty() {
                if self.shutdown.is_cancelled() {
                    break;
                }
                if started.is_empty() && report.reclaimed.is_empty() {
                    info!("No claimable work and no active workers");
                    break;
                }
                continue;
            }

            tokio::select! {
                Some(outcome) = outcomes.recv() => {
                    match self.finish(outcome).await {
                        Ok(disposition) => summary.record(disposition),
                        // The unit moved underneath the worker (reclaimed, reset).
                        Err(OrchestratorError::Work(e @ WorkError::InvalidTransition { .. })) => {
                            warn!(error = %e, "Worker outcome no longer applies");
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = ticker.tick() => {}
                _ = shutdown.cancelled(), if !self.shutdown.is_cancelled() => {
                    info!("Shutdown requested; stopping workers");
                    self.shutdown.cancel();
                }
            }
        }

        info!(
            spawned = summary.spawned,
            completed = summary.completed,
            failed = summary.failed,
            retried = summary.retried,
            released = summary.released,
            "Orchestrator stopped"
        );
        Ok(summary)
    }

    /// Wait for all worker tasks to exit. Only used after `run` returns.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, slot)| slot.handle)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Everything one worker task owns.
struct WorkerTask {
    work: WorkManager,
    bus: MessageBus,
    runner: Arc<dyn WorkerRunner>,
    identity: String,
    unit: WorkUnit,
    context: ExecutionContext,
    last_seen: Arc<std::sync::Mutex<Instant>>,
    cancel: CancellationToken,
}

impl WorkerTask {
    async fn run(self) -> anyhow::Result<WorkerExit> {
        let unit = self.work.mark_started(&self.unit.id).await?;

        // Revoking the context stops the worker like any other cancel.
        let revoked = self.context.revocation();
        let cancel = self.cancel.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = revoked.cancelled() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        });

        let spec = WorkerSpec {
            identity: self.identity.clone(),
            unit,
            context: self.context.clone(),
        };
        let (tx, mut rx) = mpsc::channel(64);
        let run = self.runner.run(spec, tx, self.cancel.clone());
        let events = async {
            while let Some(event) = rx.recv().await {
                self.handle_event(event).await;
            }
        };
        let (exit, ()) = tokio::join!(run, events);
        watcher.abort();
        exit
    }

    async fn handle_event(&self, event: WorkerEvent) {
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = Instant::now();
        }
        match event {
            WorkerEvent::Commit { reference, message } => {
                if let Err(e) = self
                    .work
                    .record_commit(&self.unit.id, &reference, &message)
                    .await
                {
                    warn!(work_id = %self.unit.id, commit = %reference, error = %e, "Failed to record commit");
                }
            }
            WorkerEvent::Message { to, payload } => {
                if let Err(e) = self.bus.send(&self.identity, &to, payload).await {
                    warn!(worker = %self.identity, to = %to, error = %e, "Failed to route message");
                }
            }
            WorkerEvent::Heartbeat => {}
            WorkerEvent::Output(line) => {
                debug!(worker = %self.identity, "{}", line);
            }
        }
    }
}
