//! Runs the legacy and new implementation of an operation side by side
//! while its flag is on, records whether they agree, and returns the new
//! result only when they do.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use super::flags::FlagStore;
use super::journal::Journal;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRecord {
    pub id: Uuid,
    pub role: String,
    pub operation: String,
    pub params: Value,
    pub legacy_result: Value,
    pub new_result: Value,
    pub matched: bool,
    pub legacy_latency_ms: f64,
    pub new_latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate of comparisons for one (role, operation).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformanceReport {
    pub role: String,
    pub operation: String,
    pub comparisons: u64,
    pub mismatches: u64,
    pub mean_legacy_ms: f64,
    pub mean_new_ms: f64,
    /// new / legacy; above 1.0 means the new path is slower.
    pub latency_ratio: Option<f64>,
}

#[derive(Debug, Default, Clone)]
struct Tally {
    comparisons: u64,
    mismatches: u64,
    legacy_ms: f64,
    new_ms: f64,
}

pub struct ParallelWrapper {
    flags: Arc<FlagStore>,
    journal: Journal<ComparisonRecord>,
    tallies: Mutex<BTreeMap<(String, String), Tally>>,
}

impl ParallelWrapper {
    pub fn new(flags: Arc<FlagStore>, journal: Journal<ComparisonRecord>) -> Self {
        Self {
            flags,
            journal,
            tallies: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn journal(&self) -> &Journal<ComparisonRecord> {
        &self.journal
    }

    /// Execute `legacy`, and `new` alongside it when the (role, operation)
    /// flag is on.
    ///
    /// The legacy outcome is authoritative: a legacy error is returned as-is,
    /// and the new result is only returned when it equals the legacy result.
    pub async fn execute_with_validation<T, E, L, LF, N, NF>(
        &self,
        role: &str,
        operation: &str,
        params: Value,
        legacy: L,
        new: Option<N>,
    ) -> Result<T, E>
    where
        T: Serialize,
        E: Display,
        L: FnOnce() -> LF,
        LF: Future<Output = Result<T, E>>,
        N: FnOnce() -> NF,
        NF: Future<Output = Result<T, E>>,
    {
        let new = match new {
            Some(new) if self.flags.is_enabled(role, Some(operation)) => new,
            _ => return legacy().await,
        };

        let (legacy_out, new_out) = tokio::join!(timed(legacy()), timed(new()));
        let (legacy_res, legacy_ms) = legacy_out;
        let (new_res, new_ms) = new_out;

        let legacy_value = outcome_value(&legacy_res);
        let new_value = outcome_value(&new_res);
        let matched = legacy_res.is_ok() && new_res.is_ok() && legacy_value == new_value;

        let record = ComparisonRecord {
            id: Uuid::new_v4(),
            role: role.to_string(),
            operation: operation.to_string(),
            params,
            legacy_result: legacy_value,
            new_result: new_value,
            matched,
            legacy_latency_ms: legacy_ms,
            new_latency_ms: new_ms,
            timestamp: Utc::now(),
        };
        self.observe(&record);

        if matched {
            debug!(role, operation, "New implementation matched legacy");
            new_res
        } else {
            warn!(
                role,
                operation,
                legacy = %record.legacy_result,
                new = %record.new_result,
                "New implementation diverged from legacy"
            );
            legacy_res
        }
    }

    /// Per-operation aggregates since this wrapper was created.
    pub fn performance_report(&self) -> Vec<PerformanceReport> {
        let tallies = match self.tallies.lock() {
            Ok(t) => t.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        tallies
            .into_iter()
            .map(|((role, operation), t)| report_from(role, operation, &t))
            .collect()
    }

    /// Aggregates rebuilt from every journaled comparison.
    pub fn report_from_journal(&self) -> anyhow::Result<Vec<PerformanceReport>> {
        let mut tallies: BTreeMap<(String, String), Tally> = BTreeMap::new();
        for record in self.journal.read_all()? {
            tally_record(&mut tallies, &record);
        }
        Ok(tallies
            .into_iter()
            .map(|((role, operation), t)| report_from(role, operation, &t))
            .collect())
    }

    // Journal failures never fail the wrapped operation.
    fn observe(&self, record: &ComparisonRecord) {
        if let Ok(mut tallies) = self.tallies.lock() {
            tally_record(&mut tallies, record);
        }
        if let Err(e) = self.journal.append(record) {
            warn!(error = %e, role = %record.role, operation = %record.operation, "Failed to journal comparison");
        }
    }
}

async fn timed<F: Future>(fut: F) -> (F::Output, f64) {
    let start = Instant::now();
    let out = fut.await;
    (out, start.elapsed().as_secs_f64() * 1000.0)
}

fn outcome_value<T: Serialize, E: Display>(res: &Result<T, E>) -> Value {
    match res {
        Ok(v) => serde_json::to_value(v)
            .unwrap_or_else(|e| json!({ "unserializable": e.to_string() })),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

fn tally_record(tallies: &mut BTreeMap<(String, String), Tally>, record: &ComparisonRecord) {
    let t = tallies
        .entry((record.role.clone(), record.operation.clone()))
        .or_default();
    t.comparisons += 1;
    if !record.matched {
        t.mismatches += 1;
    }
    t.legacy_ms += record.legacy_latency_ms;
    t.new_ms += record.new_latency_ms;
}

fn report_from(role: String, operation: String, t: &Tally) -> PerformanceReport {
    let n = t.comparisons.max(1) as f64;
    let mean_legacy_ms = t.legacy_ms / n;
    let mean_new_ms = t.new_ms / n;
    PerformanceReport {
        role,
        operation,
        comparisons: t.comparisons,
        mismatches: t.mismatches,
        mean_legacy_ms,
        mean_new_ms,
        latency_ratio: (mean_legacy_ms > 0.0).then(|| mean_new_ms / mean_legacy_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::flags::FlagKey;
    use crate::migration::flags::tests::layout;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Noop = fn() -> std::future::Ready<Result<Value, String>>;

    fn wrapper(dir: &std::path::Path, enable: bool) -> anyhow::Result<ParallelWrapper> {
        let flags = Arc::new(FlagStore::open(&dir.join("flags.json"), &layout(), 3)?);
        if enable {
            flags.enable_role("planner")?;
        }
        Ok(ParallelWrapper::new(
            flags,
            Journal::new(dir.join("journal/comparisons.jsonl")),
        ))
    }

    #[tokio::test]
    async fn disabled_flag_runs_only_legacy() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), false)?;
        let new_ran = AtomicBool::new(false);
        let flag = &new_ran;
        let out: Result<Value, String> = w
            .execute_with_validation(
                "planner",
                "plan",
                json!({}),
                || async { Ok(json!(1)) },
                Some(move || async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!(1))
                }),
            )
            .await;
        assert_eq!(out, Ok(json!(1)));
        assert!(!new_ran.load(Ordering::SeqCst));
        assert!(w.journal().read_all()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_new_path_runs_legacy() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), true)?;
        let out = w
            .execute_with_validation("planner", "plan", json!({}), || async { Ok::<_, String>(json!("x")) }, None::<Noop>)
            .await;
        assert_eq!(out, Ok(json!("x")));
        assert!(w.journal().read_all()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn matching_results_return_new_and_record_match() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), true)?;
        let out: Result<Value, String> = w
            .execute_with_validation(
                "planner",
                "plan",
                json!({"unit": "wu-1"}),
                || async { Ok(json!({"steps": [1, 2], "ok": true})) },
                Some(|| async { Ok(json!({"ok": true, "steps": [1, 2]})) }),
            )
            .await;
        assert_eq!(out, Ok(json!({"steps": [1, 2], "ok": true})));

        let records = w.journal().read_all()?;
        assert_eq!(records.len(), 1);
        assert!(records[0].matched);
        assert_eq!(records[0].params, json!({"unit": "wu-1"}));
        Ok(())
    }

    #[tokio::test]
    async fn mismatch_returns_legacy() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), true)?;
        let out: Result<Value, String> = w
            .execute_with_validation(
                "planner",
                "plan",
                json!({}),
                || async { Ok(json!([1, 2, 3])) },
                Some(|| async { Ok(json!([1, 2])) }),
            )
            .await;
        assert_eq!(out, Ok(json!([1, 2, 3])));
        let records = w.journal().read_all()?;
        assert!(!records[0].matched);
        assert_eq!(records[0].new_result, json!([1, 2]));

        let report = w.performance_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].mismatches, 1);
        Ok(())
    }

    #[tokio::test]
    async fn new_error_falls_back_to_legacy() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), true)?;
        let out: Result<u32, String> = w
            .execute_with_validation(
                "planner",
                "estimate",
                json!({}),
                || async { Ok(5) },
                Some(|| async { Err("boom".to_string()) }),
            )
            .await;
        assert_eq!(out, Ok(5));
        let records = w.journal().read_all()?;
        assert_eq!(records[0].new_result, json!({"error": "boom"}));
        Ok(())
    }

    #[tokio::test]
    async fn legacy_error_is_authoritative() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), true)?;
        let out: Result<u32, String> = w
            .execute_with_validation(
                "planner",
                "plan",
                json!({}),
                || async { Err("legacy down".to_string()) },
                Some(|| async { Ok(1) }),
            )
            .await;
        assert_eq!(out, Err("legacy down".to_string()));
        assert!(!w.journal().read_all()?[0].matched);
        Ok(())
    }

    #[tokio::test]
    async fn operation_switch_alone_is_not_enough() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), false)?;
        w.flags.set(&FlagKey::operation("planner", "plan"), true)?;
        let out: Result<u32, String> = w
            .execute_with_validation("planner", "plan", json!({}), || async { Ok(1) }, Some(|| async { Ok(2) }))
            .await;
        assert_eq!(out, Ok(1));
        Ok(())
    }

    #[tokio::test]
    async fn rollback_from_another_store_stops_new_path() -> anyhow::Result<()> {
        use crate::migration::rollback::RollbackManager;

        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), true)?;
        let other = Arc::new(FlagStore::open(&dir.path().join("flags.json"), &layout(), 3)?);
        RollbackManager::new(other, Journal::new(dir.path().join("journal/rollbacks.jsonl")))
            .rollback_role("planner", "diverging")?;

        let new_ran = AtomicBool::new(false);
        let flag = &new_ran;
        let out: Result<Value, String> = w
            .execute_with_validation(
                "planner",
                "plan",
                json!({}),
                || async { Ok(json!(1)) },
                Some(move || async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!(1))
                }),
            )
            .await;
        assert_eq!(out, Ok(json!(1)));
        assert!(!new_ran.load(Ordering::SeqCst));
        assert!(w.journal().read_all()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn journal_report_matches_live_report() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let w = wrapper(dir.path(), true)?;
        for i in 0..4u32 {
            let _: Result<u32, String> = w
                .execute_with_validation(
                    "planner",
                    "plan",
                    json!({ "i": i }),
                    move || async move { Ok(i) },
                    Some(move || async move { Ok(if i % 2 == 0 { i } else { i + 1 }) }),
                )
                .await;
        }
        let from_journal = w.report_from_journal()?;
        assert_eq!(from_journal[0].comparisons, 4);
        assert_eq!(from_journal[0].mismatches, 2);
        assert_eq!(w.performance_report()[0].comparisons, 4);
        Ok(())
    }
}
