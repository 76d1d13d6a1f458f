use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Selects the single pending unit that may be claimed next.
///
/// `?1` optionally restricts to a group, `?2` to a backlog entry. A unit is
/// eligible when no other unit of its group is active or earlier-and-open,
/// and none of its files are held by an active unit elsewhere.
const ELIGIBLE_SQL: &str = "
    SELECT w.id FROM work_units w
    WHERE w.status = 'pending'
      AND (?1 IS NULL OR w.related_works_id = ?1)
      AND (?2 IS NULL OR w.priority_number = ?2)
      AND NOT EXISTS (
          SELECT 1 FROM work_units e
          WHERE e.related_works_id = w.related_works_id
            AND e.id <> w.id
            AND (e.status IN ('claimed', 'in_progress')
                 OR (e.priority_order < w.priority_order AND e.status <> 'completed')))
      AND NOT EXISTS (
          SELECT 1 FROM work_files f
          JOIN work_files g ON g.path = f.path AND g.work_id <> f.work_id
          JOIN work_units o ON o.id = g.work_id
          WHERE f.work_id = w.id AND o.status IN ('claimed', 'in_progress'))
    ORDER BY w.priority_number, w.priority_order, w.created_at, w.id
    LIMIT 1";

const UNIT_COLUMNS: &str = "w.id, w.priority_number, w.related_works_id, w.priority_order, \
     w.scope_description, w.status, w.claimed_by, w.claimed_at, w.started_at, w.completed_at, \
     w.created_at, w.attempts, w.failure_reason, \
     (SELECT json_group_array(f.path) FROM work_files f WHERE f.work_id = w.id)";

const COMMIT_COLUMNS: &str = "id, work_id, commit_reference, message, committed_at, \
     reviewed_by, review_status, review_notes";

/// Outcome of a conditional status update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The row moved to the target status.
    Applied(WorkUnit),
    /// The row was already in the target status; nothing changed.
    Unchanged(WorkUnit),
    /// The row is in a status the transition does not start from.
    Rejected(WorkStatus),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(WorkUnit),
    DuplicateOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Recorded(Commit),
    Rejected(WorkStatus),
    Missing,
}

/// Durable table of work units and commits.
pub struct WorkStore {
    conn: Connection,
}

impl WorkStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = crate::db::open_connection(path)?;
        let store = Self { conn };
        store.run_migrations().context("Failed to run work store migrations")?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = crate::db::open_in_memory()?;
        let store = Self { conn };
        store.run_migrations().context("Failed to run work store migrations")?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS work_units (
                    id TEXT PRIMARY KEY,
                    priority_number INTEGER NOT NULL,
                    related_works_id TEXT,
                    priority_order INTEGER NOT NULL,
                    scope_description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    claimed_by TEXT,
                    claimed_at TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    created_at TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    failure_reason TEXT
                );

                CREATE TABLE IF NOT EXISTS work_files (
                    work_id TEXT NOT NULL REFERENCES work_units(id) ON DELETE CASCADE,
                    path TEXT NOT NULL,
                    PRIMARY KEY (work_id, path)
                );

                CREATE TABLE IF NOT EXISTS commits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    work_id TEXT NOT NULL REFERENCES work_units(id),
                    commit_reference TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    committed_at TEXT NOT NULL,
                    reviewed_by TEXT,
                    review_status TEXT,
                    review_notes TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_work_units_group_order
                    ON work_units(related_works_id, priority_order)
                    WHERE related_works_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_work_units_status ON work_units(status);
                CREATE INDEX IF NOT EXISTS idx_work_units_priority ON work_units(priority_number);
                CREATE INDEX IF NOT EXISTS idx_work_files_path ON work_files(path);
                CREATE INDEX IF NOT EXISTS idx_commits_work ON commits(work_id);
                ",
            )
            .context("Failed to create work tables")?;
        Ok(())
    }

    // ── Units ─────────────────────────────────────────────────────────

    pub fn create_unit(&self, new: &NewWorkUnit) -> Result<CreateOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin create_unit transaction")?;

        if let Some(group) = &new.related_works_id {
            let taken: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM work_units WHERE related_works_id = ?1 AND priority_order = ?2)",
                    params![group, new.priority_order],
                    |row| row.get(0),
                )
                .context("Failed to check priority_order uniqueness")?;
            if taken {
                return Ok(CreateOutcome::DuplicateOrder);
            }
        }

        let id = new
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tx.execute(
            "INSERT INTO work_units (id, priority_number, related_works_id, priority_order, scope_description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                new.priority_number,
                new.related_works_id,
                new.priority_order,
                new.scope_description,
                timestamp(&Utc::now()),
            ],
        )
        .context("Failed to insert work unit")?;

        let files: BTreeSet<String> = new
            .assigned_files
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| !p.is_empty())
            .collect();
        for path in &files {
            tx.execute(
                "INSERT INTO work_files (work_id, path) VALUES (?1, ?2)",
                params![id, path],
            )
            .context("Failed to insert work file")?;
        }
        tx.commit().context("Failed to commit create_unit")?;

        let unit = self
            .get_unit(&id)?
            .context("Work unit not found after insert")?;
        Ok(CreateOutcome::Created(unit))
    }

    pub fn get_unit(&self, id: &str) -> Result<Option<WorkUnit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_units w WHERE w.id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], UnitRow::from_row)
            .optional()
            .context("Failed to query work unit")?;
        row.map(UnitRow::into_unit).transpose()
    }

    pub fn list_units(&self, filter: &UnitFilter) -> Result<Vec<WorkUnit>> {
        let sql = format!(
            "SELECT {UNIT_COLUMNS} FROM work_units w
             WHERE (?1 IS NULL OR w.status = ?1)
               AND (?2 IS NULL OR w.related_works_id = ?2)
               AND (?3 IS NULL OR w.priority_number = ?3)
             ORDER BY w.priority_number, w.related_works_id, w.priority_order, w.created_at"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_units")?;
        let rows = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.related_works_id,
                    filter.priority_number,
                ],
                UnitRow::from_row,
            )
            .context("Failed to query work units")?;
        let mut units = Vec::new();
        for row in rows {
            units.push(row.context("Failed to read work unit row")?.into_unit()?);
        }
        Ok(units)
    }

    /// Groups with at least one pending unit, most urgent first.
    pub fn open_groups(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT related_works_id FROM work_units
                 WHERE status = 'pending' AND related_works_id IS NOT NULL
                 GROUP BY related_works_id
                 ORDER BY MIN(priority_number), MIN(priority_order), related_works_id",
            )
            .context("Failed to prepare open_groups")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query open groups")?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row.context("Failed to read group row")?);
        }
        Ok(groups)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM work_units GROUP BY status")
            .context("Failed to prepare status_counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query status counts")?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row.context("Failed to read status count row")?;
            let status: WorkStatus = status
                .parse()
                .map_err(|e: String| anyhow::anyhow!("invalid status in database: {}", e))?;
            counts.add(status, n as usize);
        }
        Ok(counts)
    }

    // ── Claiming and transitions ──────────────────────────────────────

    /// Claim the next eligible unit in one conditional update.
    pub fn claim_next(&self, worker: &str, group: Option<&str>) -> Result<Option<WorkUnit>> {
        let sql = format!(
            "UPDATE work_units
             SET status = 'claimed', claimed_by = ?3, claimed_at = ?4,
                 started_at = NULL, completed_at = NULL, attempts = attempts + 1
             WHERE id = ({ELIGIBLE_SQL}) AND status = 'pending'
             RETURNING id"
        );
        let claimed: Option<String> = self
            .conn
            .query_row(
                &sql,
                params![group, Option::<i64>::None, worker, timestamp(&Utc::now())],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to claim work unit")?;
        match claimed {
            Some(id) => self.get_unit(&id),
            None => Ok(None),
        }
    }

    /// The unit `claim_next` would pick inside a backlog entry. Read-only.
    pub fn next_for_priority(&self, priority_number: i64) -> Result<Option<WorkUnit>> {
        let id: Option<String> = self
            .conn
            .query_row(
                ELIGIBLE_SQL,
                params![Option::<String>::None, priority_number],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query next unit for priority")?;
        match id {
            Some(id) => self.get_unit(&id),
            None => Ok(None),
        }
    }

    pub fn mark_started(&self, id: &str) -> Result<Transition> {
        self.transition(
            id,
            WorkStatus::InProgress,
            "UPDATE work_units SET status = 'in_progress', started_at = COALESCE(started_at, ?2)
             WHERE id = ?1 AND status = 'claimed'",
            params![id, timestamp(&Utc::now())],
        )
    }

    pub fn mark_completed(&self, id: &str) -> Result<Transition> {
        self.transition(
            id,
            WorkStatus::Completed,
            "UPDATE work_units SET status = 'completed', completed_at = ?2
             WHERE id = ?1 AND status IN ('claimed', 'in_progress')",
            params![id, timestamp(&Utc::now())],
        )
    }

    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<Transition> {
        self.transition(
            id,
            WorkStatus::Failed,
            "UPDATE work_units SET status = 'failed', failure_reason = ?2
             WHERE id = ?1 AND status IN ('claimed', 'in_progress')",
            params![id, reason],
        )
    }

    /// Give an active unit back to the queue (cancellation, crash recovery).
    pub fn release_claim(&self, id: &str) -> Result<Transition> {
        self.transition(
            id,
            WorkStatus::Pending,
            "UPDATE work_units SET status = 'pending', claimed_by = NULL, claimed_at = NULL, started_at = NULL
             WHERE id = ?1 AND status IN ('claimed', 'in_progress')",
            params![id],
        )
    }

    /// Operator reset of a failed unit, with a fresh retry budget.
    pub fn reset_failed(&self, id: &str) -> Result<Transition> {
        self.transition(
            id,
            WorkStatus::Pending,
            "UPDATE work_units
             SET status = 'pending', claimed_by = NULL, claimed_at = NULL, started_at = NULL,
                 completed_at = NULL, failure_reason = NULL, attempts = 0
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )
    }

    /// Reset units stuck in `claimed` since before `cutoff`.
    pub fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkUnit>> {
        let ids: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare(
                    "UPDATE work_units SET status = 'pending', claimed_by = NULL, claimed_at = NULL
                     WHERE status = 'claimed' AND claimed_at < ?1
                     RETURNING id",
                )
                .context("Failed to prepare reclaim_stale")?;
            let rows = stmt
                .query_map(params![timestamp(&cutoff)], |row| row.get::<_, String>(0))
                .context("Failed to reclaim stale units")?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.context("Failed to read reclaimed id")?);
            }
            ids
        };
        let mut units = Vec::new();
        for id in ids {
            if let Some(unit) = self.get_unit(&id)? {
                units.push(unit);
            }
        }
        Ok(units)
    }

    fn transition(
        &self,
        id: &str,
        target: WorkStatus,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Transition> {
        let changed = self
            .conn
            .execute(sql, params)
            .with_context(|| format!("Failed to move work unit {} to {}", id, target))?;
        let Some(unit) = self.get_unit(id)? else {
            return Ok(Transition::Missing);
        };
        if changed > 0 {
            Ok(Transition::Applied(unit))
        } else if unit.status == target {
            Ok(Transition::Unchanged(unit))
        } else {
            Ok(Transition::Rejected(unit.status))
        }
    }

    // ── Commits ───────────────────────────────────────────────────────

    /// Append a commit; only units in progress or completed accept one.
    pub fn record_commit(
        &self,
        work_id: &str,
        commit_reference: &str,
        message: &str,
    ) -> Result<CommitOutcome> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO commits (work_id, commit_reference, message, committed_at)
                 SELECT id, ?2, ?3, ?4 FROM work_units
                 WHERE id = ?1 AND status IN ('in_progress', 'completed')",
                params![work_id, commit_reference, message, timestamp(&Utc::now())],
            )
            .context("Failed to insert commit")?;
        if inserted == 0 {
            return match self.get_unit(work_id)? {
                Some(unit) => Ok(CommitOutcome::Rejected(unit.status)),
                None => Ok(CommitOutcome::Missing),
            };
        }
        let id = self.conn.last_insert_rowid();
        let commit = self
            .get_commit(id)?
            .context("Commit not found after insert")?;
        Ok(CommitOutcome::Recorded(commit))
    }

    pub fn get_commit(&self, id: i64) -> Result<Option<Commit>> {
        let sql = format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], CommitRow::from_row)
            .optional()
            .context("Failed to query commit")?;
        row.map(CommitRow::into_commit).transpose()
    }

    pub fn commits_for(&self, work_id: &str) -> Result<Vec<Commit>> {
        let sql = format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE work_id = ?1 ORDER BY id");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare commits_for")?;
        let rows = stmt
            .query_map(params![work_id], CommitRow::from_row)
            .context("Failed to query commits")?;
        let mut commits = Vec::new();
        for row in rows {
            commits.push(row.context("Failed to read commit row")?.into_commit()?);
        }
        Ok(commits)
    }

    /// Attach review metadata, the only mutation a commit ever sees.
    pub fn attach_review(
        &self,
        commit_id: i64,
        reviewer: &str,
        status: ReviewStatus,
        notes: Option<&str>,
    ) -> Result<Option<Commit>> {
        let changed = self
            .conn
            .execute(
                "UPDATE commits SET reviewed_by = ?1, review_status = ?2, review_notes = ?3 WHERE id = ?4",
                params![reviewer, status.as_str(), notes, commit_id],
            )
            .context("Failed to attach review")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_commit(commit_id)
    }
}

// ── Row types ─────────────────────────────────────────────────────────

/// Fixed-width UTC timestamps so text comparison matches time order.
pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("corrupt timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

struct UnitRow {
    id: String,
    priority_number: i64,
    related_works_id: Option<String>,
    priority_order: i64,
    scope_description: String,
    status: String,
    claimed_by: Option<String>,
    claimed_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    attempts: i64,
    failure_reason: Option<String>,
    files: String,
}

impl UnitRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            priority_number: row.get(1)?,
            related_works_id: row.get(2)?,
            priority_order: row.get(3)?,
            scope_description: row.get(4)?,
            status: row.get(5)?,
            claimed_by: row.get(6)?,
            claimed_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            created_at: row.get(10)?,
            attempts: row.get(11)?,
            failure_reason: row.get(12)?,
            files: row.get(13)?,
        })
    }

    fn into_unit(self) -> Result<WorkUnit> {
        let assigned_files: BTreeSet<String> = serde_json::from_str(&self.files)
            .map_err(|e| anyhow::anyhow!("corrupt file list for {}: {}", self.id, e))?;
        Ok(WorkUnit {
            status: self
                .status
                .parse()
                .map_err(|e: String| anyhow::anyhow!("invalid status in database: {}", e))?,
            claimed_at: parse_optional_timestamp(self.claimed_at)?,
            started_at: parse_optional_timestamp(self.started_at)?,
            completed_at: parse_optional_timestamp(self.completed_at)?,
            created_at: parse_timestamp(&self.created_at)?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            id: self.id,
            priority_number: self.priority_number,
            related_works_id: self.related_works_id,
            priority_order: self.priority_order,
            scope_description: self.scope_description,
            assigned_files,
            claimed_by: self.claimed_by,
            failure_reason: self.failure_reason,
        })
    }
}

struct CommitRow {
    id: i64,
    work_id: String,
    commit_reference: String,
    message: String,
    committed_at: String,
    reviewed_by: Option<String>,
    review_status: Option<String>,
    review_notes: Option<String>,
}

impl CommitRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            work_id: row.get(1)?,
            commit_reference: row.get(2)?,
            message: row.get(3)?,
            committed_at: row.get(4)?,
            reviewed_by: row.get(5)?,
            review_status: row.get(6)?,
            review_notes: row.get(7)?,
        })
    }

    fn into_commit(self) -> Result<Commit> {
        let review_status = match self.review_status.as_deref() {
            Some(s) => Some(
                s.parse()
                    .map_err(|e: String| anyhow::anyhow!("invalid review status in database: {}", e))?,
            ),
            None => None,
        };
        Ok(Commit {
            id: self.id,
            work_id: self.work_id,
            commit_reference: self.commit_reference,
            message: self.message,
            committed_at: parse_timestamp(&self.committed_at)?,
            reviewed_by: self.reviewed_by,
            review_status,
            review_notes: self.review_notes,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
