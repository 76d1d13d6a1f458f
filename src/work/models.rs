use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Claimed or in progress: the unit holds its group and its files.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Claimed | Self::InProgress)
    }

    pub fn all() -> [WorkStatus; 5] {
        [
            Self::Pending,
            Self::Claimed,
            Self::InProgress,
            Self::Completed,
            Self::Failed,
        ]
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid work status: {}", s)),
        }
    }
}

/// A trackable piece of implementation work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkUnit {
    pub id: String,
    /// Backlog entry this unit belongs to.
    pub priority_number: i64,
    /// Units sharing this id run strictly in `priority_order`.
    pub related_works_id: Option<String>,
    pub priority_order: i64,
    pub scope_description: String,
    /// Paths this unit may modify; overlapping sets never run concurrently.
    pub assigned_files: BTreeSet<String>,
    pub status: WorkStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Number of times the unit has been claimed.
    pub attempts: u32,
    pub failure_reason: Option<String>,
}

impl WorkUnit {
    /// Group key used for scheduling; ungrouped units are their own group.
    pub fn group_key(&self) -> String {
        self.related_works_id
            .clone()
            .unwrap_or_else(|| format!("unit:{}", self.id))
    }

    /// Files this unit shares with `other`.
    pub fn overlapping_files(&self, other: &BTreeSet<String>) -> Vec<String> {
        self.assigned_files.intersection(other).cloned().collect()
    }
}

/// Input for creating a work unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkUnit {
    /// Explicit id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub priority_number: i64,
    #[serde(default)]
    pub related_works_id: Option<String>,
    pub priority_order: i64,
    #[serde(default)]
    pub scope_description: String,
    #[serde(default)]
    pub assigned_files: Vec<String>,
}

impl NewWorkUnit {
    pub fn new(priority_number: i64, priority_order: i64) -> Self {
        Self {
            priority_number,
            priority_order,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.related_works_id = Some(group.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope_description = scope.into();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assigned_files = files.into_iter().map(Into::into).collect();
        self
    }
}

/// Normalise a path so `./src/a.rs` and `src/a.rs` collide.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut p = trimmed.replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    while p.contains("//") {
        p = p.replace("//", "/");
    }
    p.trim_end_matches('/').to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    ChangesRequested,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid review status: {}", s)),
        }
    }
}

/// A commit recorded against a work unit. Append-only apart from review data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    pub id: i64,
    pub work_id: String,
    pub commit_reference: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub review_notes: Option<String>,
}

/// Filter for listing work units.
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    pub status: Option<WorkStatus>,
    pub related_works_id: Option<String>,
    pub priority_number: Option<i64>,
}

/// Unit counts per status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub claimed: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: WorkStatus, n: usize) {
        match status {
            WorkStatus::Pending => self.pending += n,
            WorkStatus::Claimed => self.claimed += n,
            WorkStatus::InProgress => self.in_progress += n,
            WorkStatus::Completed => self.completed += n,
            WorkStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.in_progress + self.completed + self.failed
    }

    /// Work that could still finish: pending or active.
    pub fn open(&self) -> usize {
        self.pending + self.claimed + self.in_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_forms_parse_back() {
        for status in WorkStatus::all() {
            assert_eq!(status.as_str().parse::<WorkStatus>(), Ok(status));
        }
        assert!("running".parse::<WorkStatus>().is_err());
    }

    #[test]
    fn normalize_path_strips_dot_prefix_and_duplicate_slashes() {
        assert_eq!(normalize_path("./src//lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path(" docs/ "), "docs");
        assert_eq!(normalize_path("a\\b.txt"), "a/b.txt");
    }

    #[test]
    fn ungrouped_units_get_a_private_group_key() {
        let unit = WorkUnit {
            id: "wu-9".into(),
            priority_number: 1,
            related_works_id: None,
            priority_order: 1,
            scope_description: String::new(),
            assigned_files: BTreeSet::new(),
            status: WorkStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            attempts: 0,
            failure_reason: None,
        };
        assert_eq!(unit.group_key(), "unit:wu-9");
    }

    #[test]
    fn status_counts_open_excludes_terminal() {
        let mut counts = StatusCounts::default();
        counts.add(WorkStatus::Pending, 2);
        counts.add(WorkStatus::InProgress, 1);
        counts.add(WorkStatus::Completed, 4);
        assert_eq!(counts.open(), 3);
        assert_eq!(counts.total(), 7);
    }
}
