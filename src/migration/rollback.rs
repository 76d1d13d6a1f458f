//! Audited, reversible disabling of feature flags.
//!
//! Every rollback and re-enable appends one [`RollbackEvent`]; events are
//! never edited. The flags a rollback disabled stay "outstanding" until a
//! re-enable covering them restores exactly those flags.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::flags::{FlagDocument, FlagKey, FlagStore};
use super::journal::Journal;
use crate::errors::FlagError;

type Result<T> = std::result::Result<T, FlagError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Rollback,
    ReEnable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum Scope {
    Role(String),
    Phase(u32),
    System,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Role(role) => write!(f, "role {}", role),
            Scope::Phase(n) => write!(f, "phase {}", n),
            Scope::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub scope: Scope,
    pub reason: String,
    /// In the order they were applied.
    pub flags: Vec<FlagKey>,
    /// A rollback that disabled something can be reversed by `re_enable`.
    pub reversible: bool,
    pub timestamp: DateTime<Utc>,
}

/// A flag disabled by a rollback that has not been re-enabled yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outstanding {
    pub flag: FlagKey,
    pub event_id: Uuid,
}

/// Rollbacks and re-enables run under the flag file's exclusive lock. The
/// event is journaled before the flag document is replaced, so a flag is
/// never disabled without an event that can restore it.
pub struct RollbackManager {
    flags: Arc<FlagStore>,
    journal: Journal<RollbackEvent>,
}

impl RollbackManager {
    pub fn new(flags: Arc<FlagStore>, journal: Journal<RollbackEvent>) -> Self {
        Self { flags, journal }
    }

    pub fn journal(&self) -> &Journal<RollbackEvent> {
        &self.journal
    }

    /// Disable `role` and every role that transitively depends on it.
    pub fn rollback_role(&self, role: &str, reason: &str) -> Result<RollbackEvent> {
        self.rollback(Scope::Role(role.to_string()), reason)
    }

    /// Disable every role of the phase, plus roles depending on them.
    pub fn rollback_phase(&self, number: u32, reason: &str) -> Result<RollbackEvent> {
        self.rollback(Scope::Phase(number), reason)
    }

    pub fn rollback_all(&self, reason: &str) -> Result<RollbackEvent> {
        self.rollback(Scope::System, reason)
    }

    pub fn re_enable_role(&self, role: &str, reason: &str) -> Result<RollbackEvent> {
        self.re_enable(Scope::Role(role.to_string()), reason)
    }

    /// Restore the outstanding flags covered by `scope`, dependencies first.
    pub fn re_enable(&self, scope: Scope, reason: &str) -> Result<RollbackEvent> {
        let (_, event) = self.flags.update_recorded(
            |doc| {
                let in_scope = roles_in_scope(doc, &scope)?;
                let outstanding: BTreeSet<FlagKey> =
                    self.outstanding()?.into_iter().map(|o| o.flag).collect();
                let mut restored = Vec::new();
                for role in doc.dependency_order()? {
                    if !in_scope.contains(&role) {
                        continue;
                    }
                    for key in doc.keys_for_role(&role)? {
                        if outstanding.contains(&key) {
                            doc.set(&key, true)?;
                            restored.push(key);
                        }
                    }
                }
                Ok(new_event(EventKind::ReEnable, scope, reason, restored, false))
            },
            |event| self.journal.append(event).map_err(FlagError::Journal),
        )?;
        info!(scope = %event.scope, flags = event.flags.len(), reason, "Flags re-enabled");
        Ok(event)
    }

    /// Every event, oldest first.
    pub fn history(&self) -> Result<Vec<RollbackEvent>> {
        self.journal.read_all().map_err(FlagError::Journal)
    }

    /// Flags disabled by a rollback and not re-enabled since, replayed from
    /// the journal.
    pub fn outstanding(&self) -> Result<Vec<Outstanding>> {
        let mut open: BTreeMap<FlagKey, Uuid> = BTreeMap::new();
        for event in self.history()? {
            match event.kind {
                EventKind::Rollback => {
                    for flag in event.flags {
                        open.insert(flag, event.id);
                    }
                }
                EventKind::ReEnable => {
                    for flag in &event.flags {
                        open.remove(flag);
                    }
                }
            }
        }
        Ok(open
            .into_iter()
            .map(|(flag, event_id)| Outstanding { flag, event_id })
            .collect())
    }

    fn rollback(&self, scope: Scope, reason: &str) -> Result<RollbackEvent> {
        let (_, event) = self.flags.update_recorded(
            |doc| {
                let in_scope = roles_in_scope(doc, &scope)?;
                let mut disabled = Vec::new();
                // Dependents first; within a role, operations before the switch.
                for role in doc.dependency_order()?.into_iter().rev() {
                    if !in_scope.contains(&role) {
                        continue;
                    }
                    let mut keys = doc.keys_for_role(&role)?;
                    keys.rotate_left(1);
                    for key in keys {
                        if doc.get(&key) == Some(true) {
                            doc.set(&key, false)?;
                            disabled.push(key);
                        }
                    }
                }
                let reversible = !disabled.is_empty();
                Ok(new_event(EventKind::Rollback, scope, reason, disabled, reversible))
            },
            |event| self.journal.append(event).map_err(FlagError::Journal),
        )?;

        if event.flags.is_empty() {
            info!(scope = %event.scope, reason, "Rollback found nothing enabled");
        } else {
            warn!(scope = %event.scope, flags = event.flags.len(), reason, "Flags rolled back");
        }
        Ok(event)
    }
}

fn new_event(
    kind: EventKind,
    scope: Scope,
    reason: &str,
    flags: Vec<FlagKey>,
    reversible: bool,
) -> RollbackEvent {
    RollbackEvent {
        id: Uuid::new_v4(),
        kind,
        scope,
        reason: reason.to_string(),
        flags,
        reversible,
        timestamp: Utc::now(),
    }
}

fn roles_in_scope(doc: &FlagDocument, scope: &Scope) -> Result<BTreeSet<String>> {
    match scope {
        Scope::Role(role) => {
            if !doc.roles.contains_key(role) {
                return Err(FlagError::UnknownRole(role.clone()));
            }
            Ok(doc.with_dependents(std::slice::from_ref(role)))
        }
        Scope::Phase(n) => {
            let roles = doc.phase(*n)?.roles.clone();
            Ok(doc.with_dependents(&roles))
        }
        Scope::System => Ok(doc.roles.keys().cloned().collect()),
    }
}
