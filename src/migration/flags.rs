//! Persisted feature flags gating the new implementation per role and
//! operation.
//!
//! The whole flag set is one JSON document. Writers take an exclusive lock
//! on a sidecar file, back up the current document, and replace it with an
//! atomic rename; readers only ever see complete snapshots. Every read
//! checks the file's stamp, so a change written by another store or process
//! is visible at the next gate check.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::FlagError;

type Result<T> = std::result::Result<T, FlagError>;

/// Static description of one worker role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleLayout {
    #[serde(default)]
    pub operations: Vec<String>,
    /// Roles that must be enabled for this one to work.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A rollout phase groups roles that are enabled together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseLayout {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlagLayout {
    #[serde(default)]
    pub phases: Vec<PhaseLayout>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleLayout>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleFlags {
    pub enabled: bool,
    #[serde(default)]
    pub operations: BTreeMap<String, bool>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A role switch (`operation: None`) or one operation of a role.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlagKey {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl FlagKey {
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            operation: None,
        }
    }

    pub fn operation(role: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            operation: Some(operation.into()),
        }
    }
}

impl fmt::Display for FlagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operation {
            Some(op) => write!(f, "{}.{}", self.role, op),
            None => f.write_str(&self.role),
        }
    }
}

impl FromStr for FlagKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (role, op) = match s.split_once('.') {
            Some((role, op)) => (role, Some(op)),
            None => (s, None),
        };
        if role.is_empty() || op.is_some_and(str::is_empty) {
            return Err(format!("Invalid flag key '{}': expected role or role.operation", s));
        }
        Ok(Self {
            role: role.to_string(),
            operation: op.map(str::to_string),
        })
    }
}

/// The persisted flag set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagDocument {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub phases: Vec<PhaseLayout>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleFlags>,
}

impl FlagDocument {
    /// Everything disabled.
    pub fn from_layout(layout: &FlagLayout) -> Self {
        let mut doc = Self {
            version: 0,
            updated_at: Utc::now(),
            phases: Vec::new(),
            roles: BTreeMap::new(),
        };
        doc.reconcile(layout);
        doc
    }

    /// Adopt the layout's roles, operations, dependencies and phases while
    /// keeping existing switch values. Returns whether anything changed.
    pub fn reconcile(&mut self, layout: &FlagLayout) -> bool {
        let before = (self.phases.clone(), self.roles.clone());
        for (name, role) in &layout.roles {
            let entry = self.roles.entry(name.clone()).or_default();
            for op in &role.operations {
                entry.operations.entry(op.clone()).or_insert(false);
            }
            entry.depends_on = role.depends_on.clone();
        }
        let mut phases = layout.phases.clone();
        phases.sort_by_key(|p| p.number);
        self.phases = phases;
        (self.phases.clone(), self.roles.clone()) != before
    }

    /// Effective state: the role switch and, for operations, the operation
    /// switch must both be on.
    pub fn is_enabled(&self, role: &str, operation: Option<&str>) -> bool {
        let Some(flags) = self.roles.get(role) else {
            return false;
        };
        match operation {
            None => flags.enabled,
            Some(op) => flags.enabled && flags.operations.get(op).copied().unwrap_or(false),
        }
    }

    /// Raw value of a single switch.
    pub fn get(&self, key: &FlagKey) -> Option<bool> {
        let flags = self.roles.get(&key.role)?;
        match &key.operation {
            None => Some(flags.enabled),
            Some(op) => flags.operations.get(op).copied(),
        }
    }

    /// Set one switch. Returns whether its value changed.
    pub fn set(&mut self, key: &FlagKey, value: bool) -> Result<bool> {
        let flags = self
            .roles
            .get_mut(&key.role)
            .ok_or_else(|| FlagError::UnknownRole(key.role.clone()))?;
        let slot = match &key.operation {
            None => &mut flags.enabled,
            Some(op) => flags
                .operations
                .get_mut(op)
                .ok_or_else(|| FlagError::UnknownOperation {
                    role: key.role.clone(),
                    operation: op.clone(),
                })?,
        };
        let changed = *slot != value;
        *slot = value;
        Ok(changed)
    }

    /// Switch key first, then operation keys.
    pub fn keys_for_role(&self, role: &str) -> Result<Vec<FlagKey>> {
        let flags = self
            .roles
            .get(role)
            .ok_or_else(|| FlagError::UnknownRole(role.to_string()))?;
        let mut keys = vec![FlagKey::role(role)];
        keys.extend(flags.operations.keys().map(|op| FlagKey::operation(role, op)));
        Ok(keys)
    }

    /// Switches currently on (raw values, not effective state).
    pub fn enabled_keys(&self) -> BTreeSet<FlagKey> {
        let mut keys = BTreeSet::new();
        for (role, flags) in &self.roles {
            if flags.enabled {
                keys.insert(FlagKey::role(role));
            }
            for (op, on) in &flags.operations {
                if *on {
                    keys.insert(FlagKey::operation(role, op));
                }
            }
        }
        keys
    }

    pub fn phase(&self, number: u32) -> Result<&PhaseLayout> {
        self.phases
            .iter()
            .find(|p| p.number == number)
            .ok_or(FlagError::UnknownPhase(number))
    }

    /// All roles, every dependency before its dependents.
    pub fn dependency_order(&self) -> Result<Vec<String>> {
        fn visit(
            doc: &FlagDocument,
            role: &str,
            done: &mut BTreeSet<String>,
            stack: &mut Vec<String>,
            out: &mut Vec<String>,
        ) -> Result<()> {
            if done.contains(role) {
                return Ok(());
            }
            if stack.iter().any(|r| r == role) {
                return Err(FlagError::DependencyCycle(role.to_string()));
            }
            stack.push(role.to_string());
            if let Some(flags) = doc.roles.get(role) {
                for dep in &flags.depends_on {
                    visit(doc, dep, done, stack, out)?;
                }
            }
            stack.pop();
            done.insert(role.to_string());
            if doc.roles.contains_key(role) {
                out.push(role.to_string());
            }
            Ok(())
        }

        let mut done = BTreeSet::new();
        let mut out = Vec::new();
        for role in self.roles.keys() {
            visit(self, role, &mut done, &mut Vec::new(), &mut out)?;
        }
        Ok(out)
    }

    /// `roles` plus every role that transitively depends on one of them.
    pub fn with_dependents(&self, roles: &[String]) -> BTreeSet<String> {
        let mut closure: BTreeSet<String> = roles.iter().cloned().collect();
        loop {
            let mut grew = false;
            for (name, flags) in &self.roles {
                if !closure.contains(name) && flags.depends_on.iter().any(|d| closure.contains(d)) {
                    closure.insert(name.clone());
                    grew = true;
                }
            }
            if !grew {
                return closure;
            }
        }
    }
}

/// Identity of one version of the flag file. Writes always rename a fresh
/// file into place, so any write changes the stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(&meta),
        })
    }
}

struct Cached {
    doc: Arc<FlagDocument>,
    stamp: Option<FileStamp>,
}

/// File-backed flag store shared by the wrapper and rollback manager.
pub struct FlagStore {
    path: PathBuf,
    lock_path: PathBuf,
    backup_dir: PathBuf,
    retain: usize,
    current: RwLock<Cached>,
}

impl FlagStore {
    /// Open the document at `path`, creating it from `layout` if missing.
    /// Roles and operations new to the layout are added disabled.
    pub fn open(path: &Path, layout: &FlagLayout, retain_backups: usize) -> Result<Self> {
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(|source| FlagError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flags.json".to_string());
        let store = Self {
            path: path.to_path_buf(),
            lock_path: dir.join(format!(".{}.lock", file_name)),
            backup_dir: dir.join("backups"),
            retain: retain_backups,
            current: RwLock::new(Cached {
                doc: Arc::new(FlagDocument::from_layout(layout)),
                stamp: None,
            }),
        };

        let _guard = store.lock_file()?;
        match store.read_disk()? {
            Some(mut doc) => {
                if doc.reconcile(layout) {
                    store.write_locked(&mut doc)?;
                }
                store.install(doc)?;
            }
            None => {
                let mut doc = FlagDocument::from_layout(layout);
                store.write_locked(&mut doc)?;
                store.install(doc)?;
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document, re-read when the file changed since the last
    /// read. A file that cannot be read keeps the last good document.
    pub fn snapshot(&self) -> Arc<FlagDocument> {
        let stamp = FileStamp::of(&self.path);
        let cached = self.cached();
        if stamp.is_none() || stamp == cached.1 {
            return cached.0;
        }
        // Writers rename complete files into place, so no lock is needed.
        match self.read_disk() {
            Ok(Some(doc)) => {
                debug!(path = %self.path.display(), version = doc.version, "Flag document changed on disk");
                self.install_stamped(doc, stamp).unwrap_or(cached.0)
            }
            Ok(None) => cached.0,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to re-read flag document; keeping last snapshot");
                cached.0
            }
        }
    }

    fn cached(&self) -> (Arc<FlagDocument>, Option<FileStamp>) {
        let read = |c: &Cached| (Arc::clone(&c.doc), c.stamp);
        match self.current.read() {
            Ok(c) => read(&c),
            Err(poisoned) => read(&poisoned.into_inner()),
        }
    }

    pub fn is_enabled(&self, role: &str, operation: Option<&str>) -> bool {
        self.snapshot().is_enabled(role, operation)
    }

    pub fn enabled_keys(&self) -> BTreeSet<FlagKey> {
        self.snapshot().enabled_keys()
    }

    pub fn set(&self, key: &FlagKey, value: bool) -> Result<Arc<FlagDocument>> {
        let doc = self.update(|doc| {
            doc.set(key, value)?;
            Ok(())
        })?;
        info!(flag = %key, value, version = doc.version, "Flag set");
        Ok(doc)
    }

    /// Turn on a role's switch and all of its operations.
    pub fn enable_role(&self, role: &str) -> Result<Arc<FlagDocument>> {
        let doc = self.update(|doc| {
            for key in doc.keys_for_role(role)? {
                doc.set(&key, true)?;
            }
            Ok(())
        })?;
        info!(role, version = doc.version, "Role enabled");
        Ok(doc)
    }

    /// Enable every role of a phase, dependencies first.
    pub fn enable_phase(&self, number: u32) -> Result<Arc<FlagDocument>> {
        let doc = self.update(|doc| {
            let roles: BTreeSet<String> = doc.phase(number)?.roles.iter().cloned().collect();
            for role in doc.dependency_order()? {
                if roles.contains(&role) {
                    for key in doc.keys_for_role(&role)? {
                        doc.set(&key, true)?;
                    }
                }
            }
            Ok(())
        })?;
        info!(phase = number, version = doc.version, "Phase enabled");
        Ok(doc)
    }

    /// Read-modify-write under the exclusive file lock, starting from the
    /// latest document on disk.
    pub fn update<F>(&self, f: F) -> Result<Arc<FlagDocument>>
    where
        F: FnOnce(&mut FlagDocument) -> Result<()>,
    {
        self.update_recorded(f, |_| Ok(())).map(|(doc, ())| doc)
    }

    /// [`update`](Self::update) with a `record` step that runs after `f`
    /// and before the write, still under the lock. When `f` or `record`
    /// fails the file is left untouched.
    pub fn update_recorded<R, F, C>(&self, f: F, record: C) -> Result<(Arc<FlagDocument>, R)>
    where
        F: FnOnce(&mut FlagDocument) -> Result<R>,
        C: FnOnce(&R) -> Result<()>,
    {
        let _guard = self.lock_file()?;
        let mut doc = match self.read_disk()? {
            Some(doc) => doc,
            None => (*self.cached().0).clone(),
        };
        let out = f(&mut doc)?;
        record(&out)?;
        self.write_locked(&mut doc)?;
        Ok((self.install(doc)?, out))
    }

    /// Pick up changes written by another process.
    pub fn reload(&self) -> Result<Arc<FlagDocument>> {
        let _guard = self.lock_file()?;
        match self.read_disk()? {
            Some(doc) => self.install(doc),
            None => Ok(self.cached().0),
        }
    }

    /// Backups, oldest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.backup_dir)
            .map_err(|source| FlagError::Io {
                path: self.backup_dir.clone(),
                source,
            })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    fn lock_file(&self) -> Result<FileLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| self.io_err(&self.lock_path, source))?;
        file.lock_exclusive()
            .map_err(|source| self.io_err(&self.lock_path, source))?;
        Ok(FileLock(file))
    }

    fn read_disk(&self) -> Result<Option<FlagDocument>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.io_err(&self.path, source)),
        }
    }

    /// Caller holds the file lock.
    fn write_locked(&self, doc: &mut FlagDocument) -> Result<()> {
        doc.version += 1;
        doc.updated_at = Utc::now();

        if self.path.exists() {
            self.backup_current(doc.version - 1)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(doc)?;
        {
            let mut file = File::create(&tmp).map_err(|source| self.io_err(&tmp, source))?;
            file.write_all(&content)
                .map_err(|source| self.io_err(&tmp, source))?;
            file.sync_all().map_err(|source| self.io_err(&tmp, source))?;
        }
        fs::rename(&tmp, &self.path).map_err(|source| self.io_err(&self.path, source))?;
        debug!(path = %self.path.display(), version = doc.version, "Flag document written");
        Ok(())
    }

    fn backup_current(&self, version: u64) -> Result<()> {
        fs::create_dir_all(&self.backup_dir)
            .map_err(|source| self.io_err(&self.backup_dir, source))?;
        let name = format!(
            "flags-{}-v{:06}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
            version
        );
        let dest = self.backup_dir.join(name);
        fs::copy(&self.path, &dest).map_err(|source| self.io_err(&dest, source))?;

        let backups = self.backups()?;
        if backups.len() > self.retain {
            for old in &backups[..backups.len() - self.retain] {
                fs::remove_file(old).map_err(|source| self.io_err(old, source))?;
            }
        }
        Ok(())
    }

    fn install(&self, doc: FlagDocument) -> Result<Arc<FlagDocument>> {
        self.install_stamped(doc, FileStamp::of(&self.path))
    }

    fn install_stamped(&self, doc: FlagDocument, stamp: Option<FileStamp>) -> Result<Arc<FlagDocument>> {
        let doc = Arc::new(doc);
        let mut current = self.current.write().map_err(|_| FlagError::LockPoisoned)?;
        *current = Cached {
            doc: Arc::clone(&doc),
            stamp,
        };
        Ok(doc)
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> FlagError {
        FlagError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Holds the exclusive lock until dropped.
struct FileLock(File);

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}
