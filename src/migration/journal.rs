use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Append-only JSON-lines log of `T` records.
pub struct Journal<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line. The whole line goes out in one
    /// write under an exclusive lock so concurrent appenders never interleave.
    pub fn append(&self, record: &T) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create journal dir: {}", dir.display()))?;
        }
        let mut line = serde_json::to_vec(record).context("Failed to serialize journal entry")?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal: {}", self.path.display()))?;
        file.lock_exclusive()
            .context("Failed to lock journal")?;
        let written = file
            .write_all(&line)
            .and_then(|_| file.sync_data())
            .context("Failed to write journal entry");
        let _ = FileExt::unlock(&file);
        written
    }

    /// Every record in append order. A torn final line (crash mid-append) is
    /// skipped; corruption anywhere else is an error.
    pub fn read_all(&self) -> Result<Vec<T>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read journal: {}", self.path.display()));
            }
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) if idx + 1 == lines.len() && !content.ends_with('\n') => {
                    warn!(path = %self.path.display(), error = %e, "Skipping torn journal entry");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Corrupt journal entry {} in {}", idx + 1, self.path.display())
                    });
                }
            }
        }
        Ok(records)
    }

    /// Write every record to `dest` as a pretty JSON array. Returns the count.
    pub fn export_to(&self, dest: &Path) -> Result<usize> {
        let records = self.read_all()?;
        let json = serde_json::to_string_pretty(&records).context("Failed to serialize export")?;
        if let Some(dir) = dest.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create export dir: {}", dir.display()))?;
        }
        fs::write(dest, json).with_context(|| format!("Failed to write export: {}", dest.display()))?;
        Ok(records.len())
    }
}
