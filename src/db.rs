//! Async access to the synchronous SQLite stores.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Async-safe handle to a store that owns a SQLite connection.
///
/// Wraps the store behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
pub struct DbHandle<T> {
    inner: Arc<std::sync::Mutex<T>>,
}

impl<T> Clone for DbHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> DbHandle<T> {
    pub fn new(store: T) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R, E>(&self, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&T) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let store = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| E::from(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| E::from(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

/// Open a file-backed connection tuned for several processes sharing it.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set busy timeout")?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    let _mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .context("Failed to enable WAL journal mode")?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")
        .context("Failed to set connection pragmas")?;
    Ok(conn)
}

/// Open an in-memory connection (tests and dry runs).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("Failed to enable foreign keys")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_runs_closure_against_store() -> Result<()> {
        let handle = DbHandle::new(std::sync::atomic::AtomicU32::new(1));
        let value: u32 = handle
            .call(|c| {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, anyhow::Error>(c.load(std::sync::atomic::Ordering::SeqCst))
            })
            .await?;
        assert_eq!(value, 2);
        Ok(())
    }

    #[test]
    fn open_connection_creates_parent_and_enables_wal() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("nested").join("store.db");
        let conn = open_connection(&path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
        Ok(())
    }
}
