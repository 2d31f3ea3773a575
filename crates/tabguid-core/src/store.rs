//! Durable key-value stores for registry snapshots.
//!
//! The registry persists a single opaque blob under one key. Back-ends:
//!
//! - [`MemoryStore`]: process-local map (tests, ephemeral sessions)
//! - [`JsonFileStore`]: one file per key, atomic temp-file + rename
//! - [`SqliteStore`]: `kv` table in a WAL-mode SQLite database

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;

/// Future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Asynchronous single-blob persistence.
pub trait SnapshotStore: Send + Sync {
    /// Read the blob under `key`; `None` when nothing was ever saved.
    fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Replace the blob under `key`.
    fn save<'a>(&'a self, key: &'a str, blob: &'a str) -> StoreFuture<'a, ()>;

    /// Delete the blob under `key`, if any.
    fn clear<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
}

/// Shared handle to a snapshot store.
pub type StoreHandle = Arc<dyn SnapshotStore>;

/// Build the store described by `config`.
pub fn open_store(config: &StoreConfig) -> Result<StoreHandle, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::JsonFile => {
            let dir = config.path.clone().unwrap_or_else(default_store_dir);
            Ok(Arc::new(JsonFileStore::new(dir)))
        }
        StoreBackend::Sqlite => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| default_store_dir().join("tabguid.db"));
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}

/// `$XDG_DATA_HOME/tabguid`, or `./.tabguid` when no data dir is known.
#[must_use]
pub fn default_store_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from(".tabguid"), |d| d.join("tabguid"))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Memory
// =============================================================================

/// Process-local store. Survives registry restarts within one process,
/// which is how tests simulate a host restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, String>>,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_saves.store(failing, Ordering::SeqCst);
    }

    /// Current blob under `key`, bypassing the async interface.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        self.blobs.lock().get(key).cloned()
    }

    /// Seed a blob directly.
    pub fn insert(&self, key: &str, blob: impl Into<String>) {
        self.blobs.lock().insert(key.to_string(), blob.into());
    }
}

impl SnapshotStore for MemoryStore {
    fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.peek(key)) })
    }

    fn save<'a>(&'a self, key: &'a str, blob: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Database("memory store set to fail".to_string()));
            }
            self.insert(key, blob);
            Ok(())
        })
    }

    fn clear<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.blobs.lock().remove(key);
            Ok(())
        })
    }
}

// =============================================================================
// JSON file
// =============================================================================

/// One `<key>.json` file per key under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File backing `key`. Characters outside `[A-Za-z0-9_-]` become `_`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl SnapshotStore for JsonFileStore {
    fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let path = self.path_for(key);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(Some(content)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_err(&path, e)),
            }
        })
    }

    fn save<'a>(&'a self, key: &'a str, blob: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key);
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| io_err(&self.dir, e))?;

            let tmp_path = path.with_extension("json.tmp");
            tokio::fs::write(&tmp_path, blob)
                .await
                .map_err(|e| io_err(&tmp_path, e))?;
            tokio::fs::rename(&tmp_path, &path)
                .await
                .map_err(|e| io_err(&path, e))?;
            debug!(path = %path.display(), bytes = blob.len(), "snapshot written");
            Ok(())
        })
    }

    fn clear<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(&path, e)),
            }
        })
    }
}

// =============================================================================
// SQLite
// =============================================================================

/// Key-value table in a SQLite database. Each operation opens its own
/// connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database and its `kv` table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        let conn = open_conn(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self { path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_conn(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

fn open_conn(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

impl SnapshotStore for SqliteStore {
    fn load<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        let key = key.to_string();
        Box::pin(self.with_conn(move |conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [&key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?;
            Ok(value)
        }))
    }

    fn save<'a>(&'a self, key: &'a str, blob: &'a str) -> StoreFuture<'a, ()> {
        let key = key.to_string();
        let blob = blob.to_string();
        Box::pin(self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                rusqlite::params![key, blob, now_ms()],
            )?;
            Ok(())
        }))
    }

    fn clear<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        let key = key.to_string();
        Box::pin(self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [&key])?;
            Ok(())
        }))
    }
}
