//! Write-through persistence of the `current` partition.
//!
//! # Data flow
//!
//! ```text
//! mutation (store locked) → Snapshot JSON → ordered channel → writer task → SnapshotStore
//! ```
//!
//! The snapshot is serialized while the record store is still locked and
//! queued on an unbounded FIFO, so writes reach the store in mutation order
//! without the caller waiting on I/O. A failed save is logged and counted;
//! the next mutation writes the full state again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::record::TabRecord;
use crate::store::StoreHandle;

/// Current schema version for persisted snapshots.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Persisted form of the `current` partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// When this snapshot was written (epoch ms).
    pub saved_at: u64,
    /// Records in partition order.
    pub records: Vec<TabRecord>,
}

impl Snapshot {
    #[must_use]
    pub fn new(records: Vec<TabRecord>) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            saved_at: epoch_ms(),
            records,
        }
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn from_json(blob: &str) -> Result<Self, StoreError> {
        let snapshot: Self =
            serde_json::from_str(blob).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(StoreError::Corrupt(format!(
                "snapshot schema {} is newer than supported {}",
                snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION
            )));
        }
        Ok(snapshot)
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

enum WriteOp {
    Save(String),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Counters describing the writer's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistStats {
    pub saves: u64,
    pub failed_saves: u64,
}

#[derive(Debug, Default)]
struct Counters {
    saves: AtomicU64,
    failed_saves: AtomicU64,
}

/// Bridge between the in-memory registry and its durable store.
pub struct PersistenceBridge {
    store: StoreHandle,
    key: String,
    tx: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl PersistenceBridge {
    /// Create the bridge and spawn its writer task on the current runtime.
    #[must_use]
    pub fn new(store: StoreHandle, key: impl Into<String>) -> Self {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let writer = tokio::spawn(run_writer(
            Arc::clone(&store),
            key.clone(),
            rx,
            Arc::clone(&counters),
        ));

        Self {
            store,
            key,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            counters,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the prior lifetime's records. Missing, unreadable or corrupt
    /// snapshots all yield an empty list.
    pub async fn load(&self) -> Vec<TabRecord> {
        let blob = match self.store.load(&self.key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!(key = %self.key, "no stored snapshot");
                return Vec::new();
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "snapshot load failed, starting empty");
                return Vec::new();
            }
        };

        match Snapshot::from_json(&blob) {
            Ok(snapshot) => {
                info!(
                    key = %self.key,
                    records = snapshot.records.len(),
                    saved_at = snapshot.saved_at,
                    "loaded snapshot"
                );
                snapshot.records
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "snapshot unreadable, starting empty");
                Vec::new()
            }
        }
    }

    /// Queue a write of `records` as the new snapshot.
    pub fn enqueue(&self, records: Vec<TabRecord>) {
        match Snapshot::new(records).to_json() {
            Ok(blob) => self.send(WriteOp::Save(blob)),
            Err(e) => {
                self.counters.failed_saves.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "snapshot serialization failed");
            }
        }
    }

    /// Queue deletion of the stored snapshot.
    pub fn enqueue_clear(&self) {
        self.send(WriteOp::Clear);
    }

    fn send(&self, op: WriteOp) {
        let guard = self.tx.lock();
        let sent = guard.as_ref().is_some_and(|tx| tx.send(op).is_ok());
        if !sent {
            debug!(key = %self.key, "writer closed, dropping snapshot write");
        }
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = {
            let guard = self.tx.lock();
            guard
                .as_ref()
                .is_some_and(|tx| tx.send(WriteOp::Flush(done_tx)).is_ok())
        };
        if sent {
            let _ = done_rx.await;
        }
    }

    /// Drain pending writes and stop the writer. Later writes are dropped.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "snapshot writer task failed");
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    #[must_use]
    pub fn stats(&self) -> PersistStats {
        PersistStats {
            saves: self.counters.saves.load(Ordering::Relaxed),
            failed_saves: self.counters.failed_saves.load(Ordering::Relaxed),
        }
    }
}

async fn run_writer(
    store: StoreHandle,
    key: String,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    counters: Arc<Counters>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(blob) => match store.save(&key, &blob).await {
                Ok(()) => {
                    counters.saves.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, bytes = blob.len(), "snapshot saved");
                }
                Err(e) => {
                    counters.failed_saves.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "snapshot save failed");
                }
            },
            WriteOp::Clear => {
                if let Err(e) = store.clear(&key).await {
                    counters.failed_saves.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "snapshot clear failed");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(key = %key, "snapshot writer stopped");
}
