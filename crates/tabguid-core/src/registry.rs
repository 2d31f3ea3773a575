//! The tab identity registry service.
//!
//! One [`TabRegistry`] exists per host process. It owns the record store,
//! runs reconciliation and mirrors every change to `current` through the
//! [`PersistenceBridge`].
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► start() ──► observe()/refresh/replace/retire ... ──► shutdown()
//!   │          │
//!   │          └─ load prior snapshot into `prev` (once), replay buffered
//!   └─ observations before start() are buffered, oldest first
//! ```
//!
//! Every method takes the store lock only for synchronous work, so handlers
//! interleaving at await points always see a consistent store and must look
//! records up again rather than reuse what they saw before suspending.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attributes::Attributes;
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::guid::Guid;
use crate::host::{TabId, TabInfo};
use crate::matcher::{self, Reconciled};
use crate::persist::PersistenceBridge;
use crate::record::{Observation, Partition, RecordStore, TabRecord};
use crate::store::{StoreHandle, open_store};

/// Running counters for registry activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub minted: u64,
    pub restored: u64,
    pub reopened: u64,
    pub refreshed: u64,
    pub ambiguous: u64,
    pub deferred: u64,
    pub skipped: u64,
    pub replaced: u64,
    pub retired: u64,
    pub abandoned: u64,
    pub saves: u64,
    pub failed_saves: u64,
}

impl RegistryStats {
    fn count(&mut self, outcome: &Reconciled) {
        match outcome {
            Reconciled::Skipped => self.skipped += 1,
            Reconciled::Deferred => self.deferred += 1,
            Reconciled::Refreshed { .. } => self.refreshed += 1,
            Reconciled::Restored {
                from, candidates, ..
            } => {
                if *from == Partition::Prev {
                    self.restored += 1;
                } else {
                    self.reopened += 1;
                }
                if *candidates > 1 {
                    self.ambiguous += 1;
                }
            }
            Reconciled::Minted { .. } => self.minted += 1,
        }
    }
}

/// What `start()` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// Records loaded into `prev`.
    pub loaded: usize,
    /// Outcomes of the buffered observations, oldest first.
    pub replayed: Vec<Reconciled>,
}

/// Where a closed tab's identity stands when its removal arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closing {
    /// Current record to retire.
    Tracked(Guid),
    /// The tab was only buffered; this many observations were dropped.
    Discarded(usize),
    Untracked,
}

#[derive(Debug, Default)]
struct State {
    records: RecordStore,
    stats: RegistryStats,
}

impl State {
    /// Move a current record to `removed` and close the gap it leaves.
    fn retire(&mut self, guid: &Guid) -> Option<TabRecord> {
        let retired = self
            .records
            .move_record(guid, Partition::Current, Partition::Removed)
            .cloned()?;
        if retired.index >= 0 {
            matcher::shift_indices(&mut self.records, retired.index + 1, -1, None);
        }
        self.stats.retired += 1;
        Some(retired)
    }
}

/// Durable tab identity registry.
pub struct TabRegistry {
    state: Mutex<State>,
    bridge: PersistenceBridge,
    starting: AtomicBool,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for TabRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabRegistry")
            .field("key", &self.bridge.key())
            .field("started", &self.is_started())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl TabRegistry {
    /// Create a registry persisting under `key`. Must be called inside a
    /// tokio runtime (the snapshot writer is spawned here).
    #[must_use]
    pub fn new(store: StoreHandle, key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            bridge: PersistenceBridge::new(store, key),
            starting: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Create a registry with the store described by `config`.
    pub fn from_config(config: &RegistryConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let store = open_store(&config.store)?;
        Ok(Self::new(store, config.storage_key.clone()))
    }

    /// Load the prior snapshot into `prev` and replay buffered observations.
    ///
    /// Only the first call does anything; later calls return `Ok(None)`.
    /// A consistency violation during replay stops it; changes already made
    /// are still persisted before the error is returned.
    pub async fn start(&self) -> Result<Option<StartReport>> {
        if self.starting.swap(true, Ordering::SeqCst) {
            debug!("registry already started");
            return Ok(None);
        }

        let history = self.bridge.load().await;

        let mut state = self.state.lock();
        let loaded = state.records.load_prev(history).unwrap_or(0);
        let pending = state.records.take_pending();

        let mut replayed = Vec::with_capacity(pending.len());
        let mut mutated = false;
        let mut failure = None;
        for (position, observation) in pending.iter().enumerate() {
            match matcher::reconcile(&mut state.records, observation) {
                Ok(outcome) => {
                    state.stats.count(&outcome);
                    mutated |= outcome.mutated();
                    replayed.push(outcome);
                }
                Err(e) if e.is_fatal() => {
                    warn!(
                        tab_id = %observation.tab_id,
                        dropped = pending.len() - position - 1,
                        error = %e,
                        "replay stopped"
                    );
                    failure = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(tab_id = %observation.tab_id, error = %e, "replay skipped one");
                }
            }
        }
        if mutated {
            self.persist(&state);
        }
        if let Some(e) = failure {
            return Err(e.into());
        }

        info!(loaded, replayed = replayed.len(), "registry started");
        Ok(Some(StartReport { loaded, replayed }))
    }

    /// Reconcile one observed tab, returning what happened to it.
    pub fn observe(&self, observation: Observation) -> Result<Reconciled> {
        let mut state = self.state.lock();

        if observation.tab_id.is_none() || !observation.is_placed() {
            debug!(
                tab_id = %observation.tab_id,
                index = observation.index,
                "placeholder or unplaced tab, ignoring"
            );
            state.stats.count(&Reconciled::Skipped);
            return Ok(Reconciled::Skipped);
        }

        if !state.records.is_prev_loaded() {
            debug!(tab_id = %observation.tab_id, "history not loaded yet, buffering");
            state.records.push_pending(observation);
            state.stats.count(&Reconciled::Deferred);
            return Ok(Reconciled::Deferred);
        }

        let outcome = matcher::reconcile(&mut state.records, &observation)?;
        state.stats.count(&outcome);
        if outcome.mutated() {
            self.persist(&state);
        }
        debug!(
            tab_id = %observation.tab_id,
            outcome = outcome.label(),
            fingerprint_len = observation.fingerprint.len(),
            "observation reconciled"
        );
        Ok(outcome)
    }

    /// Update the fingerprint of the tab holding `tab_id`.
    ///
    /// Returns `None` when no current record holds it.
    pub fn refresh_fingerprint(&self, tab_id: TabId, fingerprint: &str) -> Result<Option<Guid>> {
        let mut state = self.state.lock();
        let Some(guid) = matcher::find_current(&state.records, tab_id)? else {
            return Ok(None);
        };

        let changed = match state.records.get_mut(Partition::Current, &guid) {
            Some(record) if record.fingerprint != fingerprint => {
                record.fingerprint = fingerprint.to_string();
                true
            }
            _ => false,
        };
        state.stats.refreshed += 1;
        if changed {
            self.persist(&state);
        }
        Ok(Some(guid))
    }

    /// Rewrite the volatile id of the tab holding `old` to `new`.
    ///
    /// Before history loads, buffered observations of `old` are re-keyed
    /// instead and `None` is returned.
    pub fn replace_tab_id(&self, old: TabId, new: TabId) -> Result<Option<Guid>> {
        let mut state = self.state.lock();
        let Some(guid) = matcher::find_current(&state.records, old)? else {
            if !state.records.is_prev_loaded() {
                let moved = state.records.rekey_pending(old, new);
                if moved > 0 {
                    debug!(old = %old, new = %new, moved, "buffered observations re-keyed");
                }
            }
            return Ok(None);
        };

        if old != new {
            if let Some(stale) = matcher::find_current(&state.records, new)? {
                if stale != guid {
                    warn!(
                        tab_id = %new,
                        guid = %stale,
                        "replacement id already tracked, retiring stale record"
                    );
                    state.retire(&stale);
                }
            }
        }

        if let Some(record) = state.records.get_mut(Partition::Current, &guid) {
            record.tab_id = new;
        }
        state.stats.replaced += 1;
        self.persist(&state);
        info!(%guid, old = %old, new = %new, "tab id replaced");
        Ok(Some(guid))
    }

    /// Guid of the current record holding `tab_id`, if any.
    pub fn lookup_tab(&self, tab_id: TabId) -> Result<Option<Guid>> {
        let state = self.state.lock();
        Ok(matcher::find_current(&state.records, tab_id)?)
    }

    /// Move a closed tab to `removed`, provided `guid` is still current and
    /// still carries `tab_id`, then close the gap it leaves in the indices.
    pub fn retire(&self, guid: &Guid, tab_id: TabId) -> Option<TabRecord> {
        let mut state = self.state.lock();

        let index = match state.records.get(Partition::Current, guid) {
            Some(record) if record.tab_id == tab_id => record.index,
            Some(_) => {
                debug!(%guid, %tab_id, "tab id changed before removal, keeping record");
                return None;
            }
            None => {
                debug!(%guid, %tab_id, "record no longer current, nothing to retire");
                return None;
            }
        };

        let retired = state.retire(guid)?;
        self.persist(&state);
        info!(%guid, %tab_id, index, "tab closed");
        Some(retired)
    }

    /// Resolve a closed tab id to the record it should retire.
    ///
    /// Before history loads, the tab may exist only as buffered
    /// observations; those are dropped so replay cannot resurrect it.
    pub fn closing(&self, tab_id: TabId) -> Result<Closing> {
        let mut state = self.state.lock();
        if let Some(guid) = matcher::find_current(&state.records, tab_id)? {
            return Ok(Closing::Tracked(guid));
        }
        if state.records.is_prev_loaded() {
            return Ok(Closing::Untracked);
        }
        match state.records.discard_pending(tab_id) {
            0 => Ok(Closing::Untracked),
            dropped => {
                debug!(
                    %tab_id,
                    dropped,
                    "closed before history loaded, buffered observations dropped"
                );
                Ok(Closing::Discarded(dropped))
            }
        }
    }

    /// Retire the tab holding `tab_id` immediately.
    pub fn remove_tab(&self, tab_id: TabId) -> Result<Option<TabRecord>> {
        match self.closing(tab_id)? {
            Closing::Tracked(guid) => Ok(self.retire(&guid, tab_id)),
            Closing::Discarded(_) | Closing::Untracked => Ok(None),
        }
    }

    /// Set each current record's index to what the host reports for its
    /// tab id. Returns how many records changed.
    pub fn sync_indices(&self, tabs: &[TabInfo]) -> usize {
        let by_id: HashMap<TabId, i64> = tabs
            .iter()
            .filter(|tab| tab.is_placed())
            .map(|tab| (tab.tab_id, tab.index))
            .collect();

        let mut state = self.state.lock();
        let mut changed = 0;
        for record in state.records.all_mut(Partition::Current) {
            if let Some(&index) = by_id.get(&record.tab_id) {
                if record.index != index {
                    record.index = index;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.persist(&state);
            debug!(changed, "indices synced from host");
        }
        changed
    }

    /// Guid of the open tab with volatile id `tab_id`.
    pub fn guid(&self, tab_id: TabId) -> Result<Guid> {
        self.lookup_tab(tab_id)?
            .ok_or_else(|| RegistryError::TabNotFound(tab_id).into())
    }

    /// Volatile id of the open tab identified by `guid`.
    pub fn id(&self, guid: &Guid) -> Result<TabId> {
        self.read_record(guid, |record| record.tab_id)
    }

    /// Annotation access for open tabs.
    #[must_use]
    pub fn attributes(&self) -> Attributes<'_> {
        Attributes::new(self)
    }

    /// Clear every partition and delete the stored snapshot.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        self.bridge.enqueue_clear();
        warn!("registry reset");
    }

    /// Copy of the records in `partition`, in partition order.
    #[must_use]
    pub fn records(&self, partition: Partition) -> Vec<TabRecord> {
        self.state.lock().records.all(partition).cloned().collect()
    }

    #[must_use]
    pub fn len(&self, partition: Partition) -> usize {
        self.state.lock().records.len(partition)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().records.pending_len()
    }

    /// Which partition holds `guid`.
    #[must_use]
    pub fn locate(&self, guid: &Guid) -> Option<Partition> {
        self.state.lock().records.locate(guid)
    }

    /// True once the prior snapshot has been loaded.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.lock().records.is_prev_loaded()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = self.state.lock().stats;
        let persisted = self.bridge.stats();
        stats.saves = persisted.saves;
        stats.failed_saves = persisted.failed_saves;
        stats
    }

    /// Wait for every queued snapshot write to be attempted.
    pub async fn flush(&self) {
        self.bridge.flush().await;
    }

    /// Stop accepting removals, drop unmatched history and stop the writer.
    ///
    /// Returns the abandoned `prev` records; their identities are lost.
    pub async fn shutdown(&self) -> Vec<TabRecord> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let abandoned = {
            let mut state = self.state.lock();
            let abandoned = state.records.abandon_prev();
            state.stats.abandoned += abandoned.len() as u64;
            abandoned
        };
        if !abandoned.is_empty() {
            info!(count = abandoned.len(), "unmatched history abandoned");
        }

        self.bridge.shutdown().await;
        info!("registry shut down");
        abandoned
    }

    pub(crate) fn read_record<T>(&self, guid: &Guid, f: impl FnOnce(&TabRecord) -> T) -> Result<T> {
        let state = self.state.lock();
        state
            .records
            .get(Partition::Current, guid)
            .map(f)
            .ok_or_else(|| RegistryError::GuidNotFound(guid.clone()).into())
    }

    /// Mutate a current record; `f` reports whether anything changed.
    pub(crate) fn update_record<T>(
        &self,
        guid: &Guid,
        f: impl FnOnce(&mut TabRecord) -> (T, bool),
    ) -> Result<T> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(Partition::Current, guid)
            .ok_or_else(|| RegistryError::GuidNotFound(guid.clone()))?;
        let (value, changed) = f(record);
        if changed {
            self.persist(&state);
        }
        Ok(value)
    }

    fn persist(&self, state: &State) {
        self.bridge.enqueue(state.records.current_records());
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, partition: Partition, record: TabRecord) {
        self.state.lock().records.put(partition, record);
    }
}
