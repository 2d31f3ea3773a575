//! Identity records and the three-partition record store.
//!
//! ```text
//!            start()                    reconcile
//!   snapshot ───────► prev ─────────────────────────┐
//!                                                   ▼
//!   (new tab) ──────────────── mint ──────────► current ◄──┐
//!                                                   │      │ reopen
//!                                           close   ▼      │
//!                                               removed ───┘
//! ```
//!
//! A guid lives in at most one partition. `prev` is filled once and only
//! drains; `removed` is fed only from `current` and only drains back into it.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::RegistryError;
use crate::guid::Guid;
use crate::host::TabId;

/// Per-tab annotations, keyed by name.
pub type AttributeMap = BTreeMap<String, Value>;

/// Identity record for one logical tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabRecord {
    pub guid: Guid,
    /// Volatile host id for the tab's current lifetime.
    pub tab_id: TabId,
    /// Position among open tabs; negative means not placed yet.
    pub index: i64,
    /// Content fingerprint at last observation.
    pub fingerprint: String,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl TabRecord {
    #[must_use]
    pub fn new(guid: Guid, observation: &Observation) -> Self {
        Self {
            guid,
            tab_id: observation.tab_id,
            index: observation.index,
            fingerprint: observation.fingerprint.clone(),
            attributes: AttributeMap::new(),
        }
    }

    /// Overwrite the volatile fields with a fresh observation.
    pub fn absorb(&mut self, observation: &Observation) {
        self.tab_id = observation.tab_id;
        self.index = observation.index;
        self.fingerprint.clone_from(&observation.fingerprint);
    }
}

/// What the host showed us about a tab at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub tab_id: TabId,
    pub index: i64,
    pub fingerprint: String,
}

impl Observation {
    #[must_use]
    pub fn new(tab_id: i64, index: i64, fingerprint: impl Into<String>) -> Self {
        Self {
            tab_id: TabId(tab_id),
            index,
            fingerprint: fingerprint.into(),
        }
    }

    #[must_use]
    pub fn is_placed(&self) -> bool {
        self.index >= 0
    }
}

/// One of the three record sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Tabs open in this process lifetime.
    Current,
    /// Tabs closed in this process lifetime.
    Removed,
    /// Tabs open at the end of the previous lifetime, not yet matched.
    Prev,
}

impl Partition {
    pub const ALL: [Self; 3] = [Self::Current, Self::Removed, Self::Prev];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Removed => "removed",
            Self::Prev => "prev",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Partition {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(Self::Current),
            "removed" => Ok(Self::Removed),
            "prev" => Ok(Self::Prev),
            other => Err(RegistryError::InvalidPartition(other.to_string())),
        }
    }
}

/// Partitioned record storage plus the pre-start registration buffer.
///
/// Partitions keep insertion order, which is the order ambiguity tie-breaks
/// and snapshots use.
#[derive(Debug, Default)]
pub struct RecordStore {
    current: IndexMap<Guid, TabRecord>,
    removed: IndexMap<Guid, TabRecord>,
    prev: IndexMap<Guid, TabRecord>,
    prev_loaded: bool,
    pending: VecDeque<Observation>,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, partition: Partition) -> &IndexMap<Guid, TabRecord> {
        match partition {
            Partition::Current => &self.current,
            Partition::Removed => &self.removed,
            Partition::Prev => &self.prev,
        }
    }

    fn map_mut(&mut self, partition: Partition) -> &mut IndexMap<Guid, TabRecord> {
        match partition {
            Partition::Current => &mut self.current,
            Partition::Removed => &mut self.removed,
            Partition::Prev => &mut self.prev,
        }
    }

    #[must_use]
    pub fn get(&self, partition: Partition, guid: &Guid) -> Option<&TabRecord> {
        self.map(partition).get(guid)
    }

    pub fn get_mut(&mut self, partition: Partition, guid: &Guid) -> Option<&mut TabRecord> {
        self.map_mut(partition).get_mut(guid)
    }

    /// Insert or overwrite a record.
    ///
    /// The caller guarantees the guid is not held by another partition and
    /// that `prev` is only filled through [`RecordStore::load_prev`].
    pub fn put(&mut self, partition: Partition, record: TabRecord) {
        debug_assert!(partition != Partition::Prev, "prev is write-once");
        debug_assert!(
            self.locate(&record.guid).is_none_or(|p| p == partition),
            "guid {} already held by another partition",
            record.guid
        );
        self.map_mut(partition).insert(record.guid.clone(), record);
    }

    pub fn remove(&mut self, partition: Partition, guid: &Guid) -> Option<TabRecord> {
        self.map_mut(partition).shift_remove(guid)
    }

    /// Transfer a record between partitions, returning it in its new home.
    ///
    /// Runs under the caller's exclusive borrow, so no observer can see the
    /// record missing from every partition.
    pub fn move_record(
        &mut self,
        guid: &Guid,
        from: Partition,
        to: Partition,
    ) -> Option<&mut TabRecord> {
        debug_assert!(to != Partition::Prev, "prev is write-once");
        let record = self.map_mut(from).shift_remove(guid)?;
        let target = self.map_mut(to);
        target.insert(guid.clone(), record);
        target.get_mut(guid)
    }

    pub fn all(&self, partition: Partition) -> impl Iterator<Item = &TabRecord> {
        self.map(partition).values()
    }

    pub(crate) fn all_mut(&mut self, partition: Partition) -> impl Iterator<Item = &mut TabRecord> {
        self.map_mut(partition).values_mut()
    }

    #[must_use]
    pub fn len(&self, partition: Partition) -> usize {
        self.map(partition).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        Partition::ALL.iter().all(|p| self.map(*p).is_empty())
    }

    /// Which partition currently holds `guid`.
    #[must_use]
    pub fn locate(&self, guid: &Guid) -> Option<Partition> {
        Partition::ALL
            .into_iter()
            .find(|p| self.map(*p).contains_key(guid))
    }

    /// Fill `prev` from the prior lifetime's snapshot. Only the first call
    /// has any effect; returns the number of records accepted.
    pub fn load_prev(&mut self, records: Vec<TabRecord>) -> Option<usize> {
        if self.prev_loaded {
            return None;
        }
        self.prev_loaded = true;

        for record in records {
            if let Some(holder) = self.locate(&record.guid) {
                warn!(
                    guid = %record.guid,
                    partition = %holder,
                    "snapshot record already tracked, dropping"
                );
                continue;
            }
            self.prev.insert(record.guid.clone(), record);
        }
        Some(self.prev.len())
    }

    #[must_use]
    pub fn is_prev_loaded(&self) -> bool {
        self.prev_loaded
    }

    /// Drop every unmatched `prev` record; their identities are lost.
    pub fn abandon_prev(&mut self) -> Vec<TabRecord> {
        self.prev.drain(..).map(|(_, record)| record).collect()
    }

    pub fn push_pending(&mut self, observation: Observation) {
        self.pending.push_back(observation);
    }

    /// Take the buffered registrations, oldest first.
    pub fn take_pending(&mut self) -> Vec<Observation> {
        self.pending.drain(..).collect()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop buffered registrations for `tab_id`; returns how many.
    pub fn discard_pending(&mut self, tab_id: TabId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|observation| observation.tab_id != tab_id);
        before - self.pending.len()
    }

    /// Point buffered registrations for `old` at `new`; returns how many.
    pub fn rekey_pending(&mut self, old: TabId, new: TabId) -> usize {
        let mut moved = 0;
        for observation in self.pending.iter_mut().filter(|o| o.tab_id == old) {
            observation.tab_id = new;
            moved += 1;
        }
        moved
    }

    /// Forget every record and buffered registration.
    pub fn clear(&mut self) {
        self.current.clear();
        self.removed.clear();
        self.prev.clear();
        self.pending.clear();
    }

    /// Records in `current`, in insertion order, for persistence.
    #[must_use]
    pub fn current_records(&self) -> Vec<TabRecord> {
        self.current.values().cloned().collect()
    }
}
