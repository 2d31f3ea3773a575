//! Identity reconciliation: decide whether an observed tab is already
//! tracked, restored from an earlier lifetime, reopened, or brand new.
//!
//! # Decision order
//!
//! | Step | Lookup | Outcome |
//! |------|--------|---------|
//! | 1 | index < 0 | skipped (transient tab) |
//! | 2 | `current` by tab id | refresh fingerprint / index |
//! | 3 | `prev` by index + fingerprint | restored from last lifetime |
//! | 3 | `removed` by index + fingerprint | reopened in this lifetime |
//! | 4 | nothing matched | mint a new guid |
//! | 5 | after mint | shift later current indices by one |
//!
//! `prev` is searched before `removed` because unmatched `prev` entries are
//! lost for good, while `removed` ones can still be matched later.
//!
//! Fingerprint + index is a heuristic. Several candidates are tolerated: the
//! first in partition order wins and a warning is logged.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::guid::Guid;
use crate::host::TabId;
use crate::query::{Field, Op, Predicate};
use crate::record::{Observation, Partition, RecordStore, TabRecord};

/// Partitions searched for a returning identity, highest priority first.
pub const RESTORE_PRECEDENCE: [Partition; 2] = [Partition::Prev, Partition::Removed];

/// Result of reconciling one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reconciled {
    /// Tab has no real position yet; nothing was recorded.
    Skipped,
    /// History is still loading; the observation was buffered.
    Deferred,
    /// Already tracked under this tab id.
    Refreshed { guid: Guid, changed: bool },
    /// Identity pulled back from `prev` or `removed`.
    Restored {
        guid: Guid,
        from: Partition,
        candidates: usize,
    },
    /// New identity; `shifted` lists records whose index moved right.
    Minted { guid: Guid, shifted: Vec<Guid> },
}

impl Reconciled {
    #[must_use]
    pub fn guid(&self) -> Option<&Guid> {
        match self {
            Self::Skipped | Self::Deferred => None,
            Self::Refreshed { guid, .. } | Self::Restored { guid, .. } | Self::Minted { guid, .. } => {
                Some(guid)
            }
        }
    }

    /// True when `current` changed and must be persisted.
    #[must_use]
    pub fn mutated(&self) -> bool {
        match self {
            Self::Skipped | Self::Deferred => false,
            Self::Refreshed { changed, .. } => *changed,
            Self::Restored { .. } | Self::Minted { .. } => true,
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Deferred => "deferred",
            Self::Refreshed { .. } => "refreshed",
            Self::Restored {
                from: Partition::Prev,
                ..
            } => "restored",
            Self::Restored { .. } => "reopened",
            Self::Minted { .. } => "minted",
        }
    }
}

/// Find the single `current` record holding `tab_id`.
///
/// More than one holder means the host broke its uniqueness contract.
pub fn find_current(store: &RecordStore, tab_id: TabId) -> Result<Option<Guid>, RegistryError> {
    let mut hits = store.select(Partition::Current, &Predicate::new().tab_id(tab_id));
    match hits.len() {
        0 => Ok(None),
        1 => Ok(hits.pop()),
        count => {
            error!(%tab_id, count, "tab id held by several current records");
            Err(RegistryError::Inconsistent { tab_id, count })
        }
    }
}

/// Reconcile `observation` against the store, mutating it in place.
pub fn reconcile(
    store: &mut RecordStore,
    observation: &Observation,
) -> Result<Reconciled, RegistryError> {
    if !observation.is_placed() {
        debug!(tab_id = %observation.tab_id, index = observation.index, "unplaced tab, skipping");
        return Ok(Reconciled::Skipped);
    }

    if let Some(guid) = find_current(store, observation.tab_id)? {
        let Some(record) = store.get_mut(Partition::Current, &guid) else {
            return Ok(Reconciled::Skipped);
        };
        let changed =
            record.fingerprint != observation.fingerprint || record.index != observation.index;
        if changed {
            record.fingerprint.clone_from(&observation.fingerprint);
            record.index = observation.index;
        }
        debug!(%guid, tab_id = %observation.tab_id, changed, "refreshed known tab");
        return Ok(Reconciled::Refreshed { guid, changed });
    }

    let predicate = Predicate::new()
        .index(observation.index)
        .fingerprint(&observation.fingerprint);

    for partition in RESTORE_PRECEDENCE {
        let candidates = store.select(partition, &predicate);
        let Some(guid) = candidates.first().cloned() else {
            continue;
        };
        if candidates.len() > 1 {
            warn!(
                %guid,
                %partition,
                candidates = candidates.len(),
                index = observation.index,
                "ambiguous identity match, taking the first"
            );
        }

        if let Some(record) = store.move_record(&guid, partition, Partition::Current) {
            record.absorb(observation);
        }
        info!(%guid, tab_id = %observation.tab_id, from = %partition, "identity restored");
        return Ok(Reconciled::Restored {
            guid,
            from: partition,
            candidates: candidates.len(),
        });
    }

    let guid = mint_unique(store);
    store.put(Partition::Current, TabRecord::new(guid.clone(), observation));
    let shifted = shift_indices(store, observation.index, 1, Some(&guid));
    info!(
        %guid,
        tab_id = %observation.tab_id,
        index = observation.index,
        shifted = shifted.len(),
        "new identity"
    );
    Ok(Reconciled::Minted { guid, shifted })
}

fn mint_unique(store: &RecordStore) -> Guid {
    loop {
        let guid = Guid::generate();
        if store.locate(&guid).is_none() {
            return guid;
        }
    }
}

/// Add `delta` to the index of every placed `current` record whose index is
/// at least `from_index`, except `skip`. Returns the guids that moved.
pub fn shift_indices(
    store: &mut RecordStore,
    from_index: i64,
    delta: i64,
    skip: Option<&Guid>,
) -> Vec<Guid> {
    let mut predicate = Predicate::new().with(Field::Index, Op::Ge, from_index.max(0));
    if let Some(skip) = skip {
        predicate = predicate.with(Field::Guid, Op::Ne, skip);
    }

    let mut shifted = Vec::new();
    for record in store.all_mut(Partition::Current) {
        if predicate.matches(record) {
            record.index = (record.index + delta).max(0);
            shifted.push(record.guid.clone());
        }
    }
    shifted
}
