//! Property-based tests for the registry.
//!
//! Covers guid uniqueness, partition exclusivity, tab id uniqueness in
//! `current`, fresh minting and index-shift correction over random
//! sequences of observations, closures and id replacements.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use tabguid_core::matcher::Reconciled;
use tabguid_core::record::Observation;
use tabguid_core::store::MemoryStore;
use tabguid_core::{Guid, Partition, TabId, TabRegistry};

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Observe { tab_id: i64, index: i64, fp: u8 },
    Close { tab_id: i64 },
    Replace { old: i64, new: i64 },
    Restart,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0i64..12, -1i64..6, 0u8..3)
            .prop_map(|(tab_id, index, fp)| Op::Observe { tab_id, index, fp }),
        3 => (0i64..12).prop_map(|tab_id| Op::Close { tab_id }),
        1 => (0i64..12, 0i64..12).prop_map(|(old, new)| Op::Replace { old, new }),
        1 => Just(Op::Restart),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

async fn boot(store: &Arc<MemoryStore>) -> Arc<TabRegistry> {
    let registry = TabRegistry::new(store.clone(), "TabRegistry");
    registry.start().await.expect("start");
    registry
}

fn check_invariants(registry: &TabRegistry) -> Result<(), TestCaseError> {
    let mut guids = HashSet::new();
    for partition in Partition::ALL {
        for record in registry.records(partition) {
            prop_assert!(
                guids.insert(record.guid.clone()),
                "guid {} present twice",
                record.guid
            );
            prop_assert_eq!(registry.locate(&record.guid), Some(partition));
        }
    }

    let mut tab_ids = HashSet::new();
    for record in registry.records(Partition::Current) {
        prop_assert!(
            tab_ids.insert(record.tab_id),
            "tab id {} held twice in current",
            record.tab_id
        );
    }
    Ok(())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_over_random_sequences(ops in prop::collection::vec(arb_op(), 1..60)) {
        let rt = runtime();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut registry = boot(&store).await;
            let mut seen: HashSet<Guid> = HashSet::new();

            for op in ops {
                match op {
                    Op::Observe { tab_id, index, fp } => {
                        let out = registry
                            .observe(Observation::new(tab_id, index, format!("fp-{fp}")))
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                        if let Reconciled::Minted { guid, .. } = &out {
                            prop_assert!(!seen.contains(guid), "minted guid {} reused", guid);
                        }
                        if let Some(guid) = out.guid() {
                            seen.insert(guid.clone());
                        }
                    }
                    Op::Close { tab_id } => {
                        registry
                            .remove_tab(TabId(tab_id))
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    }
                    Op::Replace { old, new } => {
                        registry
                            .replace_tab_id(TabId(old), TabId(new))
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                    }
                    Op::Restart => {
                        registry.shutdown().await;
                        registry = boot(&store).await;
                    }
                }
                check_invariants(&registry)?;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn insertion_shifts_exactly_the_later_indices(
        count in 1usize..8,
        insert_at in 0i64..8,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let registry = boot(&Arc::new(MemoryStore::new())).await;
            for i in 0..count as i64 {
                registry
                    .observe(Observation::new(i, i, format!("tab-{i}")))
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let before = registry.records(Partition::Current);

            let out = registry
                .observe(Observation::new(100, insert_at, "brand-new"))
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let new_guid = out.guid().cloned();
            prop_assert_eq!(out.label(), "minted");

            for old in &before {
                let now = registry
                    .records(Partition::Current)
                    .into_iter()
                    .find(|r| r.guid == old.guid)
                    .map(|r| r.index);
                let expected = if old.index >= insert_at { old.index + 1 } else { old.index };
                prop_assert_eq!(now, Some(expected));
            }
            prop_assert!(new_guid.is_some());
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn close_then_reopen_is_idempotent(
        count in 1usize..6,
        pick in 0usize..6,
        new_id in 50i64..60,
    ) {
        let pick = (pick % count) as i64;
        let rt = runtime();
        rt.block_on(async {
            let registry = boot(&Arc::new(MemoryStore::new())).await;
            for i in 0..count as i64 {
                registry
                    .observe(Observation::new(i, i, format!("tab-{i}")))
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let guid = registry
                .guid(TabId(pick))
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            registry
                .remove_tab(TabId(pick))
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let out = registry
                .observe(Observation::new(new_id, pick, format!("tab-{pick}")))
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            prop_assert_eq!(out.guid(), Some(&guid));
            prop_assert_eq!(registry.locate(&guid), Some(Partition::Current));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
