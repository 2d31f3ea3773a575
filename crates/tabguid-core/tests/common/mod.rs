//! Shared test infrastructure for tabguid-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::Harness;
//! ```

#![allow(dead_code)]

use std::sync::Arc;

use tabguid_core::host::{MockFingerprints, MockHost, content_fingerprint};
use tabguid_core::matcher::Reconciled;
use tabguid_core::registry::TabRegistry;
use tabguid_core::router::{Dispatch, EventRouter, HostEvent, RemoveInfo, RouterConfig};
use tabguid_core::store::MemoryStore;
use tabguid_core::{Guid, Partition, TabId, TabRecord};

pub const KEY: &str = "TabRegistry";

/// Fingerprint a page would report for `url` with no referrer.
pub fn fp(url: &str) -> String {
    content_fingerprint(url, "", 1)
}

/// One host process lifetime wired to a store that outlives it.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub host: Arc<MockHost>,
    pub fingerprints: Arc<MockFingerprints>,
    pub router: EventRouter,
}

impl Harness {
    /// Fresh store, started registry.
    pub async fn new() -> Self {
        Self::boot(Arc::new(MemoryStore::new())).await
    }

    /// New lifetime over an existing store, started.
    pub async fn boot(store: Arc<MemoryStore>) -> Self {
        let harness = Self::unstarted(store);
        harness.registry().start().await.expect("start");
        harness
    }

    /// New lifetime whose history has not been loaded yet.
    pub fn unstarted(store: Arc<MemoryStore>) -> Self {
        let registry = TabRegistry::new(store.clone(), KEY);
        let host = Arc::new(MockHost::new());
        let fingerprints = Arc::new(MockFingerprints::new());
        let router = EventRouter::new(
            registry,
            host.clone(),
            fingerprints.clone(),
            RouterConfig::default(),
        );
        Self {
            store,
            host,
            fingerprints,
            router,
        }
    }

    pub fn registry(&self) -> &Arc<TabRegistry> {
        self.router.registry()
    }

    /// Open a tab in the host and deliver its `created` event.
    pub async fn open(&mut self, tab_id: i64, index: i64, url: &str) -> Reconciled {
        self.fingerprints.set(tab_id, fp(url));
        let tab = self.host.open(tab_id, index, url);
        match self.router.dispatch(HostEvent::Created { tab }).await {
            Ok(Dispatch::Reconciled(outcome)) => outcome,
            other => panic!("unexpected dispatch for tab {tab_id}: {other:?}"),
        }
    }

    /// Close a tab and wait out the removal grace delay.
    pub async fn close(&mut self, tab_id: i64) -> Vec<TabRecord> {
        self.host.close(tab_id);
        self.fingerprints.forget(tab_id);
        self.router
            .dispatch(HostEvent::Removed {
                tab_id: TabId(tab_id),
                info: RemoveInfo::default(),
            })
            .await
            .expect("removed");
        self.router.settle().await
    }

    /// Shut this lifetime down, as the host does on exit.
    pub async fn shutdown(self) -> Arc<MemoryStore> {
        self.registry().shutdown().await;
        self.store
    }

    /// Shut down and boot a new lifetime over the same store.
    pub async fn restart(self) -> Self {
        let store = self.shutdown().await;
        Self::boot(store).await
    }

    pub fn index_of(&self, guid: &Guid) -> Option<i64> {
        self.registry()
            .records(Partition::Current)
            .into_iter()
            .find(|record| &record.guid == guid)
            .map(|record| record.index)
    }
}
