//! Host event routing.
//!
//! Translates tab manager notifications into registry operations:
//!
//! | Event | Action |
//! |---|---|
//! | created | fingerprint, then reconcile |
//! | updated | same as created, only on load completion or navigation |
//! | moved / attached / detached | re-read every index from the host |
//! | removed | retire after the grace delay, or drop it if still buffered |
//! | replaced | rewrite the volatile id in place (buffered ones too) |
//! | content report | refresh the fingerprint, or reconcile if unknown |
//!
//! Fingerprint and host queries are suspension points. Anything looked up
//! before one is looked up again after it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::RegistryConfig;
use crate::error::Result;
use crate::guid::Guid;
use crate::host::{FingerprintHandle, HostHandle, TabId, TabInfo, resolve_fingerprint};
use crate::matcher::Reconciled;
use crate::record::{Observation, TabRecord};
use crate::registry::{Closing, TabRegistry};

// =============================================================================
// Events
// =============================================================================

/// Page load state carried by update notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loading,
    Complete,
}

/// What changed in an update notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeInfo {
    pub status: Option<LoadStatus>,
    pub url: Option<String>,
}

impl ChangeInfo {
    /// Only a finished load or a navigation can change the fingerprint.
    #[must_use]
    pub fn affects_content(&self) -> bool {
        self.status == Some(LoadStatus::Complete) || self.url.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveInfo {
    /// The whole window is closing with this tab.
    pub window_closing: bool,
}

/// A notification from the host tab manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    Created {
        tab: TabInfo,
    },
    Updated {
        tab_id: TabId,
        #[serde(default)]
        change: ChangeInfo,
        tab: TabInfo,
    },
    Moved {
        tab_id: TabId,
    },
    Attached {
        tab_id: TabId,
    },
    Detached {
        tab_id: TabId,
    },
    Removed {
        tab_id: TabId,
        #[serde(default)]
        info: RemoveInfo,
    },
    /// The host swapped a tab's id, e.g. promoting a prerendered page.
    Replaced {
        added: TabId,
        removed: TabId,
    },
    /// Fingerprint pushed by the page itself.
    ContentReport {
        tab_id: TabId,
        fingerprint: String,
    },
}

impl HostEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Moved { .. } => "moved",
            Self::Attached { .. } => "attached",
            Self::Detached { .. } => "detached",
            Self::Removed { .. } => "removed",
            Self::Replaced { .. } => "replaced",
            Self::ContentReport { .. } => "content_report",
        }
    }

    /// The tab the event is about (the new id for replacements).
    #[must_use]
    pub fn tab_id(&self) -> TabId {
        match self {
            Self::Created { tab } => tab.tab_id,
            Self::Updated { tab_id, .. }
            | Self::Moved { tab_id }
            | Self::Attached { tab_id }
            | Self::Detached { tab_id }
            | Self::Removed { tab_id, .. }
            | Self::ContentReport { tab_id, .. } => *tab_id,
            Self::Replaced { added, .. } => *added,
        }
    }
}

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Placeholder tab, irrelevant update or vanished tab.
    Ignored,
    Reconciled(Reconciled),
    IndicesSynced { changed: usize },
    /// Retirement will run after the grace delay.
    RemovalScheduled { guid: Guid },
    /// Closed tab was never tracked.
    Untracked,
    /// Closed before history loaded; its buffered observations were dropped.
    Discarded { buffered: usize },
    Replaced { guid: Option<Guid> },
    FingerprintRefreshed { guid: Guid },
}

// =============================================================================
// Router
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    pub removal_grace: Duration,
    pub sync_indices_after_insert: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for RouterConfig {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            removal_grace: config.removal_grace(),
            sync_indices_after_insert: config.sync_indices_after_insert,
        }
    }
}

/// Feeds host events into a [`TabRegistry`].
pub struct EventRouter {
    registry: Arc<TabRegistry>,
    host: HostHandle,
    fingerprints: FingerprintHandle,
    config: RouterConfig,
    removals: JoinSet<Option<TabRecord>>,
}

impl EventRouter {
    #[must_use]
    pub fn new(
        registry: Arc<TabRegistry>,
        host: HostHandle,
        fingerprints: FingerprintHandle,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            host,
            fingerprints,
            config,
            removals: JoinSet::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TabRegistry> {
        &self.registry
    }

    /// Removals still waiting out their grace delay.
    #[must_use]
    pub fn pending_removals(&self) -> usize {
        self.removals.len()
    }

    /// Handle one event.
    pub async fn dispatch(&mut self, event: HostEvent) -> Result<Dispatch> {
        trace!(event = event.name(), tab_id = %event.tab_id(), "dispatching");

        match event {
            HostEvent::Created { tab } => self.observe_tab(tab).await,
            HostEvent::Updated { change, tab, .. } => {
                if change.affects_content() {
                    self.observe_tab(tab).await
                } else {
                    Ok(Dispatch::Ignored)
                }
            }
            HostEvent::Moved { .. } | HostEvent::Attached { .. } | HostEvent::Detached { .. } => {
                Ok(self.sync_indices().await)
            }
            HostEvent::Removed { tab_id, info } => self.schedule_removal(tab_id, info),
            HostEvent::Replaced { added, removed } => {
                let guid = self.registry.replace_tab_id(removed, added)?;
                Ok(Dispatch::Replaced { guid })
            }
            HostEvent::ContentReport {
                tab_id,
                fingerprint,
            } => self.content_report(tab_id, fingerprint).await,
        }
    }

    /// Dispatch events until the channel closes, then wait for scheduled
    /// removals. Stops at the first consistency violation.
    pub async fn run(&mut self, mut events: mpsc::Receiver<HostEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            let name = event.name();
            match self.dispatch(event).await {
                Ok(outcome) => trace!(event = name, ?outcome, "event handled"),
                Err(e) if e.is_fatal() => {
                    error!(event = name, error = %e, "registry inconsistent, stopping router");
                    return Err(e);
                }
                Err(e) => warn!(event = name, error = %e, "event handling failed"),
            }

            while let Some(done) = self.removals.try_join_next() {
                if let Err(e) = done {
                    warn!(error = %e, "removal task failed");
                }
            }
        }

        self.settle().await;
        debug!("event stream closed");
        Ok(())
    }

    /// Wait for every scheduled removal; returns the records retired.
    pub async fn settle(&mut self) -> Vec<TabRecord> {
        let mut retired = Vec::new();
        while let Some(done) = self.removals.join_next().await {
            match done {
                Ok(Some(record)) => retired.push(record),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "removal task failed"),
            }
        }
        retired
    }

    async fn observe_tab(&self, tab: TabInfo) -> Result<Dispatch> {
        if tab.tab_id.is_none() {
            debug!(tab_id = %tab.tab_id, "placeholder tab, ignoring");
            return Ok(Dispatch::Ignored);
        }

        let fingerprint = resolve_fingerprint(self.fingerprints.as_ref(), &tab).await;

        // The tab may have moved or closed while the fingerprint was fetched.
        let tab = match self.host.get(tab.tab_id).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                debug!(tab_id = %tab.tab_id, "tab closed before it was observed");
                return Ok(Dispatch::Ignored);
            }
            Err(e) => {
                warn!(tab_id = %tab.tab_id, error = %e, "tab lookup failed, using event data");
                tab
            }
        };

        self.reconcile(Observation {
            tab_id: tab.tab_id,
            index: tab.index,
            fingerprint,
        })
        .await
    }

    async fn reconcile(&self, observation: Observation) -> Result<Dispatch> {
        let outcome = self.registry.observe(observation)?;
        if matches!(outcome, Reconciled::Minted { .. }) && self.config.sync_indices_after_insert {
            self.sync_indices().await;
        }
        Ok(Dispatch::Reconciled(outcome))
    }

    async fn sync_indices(&self) -> Dispatch {
        match self.host.query_all().await {
            Ok(tabs) => Dispatch::IndicesSynced {
                changed: self.registry.sync_indices(&tabs),
            },
            Err(e) => {
                warn!(error = %e, "host query failed, indices left as they are");
                Dispatch::Ignored
            }
        }
    }

    fn schedule_removal(&mut self, tab_id: TabId, info: RemoveInfo) -> Result<Dispatch> {
        if tab_id.is_none() || self.registry.is_shutting_down() {
            return Ok(Dispatch::Ignored);
        }
        let guid = match self.registry.closing(tab_id)? {
            Closing::Tracked(guid) => guid,
            Closing::Discarded(buffered) => return Ok(Dispatch::Discarded { buffered }),
            Closing::Untracked => {
                debug!(%tab_id, "closed tab was not tracked");
                return Ok(Dispatch::Untracked);
            }
        };

        debug!(
            %tab_id,
            %guid,
            window_closing = info.window_closing,
            grace_ms = self.config.removal_grace.as_millis() as u64,
            "removal scheduled"
        );

        let registry = Arc::clone(&self.registry);
        let grace = self.config.removal_grace;
        let target = guid.clone();
        self.removals.spawn(async move {
            tokio::time::sleep(grace).await;
            if registry.is_shutting_down() {
                info!(%tab_id, guid = %target, "host shutting down, keeping tab for restore");
                return None;
            }
            registry.retire(&target, tab_id)
        });

        Ok(Dispatch::RemovalScheduled { guid })
    }

    async fn content_report(&self, tab_id: TabId, fingerprint: String) -> Result<Dispatch> {
        if tab_id.is_none() {
            debug!(%tab_id, "content report from placeholder tab, ignoring");
            return Ok(Dispatch::Ignored);
        }

        if let Some(guid) = self.registry.refresh_fingerprint(tab_id, &fingerprint)? {
            return Ok(Dispatch::FingerprintRefreshed { guid });
        }

        match self.host.get(tab_id).await {
            Ok(Some(tab)) => {
                self.reconcile(Observation {
                    tab_id,
                    index: tab.index,
                    fingerprint,
                })
                .await
            }
            Ok(None) => {
                debug!(%tab_id, "content report for a tab the host no longer has");
                Ok(Dispatch::Ignored)
            }
            Err(e) => {
                warn!(%tab_id, error = %e, "tab lookup failed, dropping content report");
                Ok(Dispatch::Ignored)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockFingerprints, MockHost, content_fingerprint, url_fingerprint};
    use crate::record::Partition;
    use crate::store::MemoryStore;

    struct Fixture {
        host: Arc<MockHost>,
        fingerprints: Arc<MockFingerprints>,
        router: EventRouter,
    }

    async fn fixture() -> Fixture {
        let registry = TabRegistry::new(Arc::new(MemoryStore::new()), "TabRegistry");
        registry.start().await.unwrap();
        let host = Arc::new(MockHost::new());
        let fingerprints = Arc::new(MockFingerprints::new());
        let router = EventRouter::new(
            registry,
            host.clone(),
            fingerprints.clone(),
            RouterConfig::default(),
        );
        Fixture {
            host,
            fingerprints,
            router,
        }
    }

    #[test]
    fn events_parse_from_json() {
        let event: HostEvent = serde_json::from_str(
            r#"{"event":"updated","tab_id":4,"change":{"status":"complete"},
                "tab":{"tab_id":4,"index":1,"url":"https://a.test/"}}"#,
        )
        .unwrap();
        assert_eq!(event.name(), "updated");
        assert_eq!(event.tab_id(), TabId(4));

        let event: HostEvent =
            serde_json::from_str(r#"{"event":"removed","tab_id":4}"#).unwrap();
        assert_eq!(
            event,
            HostEvent::Removed {
                tab_id: TabId(4),
                info: RemoveInfo::default()
            }
        );
    }

    #[test]
    fn only_loads_and_navigations_affect_content() {
        assert!(!ChangeInfo::default().affects_content());
        assert!(
            !ChangeInfo {
                status: Some(LoadStatus::Loading),
                url: None
            }
            .affects_content()
        );
        assert!(
            ChangeInfo {
                status: None,
                url: Some("https://b.test/".into())
            }
            .affects_content()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn created_tab_is_minted_with_provider_fingerprint() {
        let mut fx = fixture().await;
        let tab = fx.host.open(1, 0, "https://a.test/");
        let fp = content_fingerprint("https://a.test/", "", 1);
        fx.fingerprints.set(1, fp.clone());

        let out = fx.router.dispatch(HostEvent::Created { tab }).await.unwrap();
        assert!(matches!(out, Dispatch::Reconciled(Reconciled::Minted { .. })));
        let records = fx.router.registry().records(Partition::Current);
        assert_eq!(records[0].fingerprint, fp);
    }

    #[tokio::test(start_paused = true)]
    async fn privileged_tab_uses_url_hash() {
        let mut fx = fixture().await;
        let tab = fx.host.open(1, 0, "chrome://newtab/");
        fx.fingerprints.set(1, "ignored");

        fx.router.dispatch(HostEvent::Created { tab }).await.unwrap();
        let records = fx.router.registry().records(Partition::Current);
        assert_eq!(records[0].fingerprint, url_fingerprint("chrome://newtab/"));
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_tab_is_ignored() {
        let mut fx = fixture().await;
        let out = fx
            .router
            .dispatch(HostEvent::Created {
                tab: TabInfo::new(-1, 0, "https://search.test/"),
            })
            .await
            .unwrap();
        assert_eq!(out, Dispatch::Ignored);
        assert_eq!(fx.router.registry().len(Partition::Current), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tab_closed_during_fingerprint_is_ignored() {
        let mut fx = fixture().await;
        let out = fx
            .router
            .dispatch(HostEvent::Created {
                tab: TabInfo::new(3, 0, "https://gone.test/"),
            })
            .await
            .unwrap();
        assert_eq!(out, Dispatch::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn title_updates_are_ignored() {
        let mut fx = fixture().await;
        let tab = fx.host.open(1, 0, "https://a.test/");
        let out = fx
            .router
            .dispatch(HostEvent::Updated {
                tab_id: TabId(1),
                change: ChangeInfo::default(),
                tab,
            })
            .await
            .unwrap();
        assert_eq!(out, Dispatch::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_waits_for_grace_delay() {
        let mut fx = fixture().await;
        let tab = fx.host.open(1, 0, "https://a.test/");
        fx.router.dispatch(HostEvent::Created { tab }).await.unwrap();
        fx.host.close(1);

        let out = fx
            .router
            .dispatch(HostEvent::Removed {
                tab_id: TabId(1),
                info: RemoveInfo::default(),
            })
            .await
            .unwrap();
        let Dispatch::RemovalScheduled { guid } = out else {
            panic!("expected scheduled removal, got {out:?}");
        };
        assert_eq!(fx.router.pending_removals(), 1);
        assert_eq!(fx.router.registry().locate(&guid), Some(Partition::Current));

        let retired = fx.router.settle().await;
        assert_eq!(retired.len(), 1);
        assert_eq!(fx.router.registry().locate(&guid), Some(Partition::Removed));
    }

    #[tokio::test(start_paused = true)]
    async fn removal_during_shutdown_keeps_record() {
        let mut fx = fixture().await;
        let tab = fx.host.open(1, 0, "https://a.test/");
        fx.router.dispatch(HostEvent::Created { tab }).await.unwrap();

        fx.router
            .dispatch(HostEvent::Removed {
                tab_id: TabId(1),
                info: RemoveInfo {
                    window_closing: true,
                },
            })
            .await
            .unwrap();
        fx.router.registry().shutdown().await;

        assert!(fx.router.settle().await.is_empty());
        assert_eq!(fx.router.registry().len(Partition::Current), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_removal() {
        let mut fx = fixture().await;
        let out = fx
            .router
            .dispatch(HostEvent::Removed {
                tab_id: TabId(9),
                info: RemoveInfo::default(),
            })
            .await
            .unwrap();
        assert_eq!(out, Dispatch::Untracked);
    }

    #[tokio::test(start_paused = true)]
    async fn moves_resync_indices() {
        let mut fx = fixture().await;
        for (id, url) in [(1, "https://a.test/"), (2, "https://b.test/")] {
            let tab = fx.host.open(id, id - 1, url);
            fx.router.dispatch(HostEvent::Created { tab }).await.unwrap();
        }
        fx.host.move_tab(2, 0);

        let out = fx
            .router
            .dispatch(HostEvent::Moved { tab_id: TabId(2) })
            .await
            .unwrap();
        assert_eq!(out, Dispatch::IndicesSynced { changed: 2 });
        let guid = fx.router.registry().guid(TabId(2)).unwrap();
        let record = fx
            .router
            .registry()
            .records(Partition::Current)
            .into_iter()
            .find(|r| r.guid == guid)
            .unwrap();
        assert_eq!(record.index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn content_report_refreshes_known_tab() {
        let mut fx = fixture().await;
        let tab = fx.host.open(1, 0, "https://a.test/");
        fx.router.dispatch(HostEvent::Created { tab }).await.unwrap();

        let out = fx
            .router
            .dispatch(HostEvent::ContentReport {
                tab_id: TabId(1),
                fingerprint: "fresh".into(),
            })
            .await
            .unwrap();
        assert!(matches!(out, Dispatch::FingerprintRefreshed { .. }));
        assert_eq!(
            fx.router.registry().records(Partition::Current)[0].fingerprint,
            "fresh"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn content_report_for_unknown_tab_reconciles() {
        let mut fx = fixture().await;
        fx.host.open(5, 0, "https://a.test/");

        let out = fx
            .router
            .dispatch(HostEvent::ContentReport {
                tab_id: TabId(5),
                fingerprint: "pushed".into(),
            })
            .await
            .unwrap();
        assert!(matches!(out, Dispatch::Reconciled(Reconciled::Minted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_channel_and_settles() {
        let fx = fixture().await;
        let Fixture {
            host, mut router, ..
        } = fx;
        let tab = host.open(1, 0, "https://a.test/");
        let (tx, rx) = mpsc::channel(8);

        tx.send(HostEvent::Created { tab }).await.unwrap();
        tx.send(HostEvent::Removed {
            tab_id: TabId(1),
            info: RemoveInfo::default(),
        })
        .await
        .unwrap();
        drop(tx);

        router.run(rx).await.unwrap();
        assert_eq!(router.registry().len(Partition::Current), 0);
        assert_eq!(router.registry().len(Partition::Removed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inconsistent_registry_stops_the_router() {
        let Fixture {
            host, mut router, ..
        } = fixture().await;
        for (guid, index) in [("dup-a", 0), ("dup-b", 1)] {
            router.registry().seed(
                Partition::Current,
                TabRecord::new(Guid::from_raw(guid), &Observation::new(1, index, "f")),
            );
        }

        let err = router
            .dispatch(HostEvent::Replaced {
                added: TabId(7),
                removed: TabId(1),
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let tab = host.open(2, 2, "https://b.test/");
        let (tx, rx) = mpsc::channel(8);
        tx.send(HostEvent::Removed {
            tab_id: TabId(1),
            info: RemoveInfo::default(),
        })
        .await
        .unwrap();
        tx.send(HostEvent::Created { tab }).await.unwrap();

        let err = router.run(rx).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(router.pending_removals(), 0);
        assert_eq!(router.registry().lookup_tab(TabId(2)).unwrap(), None);
        assert_eq!(router.registry().len(Partition::Current), 2);
        drop(tx);
    }
}
