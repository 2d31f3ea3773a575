//! Host collaborator interfaces.
//!
//! The registry never talks to a browser directly. It sees the host through
//! two narrow traits:
//!
//! - [`HostTabs`]: the host tab manager, queried for the live tab list
//! - [`FingerprintProvider`]: the content-side helper that summarises what a
//!   tab has loaded
//!
//! Both return boxed futures so they can be shared as trait objects
//! ([`HostHandle`], [`FingerprintHandle`]). [`MockHost`] and
//! [`MockFingerprints`] are scripted in-memory implementations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Index reported for a tab that has not been placed in a strip yet.
pub const UNPLACED_INDEX: i64 = -1;

/// URL schemes whose pages are not reachable by the content-side helper.
const PRIVILEGED_SCHEMES: &[&str] = &[
    "about:",
    "chrome:",
    "chrome-extension:",
    "chrome-search:",
    "chrome-untrusted:",
    "devtools:",
    "edge:",
    "file:",
    "moz-extension:",
    "view-source:",
];

/// Volatile tab id assigned by the host; reused after the tab closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl TabId {
    /// Host placeholder for "no real tab" (e.g. omnibox search previews).
    pub const NONE: Self = Self(-1);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tab metadata as reported by the host tab manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub tab_id: TabId,
    /// Position in the tab strip, or [`UNPLACED_INDEX`].
    pub index: i64,
    #[serde(default)]
    pub url: String,
}

impl TabInfo {
    #[must_use]
    pub fn new(tab_id: i64, index: i64, url: impl Into<String>) -> Self {
        Self {
            tab_id: TabId(tab_id),
            index,
            url: url.into(),
        }
    }

    #[must_use]
    pub fn is_placed(&self) -> bool {
        self.index >= 0
    }
}

/// Future returned by host collaborator calls.
pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = crate::Result<T>> + Send + 'a>>;

/// The host tab manager.
pub trait HostTabs: Send + Sync {
    /// Every tab currently open, in any order.
    fn query_all(&self) -> HostFuture<'_, Vec<TabInfo>>;

    /// Current metadata for one tab, `None` if the host no longer knows it.
    fn get(&self, tab_id: TabId) -> HostFuture<'_, Option<TabInfo>>;
}

/// Shared handle to the host tab manager.
pub type HostHandle = Arc<dyn HostTabs>;

/// The content-side fingerprint helper.
pub trait FingerprintProvider: Send + Sync {
    fn fingerprint<'a>(&'a self, tab: &'a TabInfo) -> HostFuture<'a, String>;
}

/// Shared handle to the fingerprint helper.
pub type FingerprintHandle = Arc<dyn FingerprintProvider>;

/// Fingerprint computed inside a page: navigation target, referrer and
/// history depth, encoded as a JSON array.
#[must_use]
pub fn content_fingerprint(href: &str, referrer: &str, history_len: u32) -> String {
    serde_json::json!([href, referrer, history_len]).to_string()
}

/// True for URLs the content helper cannot run in.
#[must_use]
pub fn is_privileged_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    PRIVILEGED_SCHEMES
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

/// Fingerprint derived from the URL alone.
#[must_use]
pub fn url_fingerprint(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Fingerprint a tab: privileged pages are hashed directly, everything else
/// is asked of the provider, falling back to the URL hash when it fails.
pub async fn resolve_fingerprint(provider: &dyn FingerprintProvider, tab: &TabInfo) -> String {
    if is_privileged_url(&tab.url) {
        return url_fingerprint(&tab.url);
    }

    match provider.fingerprint(tab).await {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            warn!(tab_id = %tab.tab_id, error = %e, "fingerprint unavailable, hashing url");
            url_fingerprint(&tab.url)
        }
    }
}

// =============================================================================
// Scripted host
// =============================================================================

/// In-memory tab strip that behaves like a single host window.
#[derive(Debug, Default)]
pub struct MockHost {
    tabs: Mutex<Vec<TabInfo>>,
}

impl MockHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a tab at `index`, shifting later tabs right. Returns its info.
    pub fn open(&self, tab_id: i64, index: i64, url: &str) -> TabInfo {
        let mut tabs = self.tabs.lock();
        let index = index.clamp(0, tabs.len() as i64);
        tabs.insert(index as usize, TabInfo::new(tab_id, index, url));
        renumber(&mut tabs);
        tabs[index as usize].clone()
    }

    /// Close a tab, shifting later tabs left.
    pub fn close(&self, tab_id: i64) -> Option<TabInfo> {
        let mut tabs = self.tabs.lock();
        let pos = tabs.iter().position(|t| t.tab_id == TabId(tab_id))?;
        let removed = tabs.remove(pos);
        renumber(&mut tabs);
        Some(removed)
    }

    /// Move a tab to `to_index`.
    pub fn move_tab(&self, tab_id: i64, to_index: i64) -> Option<TabInfo> {
        let mut tabs = self.tabs.lock();
        let pos = tabs.iter().position(|t| t.tab_id == TabId(tab_id))?;
        let tab = tabs.remove(pos);
        let to = to_index.clamp(0, tabs.len() as i64) as usize;
        tabs.insert(to, tab);
        renumber(&mut tabs);
        Some(tabs[to].clone())
    }

    /// Swap a tab's volatile id in place.
    pub fn replace(&self, old_tab_id: i64, new_tab_id: i64) -> Option<TabInfo> {
        let mut tabs = self.tabs.lock();
        let tab = tabs.iter_mut().find(|t| t.tab_id == TabId(old_tab_id))?;
        tab.tab_id = TabId(new_tab_id);
        Some(tab.clone())
    }

    /// Navigate a tab to a new URL.
    pub fn navigate(&self, tab_id: i64, url: &str) -> Option<TabInfo> {
        let mut tabs = self.tabs.lock();
        let tab = tabs.iter_mut().find(|t| t.tab_id == TabId(tab_id))?;
        tab.url = url.to_string();
        Some(tab.clone())
    }

    /// Drop every tab, as when the host process exits.
    pub fn clear(&self) {
        self.tabs.lock().clear();
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<TabInfo> {
        self.tabs.lock().clone()
    }
}

fn renumber(tabs: &mut [TabInfo]) {
    for (i, tab) in tabs.iter_mut().enumerate() {
        tab.index = i as i64;
    }
}

impl HostTabs for MockHost {
    fn query_all(&self) -> HostFuture<'_, Vec<TabInfo>> {
        Box::pin(async move { Ok(self.snapshot()) })
    }

    fn get(&self, tab_id: TabId) -> HostFuture<'_, Option<TabInfo>> {
        Box::pin(async move {
            Ok(self
                .tabs
                .lock()
                .iter()
                .find(|t| t.tab_id == tab_id)
                .cloned())
        })
    }
}

/// Fingerprint helper answering from a per-tab table.
///
/// Tabs without an entry fail, which exercises the URL-hash fallback.
#[derive(Debug, Default)]
pub struct MockFingerprints {
    by_tab: Mutex<HashMap<TabId, String>>,
}

impl MockFingerprints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tab_id: i64, fingerprint: impl Into<String>) {
        self.by_tab.lock().insert(TabId(tab_id), fingerprint.into());
    }

    pub fn forget(&self, tab_id: i64) {
        self.by_tab.lock().remove(&TabId(tab_id));
    }
}

impl FingerprintProvider for MockFingerprints {
    fn fingerprint<'a>(&'a self, tab: &'a TabInfo) -> HostFuture<'a, String> {
        Box::pin(async move {
            self.by_tab
                .lock()
                .get(&tab.tab_id)
                .cloned()
                .ok_or_else(|| {
                    crate::Error::Host(format!("no content context for tab {}", tab.tab_id))
                })
        })
    }
}
