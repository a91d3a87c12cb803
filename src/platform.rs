//! Host platform capability traits.
//!
//! Everything the engine does to the outside world goes through these
//! traits: running the in-page probe, injecting configuration, styles and
//! scripts, reloading tabs, reading and writing the durable settings
//! stores, and managing granted origin permissions. The browser-backed
//! implementations live with the embedding application; tests use the
//! mocks in [`crate::test_support`].
//!
//! Every method is async and may fail; between suspension points the
//! engine runs to completion without preemption, which is what the
//! injection coordinator's idempotency guarantee relies on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::messages::ContentNotice;
use crate::settings::ContentFlags;

/// Opaque identifier of one browser navigation context.
pub type TabId = u64;

/// Navigation status reported by a tab-update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabStatus {
    /// The tab has started loading a document.
    Loading,
    /// The tab finished loading.
    Complete,
}

/// Result of the lightweight in-page detection probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    /// Effective URL of the page, as seen from inside it.
    pub url: String,
    /// Effective content type of the document, when the page exposes one.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Whether the page already carries a loaded/loading marker from a
    /// previous injection.
    #[serde(default)]
    pub loaded: bool,
}

/// Configuration object attached to a well-known page global before the
/// pipeline scripts load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPayload {
    /// Active theme id.
    pub theme: String,
    /// Show source instead of rendered output.
    pub raw: bool,
    /// Presentation toggles, passed to the page verbatim.
    pub themes: BTreeMap<String, bool>,
    /// Feature flags for the rendering pipeline.
    pub content: ContentFlags,
    /// Active compiler backend id.
    pub compiler: String,
}

/// Script and style execution against one tab.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Run the in-page detection probe. An error means the page was not
    /// scriptable or the origin was not authorized; the detector treats
    /// that as "no match", never as a failure to surface.
    async fn probe(&self, tab: TabId) -> Result<Probe>;

    /// Attach the configuration payload to the page global and show the
    /// loading placeholder.
    async fn inject_config(&self, tab: TabId, payload: &ConfigPayload) -> Result<()>;

    /// Insert stylesheet files into the page.
    async fn insert_css(&self, tab: TabId, files: &[String]) -> Result<()>;

    /// Execute script files in the page, in order.
    async fn execute_files(&self, tab: TabId, files: &[String]) -> Result<()>;

    /// Mark the page fully loaded and remove the placeholder.
    async fn mark_loaded(&self, tab: TabId) -> Result<()>;

    /// Best-effort in-page error notice after a failed injection.
    async fn show_error_notice(&self, tab: TabId, message: &str) -> Result<()>;

    /// Perform a full reload of the tab.
    async fn reload_tab(&self, tab: TabId) -> Result<()>;

    /// Push a live-update notice to the active tab.
    async fn notify_active_tab(&self, notice: &ContentNotice) -> Result<()>;
}

/// One durable key/value store for the persisted settings record.
///
/// The settings store is given two of these: a primary and a fallback.
/// A write that fails on the primary is retried once against the fallback.
#[async_trait]
pub trait StorageArea: Send + Sync {
    /// Read every persisted top-level key.
    async fn get_all(&self) -> Result<serde_json::Map<String, Value>>;

    /// Persist the given top-level keys, replacing existing values.
    async fn set(&self, items: serde_json::Map<String, Value>) -> Result<()>;
}

/// Origin permission management and request observation.
#[async_trait]
pub trait PermissionHost: Send + Sync {
    /// All origin permission patterns currently granted by the host,
    /// in the host's own notation (e.g. `https://example.com/*`).
    async fn granted_origins(&self) -> Result<Vec<String>>;

    /// Revoke previously granted origin permissions.
    async fn revoke_origins(&self, origins: &[String]) -> Result<()>;

    /// Re-evaluate which origins the host should observe network
    /// requests for.
    async fn watch_origins(&self, origins: &[String]) -> Result<()>;

    /// Whether a network-observation capability is available. Gates the
    /// one-time wake-up reload.
    fn has_request_observer(&self) -> bool;
}

/// Full host surface required by the engine.
pub trait Platform: ScriptHost + PermissionHost {}

impl<T: ScriptHost + PermissionHost> Platform for T {}
