//! In-memory host doubles for tests.
//!
//! [`MemoryStorage`] is a [`StorageArea`] over a plain map with
//! switchable read/write failures. [`MockPlatform`] implements the full
//! [`Platform`] surface, records every host call for later assertion,
//! and can fail individual protocol steps or park a call on a semaphore
//! to exercise interleavings.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::messages::ContentNotice;
use crate::platform::{ConfigPayload, PermissionHost, Probe, ScriptHost, StorageArea, TabId};

/// Volatile [`StorageArea`] backed by a map.
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<serde_json::Map<String, Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Empty store that accepts all reads and writes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored record with the given JSON object.
    ///
    /// # Panics
    ///
    /// Panics when `record` is not an object.
    pub fn seed(&self, record: Value) {
        let Value::Object(map) = record else {
            panic!("seed value must be a JSON object");
        };
        *self.items.lock() = map;
    }

    /// Snapshot of the stored keys.
    pub fn items(&self) -> serde_json::Map<String, Value> {
        self.items.lock().clone()
    }

    /// Make every subsequent read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageArea for MemoryStorage {
    async fn get_all(&self) -> Result<serde_json::Map<String, Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Platform("storage read refused".into()));
        }
        Ok(self.items.lock().clone())
    }

    async fn set(&self, items: serde_json::Map<String, Value>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StoreWrite("storage write refused".into()));
        }
        self.items.lock().extend(items);
        Ok(())
    }
}

/// One recorded host interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    /// The in-page probe ran.
    Probe { tab: TabId },
    /// Configuration was attached to the page.
    InjectConfig { tab: TabId, payload: ConfigPayload },
    /// Stylesheets were inserted.
    InsertCss { tab: TabId, files: Vec<String> },
    /// Scripts were executed.
    ExecuteFiles { tab: TabId, files: Vec<String> },
    /// The page was marked loaded.
    MarkLoaded { tab: TabId },
    /// An in-page error notice was shown.
    ErrorNotice { tab: TabId, message: String },
    /// The tab was reloaded.
    Reload { tab: TabId },
    /// A live-update notice was pushed to the active tab.
    Notify { notice: ContentNotice },
    /// Origin permissions were revoked.
    RevokeOrigins { origins: Vec<String> },
    /// The observed-origin list was re-evaluated.
    WatchOrigins { origins: Vec<String> },
}

/// Which protocol step the mock should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptStep {
    /// Fail nothing.
    #[default]
    None,
    /// Fail [`ScriptHost::inject_config`].
    InjectConfig,
    /// Fail [`ScriptHost::insert_css`].
    InsertCss,
    /// Fail [`ScriptHost::execute_files`].
    ExecuteFiles,
    /// Fail [`ScriptHost::mark_loaded`].
    MarkLoaded,
}

#[derive(Default)]
struct MockState {
    calls: Vec<HostCall>,
    probes: BTreeMap<TabId, Probe>,
    probe_count: usize,
    granted: Vec<String>,
    revoked: Vec<String>,
    fail_step: ScriptStep,
    fail_theme_css: bool,
    config_gate: Option<Arc<Semaphore>>,
}

/// Scriptable in-memory [`Platform`](crate::platform::Platform).
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
    request_observer: AtomicBool,
}

impl MockPlatform {
    /// Platform with no scriptable tabs and no granted origins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the probe of `tab` succeed with the given result. Tabs
    /// without a registered probe fail as non-scriptable.
    pub fn set_probe(&self, tab: TabId, probe: Probe) {
        self.state.lock().probes.insert(tab, probe);
    }

    /// How many probes ran so far.
    pub fn probe_count(&self) -> usize {
        self.state.lock().probe_count
    }

    /// Toggle availability of the network-observation capability.
    pub fn set_request_observer(&self, available: bool) {
        self.request_observer.store(available, Ordering::SeqCst);
    }

    /// Pretend the host granted these origin patterns.
    pub fn grant_origins(&self, origins: &[&str]) {
        self.state
            .lock()
            .granted
            .extend(origins.iter().map(|o| o.to_string()));
    }

    /// Origin patterns revoked so far.
    pub fn revoked_origins(&self) -> Vec<String> {
        self.state.lock().revoked.clone()
    }

    /// Every host call recorded so far, in order.
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// Fail the given protocol step until reset with
    /// [`ScriptStep::None`].
    pub fn fail_step(&self, step: ScriptStep) {
        self.state.lock().fail_step = step;
    }

    /// Fail stylesheet insertion only for theme files.
    pub fn fail_theme_css(&self, fail: bool) {
        self.state.lock().fail_theme_css = fail;
    }

    /// Park [`ScriptHost::inject_config`] until the returned semaphore
    /// receives a permit. Each call through consumes one permit.
    pub fn hold_config_injection(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().config_gate = Some(Arc::clone(&gate));
        gate
    }

    fn record(&self, call: HostCall) {
        self.state.lock().calls.push(call);
    }

    fn step_failure(&self, step: ScriptStep) -> Result<()> {
        if self.state.lock().fail_step == step {
            return Err(Error::Platform(format!("{step:?} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptHost for MockPlatform {
    async fn probe(&self, tab: TabId) -> Result<Probe> {
        let mut state = self.state.lock();
        state.probe_count += 1;
        state.calls.push(HostCall::Probe { tab });
        state
            .probes
            .get(&tab)
            .cloned()
            .ok_or_else(|| Error::Probe(format!("tab {tab} is not scriptable")))
    }

    async fn inject_config(&self, tab: TabId, payload: &ConfigPayload) -> Result<()> {
        let gate = self.state.lock().config_gate.clone();
        if let Some(gate) = gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(Error::Platform("config gate closed".into())),
            }
        }
        self.record(HostCall::InjectConfig {
            tab,
            payload: payload.clone(),
        });
        self.step_failure(ScriptStep::InjectConfig)
    }

    async fn insert_css(&self, tab: TabId, files: &[String]) -> Result<()> {
        self.record(HostCall::InsertCss {
            tab,
            files: files.to_vec(),
        });
        let theme_only = files.len() == 1 && files[0].starts_with("/themes/");
        if theme_only && self.state.lock().fail_theme_css {
            return Err(Error::Platform("theme stylesheet refused".into()));
        }
        self.step_failure(ScriptStep::InsertCss)
    }

    async fn execute_files(&self, tab: TabId, files: &[String]) -> Result<()> {
        self.record(HostCall::ExecuteFiles {
            tab,
            files: files.to_vec(),
        });
        self.step_failure(ScriptStep::ExecuteFiles)
    }

    async fn mark_loaded(&self, tab: TabId) -> Result<()> {
        self.record(HostCall::MarkLoaded { tab });
        self.step_failure(ScriptStep::MarkLoaded)
    }

    async fn show_error_notice(&self, tab: TabId, message: &str) -> Result<()> {
        self.record(HostCall::ErrorNotice {
            tab,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn reload_tab(&self, tab: TabId) -> Result<()> {
        self.record(HostCall::Reload { tab });
        Ok(())
    }

    async fn notify_active_tab(&self, notice: &ContentNotice) -> Result<()> {
        self.record(HostCall::Notify {
            notice: notice.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl PermissionHost for MockPlatform {
    async fn granted_origins(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().granted.clone())
    }

    async fn revoke_origins(&self, origins: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.granted.retain(|o| !origins.contains(o));
        state.revoked.extend(origins.iter().cloned());
        state.calls.push(HostCall::RevokeOrigins {
            origins: origins.to_vec(),
        });
        Ok(())
    }

    async fn watch_origins(&self, origins: &[String]) -> Result<()> {
        self.record(HostCall::WatchOrigins {
            origins: origins.to_vec(),
        });
        Ok(())
    }

    fn has_request_observer(&self) -> bool {
        self.request_observer.load(Ordering::SeqCst)
    }
}
