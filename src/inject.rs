//! Per-tab injection coordination.
//!
//! The coordinator is the one place where the injection protocol may be
//! started, and its primary correctness property is that no tab receives
//! the protocol twice for the same load. The guarantee rests on ordering:
//! [`InjectionCoordinator::begin`] writes the `Injecting` marker under a
//! synchronous lock *before* its first suspension point, so a second
//! detection trigger for the same tab that arrives while the first
//! protocol is still awaiting a host call observes the marker and exits
//! early.
//!
//! Protocol steps run in order and each may fail independently; any
//! failure marks the tab `Failed`, shows a best-effort in-page notice and
//! schedules the state to clear back to absent after the configured retry
//! delay so a later navigation can try again. Tab removal cancels state
//! immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::platform::{ConfigPayload, Platform, TabId};
use crate::settings::{SettingsRecord, Store};

/// Lifecycle of one tab's injection; absence of an entry is the initial
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    /// The protocol is in flight.
    Injecting,
    /// The protocol completed; terminal until the tab goes away.
    Injected,
    /// The protocol failed; cleared back to absent after the retry delay.
    Failed,
}

/// What a call to [`InjectionCoordinator::begin`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The protocol ran to completion.
    Injected,
    /// Another protocol run was already in flight for this tab.
    AlreadyInFlight,
    /// The tab already completed injection for this load.
    AlreadyInjected,
    /// The protocol ran and failed; the tab will become retryable.
    Failed,
}

/// Arena of per-tab injection state, plus the protocol itself.
pub struct InjectionCoordinator {
    store: Arc<Store>,
    platform: Arc<dyn Platform>,
    tabs: Mutex<HashMap<TabId, TabState>>,
}

impl InjectionCoordinator {
    /// New coordinator with an empty arena.
    pub fn new(store: Arc<Store>, platform: Arc<dyn Platform>) -> Arc<Self> {
        Arc::new(Self {
            store,
            platform,
            tabs: Mutex::new(HashMap::new()),
        })
    }

    /// Start the injection protocol for `tab`, unless it is already in
    /// flight or done.
    pub async fn begin(self: &Arc<Self>, tab: TabId) -> BeginOutcome {
        {
            // Synchronous check-and-set; the lock is released before the
            // first await below. This is the idempotency guarantee.
            let mut tabs = self.tabs.lock();
            match tabs.get(&tab) {
                Some(TabState::Injecting) => return BeginOutcome::AlreadyInFlight,
                Some(TabState::Injected) => return BeginOutcome::AlreadyInjected,
                // Absent, or Failed and being retried early.
                _ => {
                    tabs.insert(tab, TabState::Injecting);
                }
            }
        }

        let record = self.store.snapshot().await;
        match self.run_protocol(tab, &record).await {
            Ok(()) => {
                if self.settle(tab, TabState::Injected) {
                    debug!(tab, "injection complete");
                }
                BeginOutcome::Injected
            }
            Err(e) => {
                warn!(tab, error = %e, "injection failed");
                if self.settle(tab, TabState::Failed) {
                    let notice = format!("Notebook rendering failed: {e}");
                    if let Err(notice_err) = self.platform.show_error_notice(tab, &notice).await {
                        debug!(tab, error = %notice_err, "error notice could not be shown");
                    }

                    self.schedule_retry_clear(
                        tab,
                        Duration::from_millis(record.error_recovery.retry_delay_ms),
                    );
                }
                BeginOutcome::Failed
            }
        }
    }

    /// Record the protocol's outcome, unless the entry stopped being
    /// `Injecting` while the protocol was suspended (the tab was removed).
    fn settle(&self, tab: TabId, state: TabState) -> bool {
        let mut tabs = self.tabs.lock();
        if matches!(tabs.get(&tab), Some(TabState::Injecting)) {
            tabs.insert(tab, state);
            true
        } else {
            debug!(tab, "tab went away mid-protocol, outcome dropped");
            false
        }
    }

    /// Tab removal cancels any state immediately.
    pub fn on_tab_removed(&self, tab: TabId) {
        if self.tabs.lock().remove(&tab).is_some() {
            debug!(tab, "injection state dropped with tab");
        }
    }

    /// Current state of a tab, if any.
    pub fn state(&self, tab: TabId) -> Option<TabState> {
        self.tabs.lock().get(&tab).copied()
    }

    /// After the retry delay, a tab still marked `Failed` becomes absent
    /// again so the next detection can re-inject. A tab that was removed,
    /// or re-entered the protocol early, is left alone.
    fn schedule_retry_clear(self: &Arc<Self>, tab: TabId, delay: Duration) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut tabs = coordinator.tabs.lock();
            if matches!(tabs.get(&tab), Some(TabState::Failed)) {
                tabs.remove(&tab);
                debug!(tab, "failed injection state cleared for retry");
            }
        });
    }

    /// The four-step protocol. Steps 1, 3 and 4 abort on failure; the
    /// theme stylesheet in step 2 is best-effort.
    async fn run_protocol(&self, tab: TabId, record: &SettingsRecord) -> Result<()> {
        let payload = ConfigPayload {
            theme: record.theme.clone(),
            raw: record.raw,
            themes: record.themes.clone(),
            content: record.content,
            compiler: record.compiler.clone(),
        };
        self.platform
            .inject_config(tab, &payload)
            .await
            .map_err(|e| Error::injection("config", e))?;

        self.platform
            .insert_css(tab, &base_styles())
            .await
            .map_err(|e| Error::injection("styles", e))?;
        if !record.theme.is_empty() {
            let theme_css = vec![format!("/themes/{}.css", record.theme)];
            if let Err(e) = self.platform.insert_css(tab, &theme_css).await {
                warn!(tab, theme = %record.theme, error = %e, "theme stylesheet failed to load");
            }
        }

        self.platform
            .execute_files(tab, &pipeline_scripts(record))
            .await
            .map_err(|e| Error::injection("scripts", e))?;

        self.platform
            .mark_loaded(tab)
            .await
            .map_err(|e| Error::injection("finalize", e))?;
        Ok(())
    }
}

/// Base presentation styles, injected before the theme stylesheet.
fn base_styles() -> Vec<String> {
    vec![
        "/content/index.css".to_string(),
        "/vendor/prism.min.css".to_string(),
        "/vendor/katex.min.css".to_string(),
    ]
}

/// Rendering pipeline scripts, with optional modules selected by the
/// content flags.
fn pipeline_scripts(record: &SettingsRecord) -> Vec<String> {
    let mut files = vec![
        "/vendor/mithril.min.js".to_string(),
        "/vendor/ansi_up.min.js".to_string(),
        "/vendor/katex.min.js".to_string(),
        "/vendor/katex-auto-render.min.js".to_string(),
        "/vendor/notebook.min.js".to_string(),
    ];
    if record.content.syntax {
        files.push("/vendor/prism.min.js".to_string());
    }
    if record.content.emoji {
        files.push("/content/emoji.js".to_string());
    }
    if record.content.mathjax {
        files.push("/vendor/mathjax/tex-mml-chtml.js".to_string());
        files.push("/content/mathjax.js".to_string());
    }
    if record.error_recovery.auto_retry {
        files.push("/content/fallback.js".to_string());
    }
    files.push("/content/index.js".to_string());
    if record.content.autoreload {
        files.push("/content/autoreload.js".to_string());
    }
    files
}
