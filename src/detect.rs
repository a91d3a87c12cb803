//! Per-navigation detection.
//!
//! Every tab-update event in `loading` state walks the same path: consult
//! the short-lived probe cache, run the in-page probe, bail out if the
//! page is already processed, then evaluate header-based and URL-based
//! matching. A match triggers injection - except the very first match
//! since process start, which instead reloads the tab once so a
//! network-observation capability (when present) sees the page's initial
//! request.
//!
//! A probe failure means the origin was not authorized or the page is not
//! scriptable; it is treated as "no match" and never surfaces.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::inject::InjectionCoordinator;
use crate::origins;
use crate::platform::{Platform, Probe, TabId, TabStatus};
use crate::settings::Store;

/// Tuning for the detection cache.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// How long a cached probe result suppresses re-probing.
    pub cache_ttl: Duration,
    /// Upper bound on cached entries; the oldest is evicted beyond it.
    pub cache_capacity: NonZeroUsize,
}

impl Default for DetectorConfig {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            cache_capacity: NonZeroUsize::new(128).expect("capacity is non-zero"),
        }
    }
}

struct CacheEntry {
    probe: Probe,
    at: Instant,
}

/// Per-tab-navigation entry point.
pub struct Detector {
    store: Arc<Store>,
    coordinator: Arc<InjectionCoordinator>,
    platform: Arc<dyn Platform>,
    cache: Mutex<LruCache<(TabId, String), CacheEntry>>,
    woke: AtomicBool,
    config: DetectorConfig,
}

impl Detector {
    /// New detector with an empty cache.
    pub fn new(
        store: Arc<Store>,
        coordinator: Arc<InjectionCoordinator>,
        platform: Arc<dyn Platform>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            platform,
            cache: Mutex::new(LruCache::new(config.cache_capacity)),
            woke: AtomicBool::new(false),
            config,
        }
    }

    /// Handle one tab-update event. `url` is the navigation target when
    /// the event carries one; it keys the cache lookup.
    pub async fn on_tab_updated(&self, tab: TabId, status: TabStatus, url: Option<&str>) {
        if status != TabStatus::Loading {
            return;
        }

        let record = self.store.snapshot().await;
        let caching = record.performance.cache_enabled;

        if caching {
            if let Some(url) = url {
                if self.fresh(tab, url) {
                    trace!(tab, url, "probe result still fresh, skipping");
                    return;
                }
            }
        }

        let probe = match self.platform.probe(tab).await {
            Ok(probe) => probe,
            Err(e) => {
                // Unauthorized origin or unscriptable page.
                debug!(tab, error = %e, "probe failed, treating as no match");
                return;
            }
        };

        if caching {
            self.remember(tab, &probe);
        }

        if probe.loaded {
            trace!(tab, "page already processed");
            return;
        }

        let matched = origins::header_match(&record, probe.content_type.as_deref())
            || origins::url_match(&record, &probe.url);
        if !matched {
            return;
        }

        if self.platform.has_request_observer() && !self.woke.swap(true, Ordering::SeqCst) {
            // First match since process start: reload once so the request
            // observer sees the page's initial load. The cached probe is
            // dropped so the reloaded navigation is evaluated again
            // instead of stopping on a fresh hit.
            debug!(tab, "wake-up reload");
            self.cache.lock().pop(&(tab, probe.url.clone()));
            if let Err(e) = self.platform.reload_tab(tab).await {
                warn!(tab, error = %e, "wake-up reload failed");
            }
            return;
        }

        let outcome = self.coordinator.begin(tab).await;
        debug!(tab, ?outcome, "detection triggered injection");
    }

    fn fresh(&self, tab: TabId, url: &str) -> bool {
        let mut cache = self.cache.lock();
        let key = (tab, url.to_string());
        match cache.peek(&key) {
            Some(entry) if entry.at.elapsed() < self.config.cache_ttl => true,
            Some(_) => {
                cache.pop(&key);
                false
            }
            None => false,
        }
    }

    fn remember(&self, tab: TabId, probe: &Probe) {
        let entry = CacheEntry {
            probe: probe.clone(),
            at: Instant::now(),
        };
        self.cache.lock().put((tab, probe.url.clone()), entry);
    }

    /// Last cached probe result for `(tab, url)`, if still fresh.
    pub fn cached_probe(&self, tab: TabId, url: &str) -> Option<Probe> {
        let cache = self.cache.lock();
        cache
            .peek(&(tab, url.to_string()))
            .filter(|entry| entry.at.elapsed() < self.config.cache_ttl)
            .map(|entry| entry.probe.clone())
    }

    /// Number of cached probe results, for tests and diagnostics.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}
