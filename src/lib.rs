//! Background engine for a markdown and notebook document viewer.
//!
//! The engine sits between a browser-like host and a set of in-page
//! rendering scripts. It decides which tabs hold renderable documents,
//! injects the rendering pipeline into them exactly once per page load,
//! and answers a typed message protocol from the page and the settings
//! UI. All host capabilities are behind the traits in [`platform`], so
//! the engine itself is host-agnostic and fully testable in memory.
//!
//! [`Engine`] wires the pieces together in dependency order: the
//! settings [`Store`](settings::Store) is loaded and migrated first,
//! then the [`InjectionCoordinator`](inject::InjectionCoordinator),
//! [`Detector`](detect::Detector) and [`MessageRouter`](messages::MessageRouter)
//! are built on top of it. No message is handled before the store is
//! ready because the router cannot exist earlier.

pub mod compilers;
pub mod detect;
pub mod error;
pub mod fetch;
pub mod inject;
pub mod math;
pub mod messages;
pub mod origins;
pub mod platform;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod test_support;

use std::sync::Arc;

use crate::compilers::CompilerRegistry;
use crate::detect::{Detector, DetectorConfig};
use crate::inject::InjectionCoordinator;
use crate::messages::{MessageRouter, Request, Response};
use crate::platform::{Platform, StorageArea, TabId, TabStatus};
use crate::settings::Store;

pub use crate::error::{Error, Result};

/// The assembled engine.
///
/// Construction is async because the settings record must be read,
/// migrated and validated before anything else may run.
pub struct Engine {
    store: Arc<Store>,
    detector: Detector,
    coordinator: Arc<InjectionCoordinator>,
    router: MessageRouter,
}

impl Engine {
    /// Build the engine with the built-in compiler backends and default
    /// detector tuning.
    pub async fn new(
        platform: Arc<dyn Platform>,
        primary: Arc<dyn StorageArea>,
        fallback: Arc<dyn StorageArea>,
    ) -> Self {
        Self::with_parts(
            platform,
            primary,
            fallback,
            CompilerRegistry::with_defaults(),
            DetectorConfig::default(),
        )
        .await
    }

    /// Build the engine with a caller-supplied compiler registry and
    /// detector tuning.
    pub async fn with_parts(
        platform: Arc<dyn Platform>,
        primary: Arc<dyn StorageArea>,
        fallback: Arc<dyn StorageArea>,
        compilers: CompilerRegistry,
        detector: DetectorConfig,
    ) -> Self {
        let compilers = Arc::new(compilers);
        let store = Store::load(primary, fallback, &compilers, platform.as_ref()).await;
        let coordinator = InjectionCoordinator::new(Arc::clone(&store), Arc::clone(&platform));
        let detector = Detector::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&platform),
            detector,
        );
        let router = MessageRouter::new(Arc::clone(&store), compilers, platform);
        Self {
            store,
            detector,
            coordinator,
            router,
        }
    }

    /// Handle one protocol request.
    pub async fn handle(&self, request: Request) -> Response {
        self.router.handle(request).await
    }

    /// Feed one tab-update event into detection.
    pub async fn on_tab_updated(&self, tab: TabId, status: TabStatus, url: Option<&str>) {
        self.detector.on_tab_updated(tab, status, url).await;
    }

    /// Drop all per-tab state for a closed tab.
    pub fn on_tab_removed(&self, tab: TabId) {
        self.coordinator.on_tab_removed(tab);
    }

    /// The live settings store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}
