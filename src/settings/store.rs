//! The settings store: exclusive owner of the persisted record.
//!
//! The store only exists after initialization completes - there is no
//! synchronous constructor and no pre-load value, so no caller can ever
//! observe a half-initialized record. Initialization reads the primary
//! storage area, sweeps stale origin permissions, synthesizes defaults on
//! first run, migrates, validates (falling back to a full reset on
//! corruption) and persists the normalized result.
//!
//! Writes go through [`Store::update`], which applies the mutation under
//! the write lock and persists the result before returning, so the
//! in-memory copy and the persisted copy are never observably
//! inconsistent to a caller that always goes through `update`.
//! Persistence failures are logged and retried once against the fallback
//! area; they never propagate to the caller.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::migrations;
use super::record::SettingsRecord;
use crate::compilers::CompilerRegistry;
use crate::platform::{PermissionHost, StorageArea};

/// Exclusive owner of the [`SettingsRecord`].
pub struct Store {
    record: RwLock<SettingsRecord>,
    defaults: SettingsRecord,
    primary: Arc<dyn StorageArea>,
    fallback: Arc<dyn StorageArea>,
}

impl Store {
    /// Load (or synthesize) the settings record and return a ready store.
    ///
    /// Never fails: an unreadable primary store, a corrupt record or a
    /// failed persistence all degrade to a usable default record with the
    /// condition logged.
    pub async fn load(
        primary: Arc<dyn StorageArea>,
        fallback: Arc<dyn StorageArea>,
        compilers: &CompilerRegistry,
        permissions: &dyn PermissionHost,
    ) -> Arc<Store> {
        let defaults = SettingsRecord::defaults(compilers);

        let mut map = match primary.get_all().await {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, "reading persisted settings failed, starting from defaults");
                serde_json::Map::new()
            }
        };

        sweep_stale_permissions(permissions, &map).await;

        if map.is_empty() {
            debug!("no persisted settings, synthesizing defaults");
            map = defaults.to_map().unwrap_or_default();
        }

        // Backends registered after the record was persisted get their
        // default options merged in.
        for name in compilers.names() {
            if !map.contains_key(&name) {
                if let Some(compiler) = compilers.get(&name) {
                    map.insert(name, compiler.defaults());
                }
            }
        }

        let report = migrations::run(&mut map);
        if let Some(version) = report.halted_at {
            warn!(version, "migration chain halted early");
        }

        let record = match migrations::validate(&map) {
            Ok(()) => match serde_json::from_value::<SettingsRecord>(Value::Object(map)) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "migrated settings failed to deserialize");
                    migrations::reset(compilers)
                }
            },
            Err(e) => {
                warn!(error = %e, "migrated settings failed validation");
                migrations::reset(compilers)
            }
        };

        let store = Arc::new(Store {
            record: RwLock::new(record.clone()),
            defaults,
            primary,
            fallback,
        });
        store.persist(&record).await;
        info!(version = record.version, "settings store ready");
        store
    }

    /// Cheap clone of the current record.
    pub async fn snapshot(&self) -> SettingsRecord {
        self.record.read().await.clone()
    }

    /// The default record synthesized at load time.
    pub fn defaults(&self) -> &SettingsRecord {
        &self.defaults
    }

    /// Apply a mutation and persist the result. Mutations are applied in
    /// the order `update` is invoked; persistence failures are
    /// independent per call and never surface here.
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut SettingsRecord),
    {
        let snapshot = {
            let mut record = self.record.write().await;
            mutate(&mut record);
            record.clone()
        };
        self.persist(&snapshot).await;
    }

    /// Dual-path write: primary first, fallback on failure, logged on
    /// double failure. Never raises.
    async fn persist(&self, record: &SettingsRecord) {
        let map = match record.to_map() {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, "settings record not serializable, skipping persist");
                return;
            }
        };
        if let Err(primary_err) = self.primary.set(map.clone()).await {
            warn!(error = %primary_err, "primary settings write failed, using fallback store");
            if let Err(fallback_err) = self.fallback.set(map).await {
                error!(
                    primary = %primary_err,
                    fallback = %fallback_err,
                    "both settings stores rejected the write"
                );
            }
        }
    }
}

/// Revoke host permissions for origins no longer present in the record.
/// Best-effort: every failure is logged and ignored.
async fn sweep_stale_permissions(
    permissions: &dyn PermissionHost,
    map: &serde_json::Map<String, Value>,
) {
    let granted = match permissions.granted_origins().await {
        Ok(granted) => granted,
        Err(e) => {
            debug!(error = %e, "granted-origin listing unavailable, skipping sweep");
            return;
        }
    };

    let known: Vec<&str> = map
        .get("origins")
        .and_then(Value::as_object)
        .map(|origins| origins.keys().map(String::as_str).collect())
        .unwrap_or_default();

    // Host patterns carry a trailing `/*` that origin keys do not.
    let stale: Vec<String> = granted
        .into_iter()
        .filter(|pattern| {
            let origin = pattern.strip_suffix("/*").unwrap_or(pattern);
            !known.contains(&origin)
        })
        .collect();

    if stale.is_empty() {
        return;
    }
    info!(count = stale.len(), "revoking stale origin permissions");
    if let Err(e) = permissions.revoke_origins(&stale).await {
        warn!(error = %e, "stale permission revocation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStorage, MockPlatform};
    use serde_json::json;

    fn registry() -> CompilerRegistry {
        CompilerRegistry::with_defaults()
    }

    async fn load_with(primary: Arc<MemoryStorage>, fallback: Arc<MemoryStorage>) -> Arc<Store> {
        let platform = MockPlatform::new();
        Store::load(primary, fallback, &registry(), &platform).await
    }

    #[tokio::test]
    async fn first_run_synthesizes_and_persists_defaults() {
        let primary = Arc::new(MemoryStorage::new());
        let store = load_with(Arc::clone(&primary), Arc::new(MemoryStorage::new())).await;

        let record = store.snapshot().await;
        assert_eq!(record, *store.defaults());

        let persisted = primary.items();
        assert_eq!(persisted["version"], json!(record.version));
        assert_eq!(persisted["theme"], json!("github"));
    }

    #[tokio::test]
    async fn stored_v1_record_is_migrated_before_use() {
        let primary = Arc::new(MemoryStorage::new());
        primary.seed(json!({"version": 1, "theme": "github"}));

        let store = load_with(Arc::clone(&primary), Arc::new(MemoryStorage::new())).await;
        let record = store.snapshot().await;

        assert_eq!(record.version, super::super::record::CURRENT_VERSION);
        assert_eq!(record.theme, "github");
        assert!(record.content.mathjax);
        assert!(!record.debug);
        assert_eq!(
            record.origins["file://"].match_pattern,
            super::super::record::NOTEBOOK_MATCH
        );
        // The migrated record was written back.
        assert_eq!(primary.items()["version"], json!(4));
    }

    #[tokio::test]
    async fn corrupt_record_resets_to_defaults() {
        let primary = Arc::new(MemoryStorage::new());
        // `theme: null` survives migration but fails validation.
        primary.seed(json!({"version": 4, "theme": null, "compiler": 17}));

        let store = load_with(Arc::clone(&primary), Arc::new(MemoryStorage::new())).await;
        assert_eq!(store.snapshot().await, *store.defaults());
    }

    #[tokio::test]
    async fn update_persists_through_set() {
        let primary = Arc::new(MemoryStorage::new());
        let store = load_with(Arc::clone(&primary), Arc::new(MemoryStorage::new())).await;

        store.update(|r| r.theme = "jupyter".into()).await;

        assert_eq!(store.snapshot().await.theme, "jupyter");
        assert_eq!(primary.items()["theme"], json!("jupyter"));
    }

    #[tokio::test]
    async fn primary_write_failure_falls_back() {
        let primary = Arc::new(MemoryStorage::new());
        let fallback = Arc::new(MemoryStorage::new());
        let store = load_with(Arc::clone(&primary), Arc::clone(&fallback)).await;

        primary.fail_writes(true);
        store.update(|r| r.raw = true).await;

        // In-memory copy updated, fallback store took the write.
        assert!(store.snapshot().await.raw);
        assert_eq!(fallback.items()["raw"], json!(true));
    }

    #[tokio::test]
    async fn double_write_failure_does_not_crash() {
        let primary = Arc::new(MemoryStorage::new());
        let fallback = Arc::new(MemoryStorage::new());
        let store = load_with(Arc::clone(&primary), Arc::clone(&fallback)).await;

        primary.fail_writes(true);
        fallback.fail_writes(true);
        store.update(|r| r.debug = true).await;

        // The caller still sees the mutation.
        assert!(store.snapshot().await.debug);
    }

    #[tokio::test]
    async fn unreadable_primary_starts_from_defaults() {
        let primary = Arc::new(MemoryStorage::new());
        primary.fail_reads(true);
        let store = load_with(primary, Arc::new(MemoryStorage::new())).await;
        assert_eq!(store.snapshot().await, *store.defaults());
    }

    #[tokio::test]
    async fn stale_permissions_swept_on_load() {
        let primary = Arc::new(MemoryStorage::new());
        primary.seed(json!({
            "version": 4,
            "theme": "github",
            "compiler": "cmark",
            "raw": false,
            "header": false,
            "match": ".*",
            "content": {},
            "origins": {"https://kept.example": {"match": "", "csp": false, "encoding": ""}},
        }));

        let platform = MockPlatform::new();
        platform.grant_origins(&["https://kept.example/*", "https://stale.example/*"]);
        let store = Store::load(
            primary,
            Arc::new(MemoryStorage::new()),
            &registry(),
            &platform,
        )
        .await;
        drop(store);

        assert_eq!(
            platform.revoked_origins(),
            vec!["https://stale.example/*".to_string()]
        );
    }
}
