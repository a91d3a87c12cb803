//! Versioned settings: the persisted record, its migrations and the store
//! that exclusively owns it.

pub mod migrations;
pub mod record;
pub mod store;

pub use record::{
    ContentFlags, ErrorRecovery, OriginRule, PerformanceTuning, SettingsRecord, CURRENT_VERSION,
    DEFAULT_THEME, NOTEBOOK_MATCH,
};
pub use store::Store;
