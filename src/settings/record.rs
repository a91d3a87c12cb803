//! The persisted settings record and its default synthesis.
//!
//! The record is stored as a flat JSON object under a fixed set of
//! top-level keys, with per-compiler option objects as additional
//! top-level keys (captured by the flattened `extra` map). The schema
//! version is embedded as `version`; see [`crate::settings::migrations`]
//! for how stored records are advanced to [`CURRENT_VERSION`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compilers::CompilerRegistry;

/// Current schema version of the persisted record.
pub const CURRENT_VERSION: u32 = 4;

/// Default URL match pattern: a `.ipynb` suffix, optionally followed by a
/// fragment or query string.
pub const NOTEBOOK_MATCH: &str = r"\.ipynb(?:#.*|\?.*)?$";

/// Default theme id.
pub const DEFAULT_THEME: &str = "github";

/// The single source of configuration truth.
///
/// Exclusively owned by the settings store; every other component sees it
/// as a read-mostly snapshot and mutates it only through
/// [`crate::settings::Store::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRecord {
    /// Monotonic schema version; never decreases.
    pub version: u32,
    /// Active theme id.
    pub theme: String,
    /// Active compiler backend id.
    pub compiler: String,
    /// Show source instead of rendered output.
    pub raw: bool,
    /// Content-type sniffing enabled.
    #[serde(default)]
    pub header: bool,
    /// Global fallback URL match pattern.
    #[serde(rename = "match")]
    pub match_pattern: String,
    /// Presentation toggles (e.g. `wide`), pushed to the page verbatim.
    #[serde(default)]
    pub themes: BTreeMap<String, bool>,
    /// Feature flags for the rendering pipeline.
    pub content: ContentFlags,
    /// Permission rules keyed by origin pattern.
    #[serde(default)]
    pub origins: BTreeMap<String, OriginRule>,
    /// Rendering performance tuning.
    #[serde(default)]
    pub performance: PerformanceTuning,
    /// Failure recovery tuning.
    #[serde(rename = "errorRecovery", default)]
    pub error_recovery: ErrorRecovery,
    /// Verbose diagnostics.
    #[serde(default)]
    pub debug: bool,
    /// Per-compiler option objects, stored as additional top-level keys
    /// named after the compiler.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Named feature flags consumed by the rendering pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFlags {
    /// Replace emoji shortcodes.
    #[serde(default)]
    pub emoji: bool,
    /// Persist scroll position across reloads.
    #[serde(default = "yes")]
    pub scroll: bool,
    /// Build a table of contents.
    #[serde(default = "yes")]
    pub toc: bool,
    /// Typeset math.
    #[serde(default = "yes")]
    pub mathjax: bool,
    /// Poll the source and re-render on change.
    #[serde(default)]
    pub autoreload: bool,
    /// Render mermaid diagrams.
    #[serde(default)]
    pub mermaid: bool,
    /// Syntax-highlight code blocks.
    #[serde(default = "yes")]
    pub syntax: bool,
}

fn yes() -> bool {
    true
}

impl Default for ContentFlags {
    fn default() -> Self {
        Self {
            emoji: false,
            scroll: true,
            toc: true,
            mathjax: true,
            autoreload: false,
            mermaid: false,
            syntax: true,
        }
    }
}

/// A permission granted for one scheme+host(+path) scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRule {
    /// URL match pattern for this origin; empty means "use the global
    /// fallback pattern".
    #[serde(rename = "match", default)]
    pub match_pattern: String,
    /// Whether a relaxed content security policy is required.
    #[serde(default)]
    pub csp: bool,
    /// Forced text encoding, empty for auto.
    #[serde(default)]
    pub encoding: String,
}

impl OriginRule {
    /// Rule created for a newly added origin: notebook-suffix match,
    /// strict CSP, auto encoding.
    pub fn notebook(match_pattern: impl Into<String>) -> Self {
        Self {
            match_pattern: match_pattern.into(),
            csp: false,
            encoding: String::new(),
        }
    }
}

/// Rendering performance tuning block, added by the v3 -> v4 migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTuning {
    /// Defer rendering of off-screen cells.
    pub lazy_load: bool,
    /// Enable the detection result cache.
    pub cache_enabled: bool,
    /// Upper bound on cells rendered per pass.
    pub max_cells_per_render: u32,
    /// Use virtual scrolling for very large documents.
    pub virtual_scrolling: bool,
}

impl Default for PerformanceTuning {
    fn default() -> Self {
        Self {
            lazy_load: true,
            cache_enabled: true,
            max_cells_per_render: 50,
            virtual_scrolling: false,
        }
    }
}

/// Failure recovery tuning block, added by the v3 -> v4 migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecovery {
    /// Inject the in-page fallback script alongside the pipeline.
    pub auto_retry: bool,
    /// Maximum in-page render retries.
    pub max_retries: u32,
    /// Delay before a failed tab becomes eligible for re-injection.
    #[serde(rename = "retryDelay")]
    pub retry_delay_ms: u64,
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl SettingsRecord {
    /// Synthesize the default record at the current schema version, with
    /// each registered compiler's own default options merged in as
    /// top-level keys.
    pub fn defaults(compilers: &CompilerRegistry) -> Self {
        let mut themes = BTreeMap::new();
        themes.insert("wide".to_string(), true);

        let mut origins = BTreeMap::new();
        origins.insert(
            "file://".to_string(),
            OriginRule::notebook(NOTEBOOK_MATCH),
        );

        let mut extra = BTreeMap::new();
        for name in compilers.names() {
            if let Some(compiler) = compilers.get(&name) {
                extra.insert(name, compiler.defaults());
            }
        }

        Self {
            version: CURRENT_VERSION,
            theme: DEFAULT_THEME.to_string(),
            compiler: compilers.default_name(),
            raw: false,
            header: false,
            match_pattern: NOTEBOOK_MATCH.to_string(),
            themes,
            content: ContentFlags::default(),
            origins,
            performance: PerformanceTuning::default(),
            error_recovery: ErrorRecovery::default(),
            debug: false,
            extra,
        }
    }

    /// Serialize to the flat persisted form.
    pub fn to_map(&self) -> crate::error::Result<serde_json::Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(crate::error::Error::StoreWrite(format!(
                "settings record serialized to non-object: {other}"
            ))),
        }
    }
}
