//! Swappable markdown compiler backends.
//!
//! The rendering pipeline itself is an external collaborator; the engine
//! only needs a way to turn source text into HTML for the `markdown`
//! message, using the active backend and its per-backend options stored
//! in the settings record. Backends register their own default options,
//! which the settings store merges in at load time.

mod cmark;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

pub use cmark::CmarkCompiler;

/// One markdown rendering backend.
pub trait Compiler: Send + Sync {
    /// Stable backend id, used as the settings key for its options.
    fn name(&self) -> &'static str;

    /// Default option object for this backend.
    fn defaults(&self) -> Value;

    /// Human-readable description of each option, for the settings UI.
    fn description(&self) -> Value;

    /// Compile markdown source to HTML with the given options. Options
    /// not recognized by the backend are ignored.
    fn compile(&self, source: &str, options: &Value) -> Result<String>;
}

/// Registry of available backends.
pub struct CompilerRegistry {
    backends: BTreeMap<String, Arc<dyn Compiler>>,
}

impl CompilerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
        }
    }

    /// Registry with the built-in backend registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CmarkCompiler));
        registry
    }

    /// Register a backend under its own name.
    pub fn register(&mut self, compiler: Arc<dyn Compiler>) {
        self.backends.insert(compiler.name().to_string(), compiler);
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Compiler>> {
        self.backends.get(name)
    }

    /// Names of all registered backends.
    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Name of the backend new records default to: the first registered,
    /// or `cmark` for an empty registry.
    pub fn default_name(&self) -> String {
        self.backends
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "cmark".to_string())
    }
}

impl Default for CompilerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
