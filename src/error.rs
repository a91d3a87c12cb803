//! Error types for the coordination engine.
//!
//! The taxonomy mirrors the failure domains of the engine: persistence,
//! migration, validation, probing, injection, compilation and host calls.
//! None of these are allowed to escape as a fault visible inside the page;
//! callers either degrade to "do nothing" or surface a diagnostic.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes of the coordination engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Writing the settings record to a durable store failed.
    #[error("settings store write failed: {0}")]
    StoreWrite(String),

    /// A registered migration transform failed; the chain halts at the
    /// version it had reached.
    #[error("migration v{from} -> v{to} failed: {reason}")]
    Migration {
        /// Version the record was at when the transform ran.
        from: u32,
        /// Version the transform was upgrading to.
        to: u32,
        /// Why the transform failed.
        reason: String,
    },

    /// A required top-level field was missing after migration.
    #[error("settings validation failed, missing fields: {missing:?}")]
    Validation {
        /// Names of the missing required fields.
        missing: Vec<String>,
    },

    /// The in-page detection probe could not run (unauthorized origin,
    /// unscriptable page). Always treated as "no match" by the detector.
    #[error("detection probe failed: {0}")]
    Probe(String),

    /// An injection protocol step failed.
    #[error("injection step `{step}` failed: {reason}")]
    Injection {
        /// Which protocol step failed.
        step: &'static str,
        /// Why it failed.
        reason: String,
    },

    /// The active compiler could not render the given source.
    #[error("compile failed: {0}")]
    Compile(String),

    /// A host platform call failed outside the more specific categories.
    #[error("host platform error: {0}")]
    Platform(String),

    /// The autoreload fetch failed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    /// A settings record could not be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an [`Error::Injection`] with the given step name.
    pub fn injection(step: &'static str, source: impl std::fmt::Display) -> Self {
        Error::Injection {
            step,
            reason: source.to_string(),
        }
    }
}
