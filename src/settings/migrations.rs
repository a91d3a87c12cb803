//! Schema migrations for the persisted settings record.
//!
//! Migrations run on the raw JSON form of the record, before it is
//! deserialized into [`SettingsRecord`], so that any legacy shape can be
//! normalized exactly once at load time and never accommodated ad hoc
//! downstream. Each transform advances the record by one version and is
//! idempotent: applying it twice to its own output is a no-op, because a
//! record may already be partially normalized by manual edits.
//!
//! A missing transform advances the version with a warning; a failing
//! transform halts the chain at the version it had reached. Neither is
//! fatal - the store validates the result and falls back to defaults on
//! irrecoverable corruption.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::record::{
    ContentFlags, ErrorRecovery, OriginRule, PerformanceTuning, SettingsRecord, CURRENT_VERSION,
    DEFAULT_THEME, NOTEBOOK_MATCH,
};
use crate::compilers::CompilerRegistry;
use crate::error::Error;

type JsonMap = Map<String, Value>;

/// Outcome of a migration run.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Human-readable warnings recorded along the chain.
    pub warnings: Vec<String>,
    /// Version the chain halted at, when a transform failed.
    pub halted_at: Option<u32>,
}

impl MigrationReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

/// Advance `record` from its stored version to [`CURRENT_VERSION`].
pub fn run(record: &mut JsonMap) -> MigrationReport {
    let mut report = MigrationReport::default();

    let mut version = match record.get("version").and_then(Value::as_u64) {
        Some(v) => v as u32,
        None => {
            record.insert("version".into(), Value::from(1));
            1
        }
    };
    debug!(from = version, to = CURRENT_VERSION, "running settings migrations");

    while version < CURRENT_VERSION {
        let next = version + 1;
        match transform_for(version) {
            Some(transform) => {
                if let Err(reason) = transform(record) {
                    let error = Error::Migration {
                        from: version,
                        to: next,
                        reason,
                    };
                    report.warn(error.to_string());
                    report.halted_at = Some(version);
                    return report;
                }
            }
            None => {
                report.warn(format!(
                    "no migration registered for v{version} -> v{next}, advancing version only"
                ));
            }
        }
        version = next;
        record.insert("version".into(), Value::from(version));
    }

    report
}

/// Check that every required top-level field is present and non-null.
pub fn validate(record: &JsonMap) -> crate::error::Result<()> {
    const REQUIRED: [&str; 8] = [
        "version", "theme", "compiler", "raw", "header", "match", "content", "origins",
    ];
    let missing: Vec<String> = REQUIRED
        .iter()
        .filter(|field| matches!(record.get(**field), None | Some(Value::Null)))
        .map(|field| field.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { missing })
    }
}

/// Fresh default record at the current version, used when validation
/// fails after migration.
pub fn reset(compilers: &CompilerRegistry) -> SettingsRecord {
    warn!("settings record irrecoverably corrupted, resetting to defaults");
    SettingsRecord::defaults(compilers)
}

type Transform = fn(&mut JsonMap) -> Result<(), String>;

fn transform_for(version: u32) -> Option<Transform> {
    match version {
        1 => Some(v1_to_v2),
        2 => Some(v2_to_v3),
        3 => Some(v3_to_v4),
        _ => None,
    }
}

/// v1 -> v2: canonical theme id, `themes` object, origin rules as full
/// objects instead of the legacy boolean shorthand.
fn v1_to_v2(record: &mut JsonMap) -> Result<(), String> {
    let theme = match record.get("theme") {
        // The transient structured form carried `{name, url}`; keep the id.
        Some(Value::Object(obj)) => obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_THEME)
            .to_string(),
        Some(Value::String(name)) if !name.is_empty() && name != "*" => name.clone(),
        _ => DEFAULT_THEME.to_string(),
    };
    record.insert("theme".into(), Value::String(theme));

    if !record.get("themes").is_some_and(Value::is_object) {
        record.insert("themes".into(), Value::Object(JsonMap::new()));
    }

    normalize_origins(record);
    Ok(())
}

/// v2 -> v3: explicit boolean defaults for every content flag, deprecated
/// fields dropped, `raw` coerced to a boolean.
fn v2_to_v3(record: &mut JsonMap) -> Result<(), String> {
    let defaults = ContentFlags::default();
    let defaults = serde_json::to_value(defaults).map_err(|e| e.to_string())?;
    let Value::Object(defaults) = defaults else {
        return Err("content defaults serialized to non-object".into());
    };

    let mut content = match record.remove("content") {
        Some(Value::Object(map)) => map,
        _ => JsonMap::new(),
    };
    for (flag, default) in defaults {
        let valid = content.get(&flag).is_some_and(Value::is_boolean);
        if !valid {
            content.insert(flag, default);
        }
    }
    record.insert("content".into(), Value::Object(content));

    // Deprecated per-compiler option.
    if let Some(Value::Object(marked)) = record.get_mut("marked") {
        marked.remove("tables");
    }

    if !record.get("raw").is_some_and(Value::is_boolean) {
        record.insert("raw".into(), Value::Bool(false));
    }
    Ok(())
}

/// v3 -> v4: performance and error-recovery tuning blocks, any remaining
/// legacy boolean origin entries normalized, `debug` flag added.
fn v3_to_v4(record: &mut JsonMap) -> Result<(), String> {
    if !record.get("performance").is_some_and(Value::is_object) {
        let block = serde_json::to_value(PerformanceTuning::default()).map_err(|e| e.to_string())?;
        record.insert("performance".into(), block);
    }
    if !record.get("errorRecovery").is_some_and(Value::is_object) {
        let block = serde_json::to_value(ErrorRecovery::default()).map_err(|e| e.to_string())?;
        record.insert("errorRecovery".into(), block);
    }

    normalize_origins(record);

    if !record.get("debug").is_some_and(Value::is_boolean) {
        record.insert("debug".into(), Value::Bool(false));
    }
    Ok(())
}

/// Upgrade legacy boolean origin entries to full [`OriginRule`] objects
/// and make sure every rule carries a `csp` field.
fn normalize_origins(record: &mut JsonMap) {
    let Some(Value::Object(origins)) = record.get_mut("origins") else {
        return;
    };
    for (_origin, rule) in origins.iter_mut() {
        match rule {
            Value::Object(fields) => {
                if !fields.get("csp").is_some_and(Value::is_boolean) {
                    fields.insert("csp".into(), Value::Bool(false));
                }
            }
            _ => {
                // Legacy boolean shorthand (or junk) becomes a full rule.
                #[allow(clippy::expect_used)]
                let full = serde_json::to_value(OriginRule::notebook(NOTEBOOK_MATCH))
                    .expect("origin rule serializes to an object");
                *rule = full;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn migrates_minimal_v1_record_to_current() {
        let mut record = as_map(json!({"version": 1, "theme": "github"}));
        let report = run(&mut record);

        assert!(report.halted_at.is_none());
        assert_eq!(record["version"], json!(4));
        assert_eq!(record["theme"], json!("github"));
        assert_eq!(record["content"]["mathjax"], json!(true));
        assert_eq!(record["debug"], json!(false));
        assert_eq!(record["raw"], json!(false));
        assert!(record["performance"].is_object());
        assert!(record["errorRecovery"].is_object());
    }

    #[test]
    fn version_absent_means_v1() {
        let mut record = as_map(json!({"theme": "github"}));
        run(&mut record);
        assert_eq!(record["version"], json!(4));
    }

    #[test]
    fn legacy_boolean_origin_becomes_rule() {
        let mut record = as_map(json!({
            "version": 1,
            "origins": {"file://": true, "https://example.com": false},
        }));
        run(&mut record);
        assert_eq!(
            record["origins"]["file://"]["match"],
            json!(super::NOTEBOOK_MATCH)
        );
        assert_eq!(record["origins"]["file://"]["csp"], json!(false));
        assert!(record["origins"]["https://example.com"].is_object());
    }

    #[test]
    fn structured_theme_collapses_to_id() {
        let mut record = as_map(json!({
            "version": 1,
            "theme": {"name": "jupyter", "url": "/themes/jupyter.css"},
        }));
        run(&mut record);
        assert_eq!(record["theme"], json!("jupyter"));
    }

    #[test]
    fn wildcard_theme_resets_to_default() {
        let mut record = as_map(json!({"version": 1, "theme": "*"}));
        run(&mut record);
        assert_eq!(record["theme"], json!("github"));
    }

    #[test]
    fn explicit_content_flags_survive() {
        let mut record = as_map(json!({
            "version": 2,
            "content": {"mathjax": false, "toc": false},
        }));
        run(&mut record);
        assert_eq!(record["content"]["mathjax"], json!(false));
        assert_eq!(record["content"]["toc"], json!(false));
        // Absent flags were filled in.
        assert_eq!(record["content"]["scroll"], json!(true));
        assert_eq!(record["content"]["syntax"], json!(true));
    }

    #[test]
    fn deprecated_marked_tables_dropped() {
        let mut record = as_map(json!({
            "version": 2,
            "marked": {"tables": true, "gfm": true},
        }));
        run(&mut record);
        assert_eq!(record["marked"], json!({"gfm": true}));
    }

    #[test]
    fn non_boolean_raw_coerced() {
        let mut record = as_map(json!({"version": 2, "raw": "ipynb"}));
        run(&mut record);
        assert_eq!(record["raw"], json!(false));
    }

    #[test]
    fn transforms_are_idempotent() {
        for transform in [v1_to_v2 as Transform, v2_to_v3, v3_to_v4] {
            let mut once = as_map(json!({
                "theme": {"name": "jupyter"},
                "raw": "ipynb",
                "content": {"emoji": true},
                "origins": {"file://": true, "*://*": {"match": "x"}},
                "marked": {"tables": true},
            }));
            transform(&mut once).unwrap();
            let mut twice = once.clone();
            transform(&mut twice).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn gap_version_warns_and_advances() {
        // Version 0 has no registered transform.
        let mut record = as_map(json!({"version": 0}));
        let report = run(&mut record);
        assert_eq!(record["version"], json!(4));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("no migration registered for v0")));
    }

    #[test]
    fn future_version_left_alone() {
        let mut record = as_map(json!({"version": 9, "theme": "github"}));
        let report = run(&mut record);
        assert_eq!(record["version"], json!(9));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn validate_reports_missing_fields() {
        let record = as_map(json!({"version": 4, "theme": "github"}));
        let Err(Error::Validation { missing }) = validate(&record) else {
            panic!("expected a validation error");
        };
        assert!(missing.contains(&"compiler".to_string()));
        assert!(missing.contains(&"origins".to_string()));
        assert!(!missing.contains(&"version".to_string()));
    }

    #[test]
    fn validate_accepts_migrated_defaults() {
        let registry = CompilerRegistry::with_defaults();
        let record = SettingsRecord::defaults(&registry).to_map().unwrap();
        assert!(validate(&record).is_ok());
    }

    #[test]
    fn null_field_counts_as_missing() {
        let record = as_map(json!({"version": 4, "theme": null}));
        let Err(Error::Validation { missing }) = validate(&record) else {
            panic!("expected a validation error");
        };
        assert!(missing.contains(&"theme".to_string()));
    }
}
