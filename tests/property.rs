#![allow(clippy::unwrap_used)]
//! Property-based tests over the migration chain, origin matching and
//! math shielding.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use dashmark::compilers::CompilerRegistry;
use dashmark::math::MathGuard;
use dashmark::origins;
use dashmark::settings::{migrations, SettingsRecord, CURRENT_VERSION};

fn defaults() -> SettingsRecord {
    SettingsRecord::defaults(&CompilerRegistry::with_defaults())
}

/// JSON leaf values of the shapes old records actually contained.
fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (0u64..10u64).prop_map(Value::from),
        "[a-z]{0,12}".prop_map(Value::from),
    ]
    .boxed()
}

/// A plausible stored record: a known version and a scattering of the
/// fields old releases persisted, each possibly malformed.
fn stored_record() -> impl Strategy<Value = Map<String, Value>> {
    let field_names = prop::sample::subsequence(
        vec![
            "theme", "compiler", "raw", "header", "match", "content", "origins", "themes",
            "performance", "errorRecovery", "debug", "marked", "remark",
        ],
        0..8,
    );
    (proptest::option::of(1u64..=u64::from(CURRENT_VERSION)), field_names, prop::collection::vec(leaf(), 0..8))
        .prop_map(|(version, names, values)| {
            let mut record = Map::new();
            if let Some(version) = version {
                record.insert("version".into(), Value::from(version));
            }
            for (name, value) in names.into_iter().zip(values) {
                record.insert(name.to_string(), value);
            }
            record
        })
}

proptest! {
    /// Running the chain twice never changes anything the first run
    /// did not already settle.
    #[test]
    fn migration_chain_is_idempotent(mut record in stored_record()) {
        let first = migrations::run(&mut record);
        let settled = record.clone();

        let second = migrations::run(&mut record);
        prop_assert_eq!(&record, &settled);
        prop_assert_eq!(second.halted_at, first.halted_at);
    }

    /// A completed chain always lands on the current version.
    #[test]
    fn completed_migration_reaches_current_version(mut record in stored_record()) {
        let report = migrations::run(&mut record);
        if report.halted_at.is_none() {
            prop_assert_eq!(
                record.get("version").and_then(Value::as_u64),
                Some(u64::from(CURRENT_VERSION))
            );
        }
    }

    /// Matching never panics, whatever string the host hands over.
    #[test]
    fn url_match_tolerates_arbitrary_input(input in "\\PC{0,80}") {
        let record = defaults();
        let _ = origins::url_match(&record, &input);
        let _ = origins::header_match(&record, Some(&input));
    }

    /// Only notebook paths can ever match by filename.
    #[test]
    fn url_match_requires_notebook_path(name in "[a-z]{1,12}", ext in "(md|html|txt|rs)") {
        let mut record = defaults();
        record
            .origins
            .insert("*://*".into(), dashmark::settings::OriginRule::notebook(".*"));
        let url = format!("https://docs.example/{name}.{ext}");
        let nb_url = format!("https://docs.example/{name}.ipynb");
        prop_assert!(!origins::url_match(&record, &url));
        prop_assert!(origins::url_match(&record, &nb_url));
    }

    /// Shield then unshield is the identity on ordinary text.
    #[test]
    fn math_shielding_round_trips(text in "[ -~\n]{0,200}") {
        prop_assume!(!text.contains("@@MATH"));
        let mut guard = MathGuard::new();
        let shielded = guard.shield(&text);
        prop_assert_eq!(guard.unshield(&shielded), text);
    }
}

/// A malformed v1 record settles into a validatable shape once defaults
/// are merged underneath it.
#[test]
fn settled_record_with_defaults_validates() {
    let mut record = json!({
        "version": 1,
        "theme": {"theme": "github"},
        "origins": {"https://a.com": true},
    })
    .as_object()
    .cloned()
    .unwrap();

    let report = migrations::run(&mut record);
    assert!(report.halted_at.is_none());

    let mut merged = defaults().to_map().unwrap();
    merged.extend(record);
    assert!(migrations::validate(&merged).is_ok());
}
