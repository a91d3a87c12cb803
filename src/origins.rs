//! Origin permission resolution.
//!
//! A navigation target is resolved against the precedence-ordered set of
//! permission rules in the settings record, most to least specific:
//! exact origin, scheme+hostname, wildcard-scheme with port, wildcard-scheme
//! hostname, global wildcard, and finally the dedicated local-file rule for
//! `file:` URLs. A resolved rule authorizes processing only if its `match`
//! pattern (or the global fallback pattern) matches the full URL.
//!
//! Filename-based detection is stricter than header-based detection: the
//! URL path must end in `.ipynb` before any rule is consulted, so it never
//! depends on header sniffing being enabled. Header-based detection is the
//! independent boolean check in [`header_match`].

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::settings::{OriginRule, SettingsRecord};

/// Resolve the most specific origin rule for `url`, if any. The dedicated
/// `file://` rule is consulted last, and only for local-file URLs.
pub fn resolve<'a>(record: &'a SettingsRecord, url: &Url) -> Option<&'a OriginRule> {
    let scheme = url.scheme();
    let port = url.port();

    if let Some(host) = url.host_str() {
        let mut candidates = Vec::with_capacity(5);
        if let Some(port) = port {
            candidates.push(format!("{scheme}://{host}:{port}"));
        }
        candidates.push(format!("{scheme}://{host}"));
        if let Some(port) = port {
            candidates.push(format!("*://{host}:{port}"));
        }
        candidates.push(format!("*://{host}"));
        candidates.push("*://*".to_string());

        if let Some(rule) = candidates
            .iter()
            .find_map(|origin| record.origins.get(origin))
        {
            return Some(rule);
        }
    }

    if scheme == "file" {
        record.origins.get("file://")
    } else {
        None
    }
}

/// Whether `url` names a notebook document this engine is authorized to
/// process. The stricter filename path: `.ipynb` suffix first, then origin
/// resolution, then the rule's URL pattern. Unparseable URLs and invalid
/// patterns are non-matches, never errors.
pub fn url_match(record: &SettingsRecord, url_str: &str) -> bool {
    let Ok(url) = Url::parse(url_str) else {
        return false;
    };
    if !url.path().ends_with(".ipynb") {
        return false;
    }

    let rule = resolve(record, &url);

    let pattern = match rule {
        Some(rule) if !rule.match_pattern.is_empty() => rule.match_pattern.as_str(),
        Some(_) => record.match_pattern.as_str(),
        // Local files are processable even without an explicit rule.
        None if url.scheme() == "file" => record.match_pattern.as_str(),
        None => return false,
    };

    match Regex::new(pattern) {
        Ok(re) => re.is_match(url_str),
        Err(e) => {
            debug!(pattern, error = %e, "invalid origin match pattern");
            false
        }
    }
}

/// Whether the supplied content type authorizes processing. True only when
/// header sniffing is enabled and the type matches a markdown/notebook
/// MIME pattern, independent of origin resolution.
pub fn header_match(record: &SettingsRecord, content_type: Option<&str>) -> bool {
    if !record.header {
        return false;
    }
    let Some(content_type) = content_type else {
        return false;
    };
    mime_pattern().is_match(content_type.trim())
}

#[allow(clippy::expect_used)]
fn mime_pattern() -> &'static Regex {
    static MIME: OnceLock<Regex> = OnceLock::new();
    MIME.get_or_init(|| {
        Regex::new(r"^(?:text/(?:x-)?markdown|application/x-ipynb\+json)\s*(?:;.*)?$")
            .expect("mime pattern compiles")
    })
}
