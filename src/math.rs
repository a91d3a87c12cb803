//! Math delimiter shield for the markdown compile path.
//!
//! Markdown compilers mangle TeX spans (`*` becomes emphasis, `\\` a hard
//! break). When math typesetting is enabled, math spans are swapped for
//! opaque placeholder tokens before compilation and restored in the HTML
//! afterwards, leaving the typesetter to process the untouched TeX.

use std::sync::OnceLock;

use regex::{Captures, Regex};

/// One shield/unshield cycle around a single compilation.
#[derive(Debug, Default)]
pub struct MathGuard {
    spans: Vec<String>,
}

impl MathGuard {
    /// Fresh guard with no captured spans.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every math span in `source` with a placeholder token.
    pub fn shield(&mut self, source: &str) -> String {
        math_pattern()
            .replace_all(source, |caps: &Captures<'_>| {
                let token = format!("@@MATH{}@@", self.spans.len());
                self.spans.push(caps[0].to_string());
                token
            })
            .into_owned()
    }

    /// Restore the captured spans into compiled HTML.
    pub fn unshield(&self, html: &str) -> String {
        token_pattern()
            .replace_all(html, |caps: &Captures<'_>| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| self.spans.get(i))
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

#[allow(clippy::expect_used)]
fn math_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Display math first so `$$` is not consumed as two inline `$`.
        Regex::new(r"(?s)\$\$.+?\$\$|\\\[.+?\\\]|\\\(.+?\\\)|\$[^\$\n]+?\$")
            .expect("math pattern compiles")
    })
}

#[allow(clippy::expect_used)]
fn token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@@MATH(\d+)@@").expect("token pattern compiles"))
}
