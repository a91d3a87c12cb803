//! Built-in CommonMark backend on pulldown-cmark.

use pulldown_cmark::{html, Options, Parser};
use serde::Deserialize;
use serde_json::{json, Value};

use super::Compiler;
use crate::error::Result;

/// Options recognized by the `cmark` backend.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
struct CmarkOptions {
    /// GFM extensions: tables, strikethrough, task lists.
    gfm: bool,
    /// Reference and inline footnotes.
    footnotes: bool,
    /// Smart punctuation (curly quotes, dashes, ellipses).
    smartypants: bool,
}

impl Default for CmarkOptions {
    fn default() -> Self {
        Self {
            gfm: true,
            footnotes: false,
            smartypants: false,
        }
    }
}

/// The default registered compiler.
pub struct CmarkCompiler;

impl Compiler for CmarkCompiler {
    fn name(&self) -> &'static str {
        "cmark"
    }

    fn defaults(&self) -> Value {
        json!({
            "gfm": true,
            "footnotes": false,
            "smartypants": false,
        })
    }

    fn description(&self) -> Value {
        json!({
            "gfm": "Toggle GFM extensions (tables, strikethrough, task lists)",
            "footnotes": "Toggle reference footnotes and inline footnotes",
            "smartypants": "Convert straight quotes and dashes to typographic forms",
        })
    }

    fn compile(&self, source: &str, options: &Value) -> Result<String> {
        // Unknown or malformed options fall back to the defaults.
        let opts: CmarkOptions =
            serde_json::from_value(options.clone()).unwrap_or_default();

        let mut flags = Options::empty();
        if opts.gfm {
            flags.insert(Options::ENABLE_TABLES);
            flags.insert(Options::ENABLE_STRIKETHROUGH);
            flags.insert(Options::ENABLE_TASKLISTS);
        }
        if opts.footnotes {
            flags.insert(Options::ENABLE_FOOTNOTES);
        }
        if opts.smartypants {
            flags.insert(Options::ENABLE_SMART_PUNCTUATION);
        }

        let parser = Parser::new_ext(source, flags);
        let mut out = String::with_capacity(source.len() * 2);
        html::push_html(&mut out, parser);
        Ok(out)
    }
}
