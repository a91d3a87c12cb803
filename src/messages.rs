//! Request/response message routing.
//!
//! The router is the protocol boundary between the engine and its two
//! clients: the injected page (config, compilation, autoreload) and the
//! settings UI (popup and options surfaces). Requests form a closed
//! tagged enum dispatched by pattern matching; the wire tag is the
//! `message` field. Handlers that change settings persist through the
//! store and push a live-update notice to the active tab rather than
//! requiring it to poll.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::compilers::CompilerRegistry;
use crate::fetch::Fetcher;
use crate::math::MathGuard;
use crate::platform::{ConfigPayload, Platform};
use crate::settings::{ContentFlags, OriginRule, Store};

/// Every request the engine accepts, tagged by the wire `message` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum Request {
    /// Liveness check from the UI.
    #[serde(rename = "ping")]
    Ping,
    /// The page asks for its configuration payload.
    #[serde(rename = "get-config")]
    GetConfig,
    /// Compile markdown source with the active compiler.
    #[serde(rename = "markdown")]
    Markdown {
        /// Source text to compile.
        markdown: String,
    },
    /// Parsed notebook JSON for the rendering pipeline.
    #[serde(rename = "nbjson")]
    NbJson {
        /// The notebook document.
        nbjson: Value,
    },
    /// Fetch a URL bypassing caches.
    #[serde(rename = "autoreload")]
    Autoreload {
        /// URL to fetch.
        location: String,
    },
    /// Full settings snapshot for the popup.
    #[serde(rename = "popup")]
    Popup,
    /// Switch the active theme.
    #[serde(rename = "popup.theme")]
    PopupTheme {
        /// New theme id.
        theme: String,
    },
    /// Toggle raw source display.
    #[serde(rename = "popup.raw")]
    PopupRaw {
        /// New raw flag.
        raw: bool,
    },
    /// Replace the presentation toggles.
    #[serde(rename = "popup.themes")]
    PopupThemes {
        /// New toggles.
        themes: BTreeMap<String, bool>,
    },
    /// Reset all settings except origins to defaults.
    #[serde(rename = "popup.defaults")]
    PopupDefaults,
    /// Switch the active compiler backend.
    #[serde(rename = "popup.compiler.name")]
    PopupCompilerName {
        /// Backend id.
        compiler: String,
    },
    /// Replace one backend's options.
    #[serde(rename = "popup.compiler.options")]
    PopupCompilerOptions {
        /// Backend id.
        compiler: String,
        /// New option object.
        options: Value,
    },
    /// Replace the content flags.
    #[serde(rename = "popup.content")]
    PopupContent {
        /// New flags.
        content: ContentFlags,
    },
    /// Origin list for the options page.
    #[serde(rename = "options.origins")]
    OptionsOrigins,
    /// Toggle content-type sniffing.
    #[serde(rename = "options.header")]
    OptionsHeader {
        /// New header flag.
        header: bool,
    },
    /// Grant a new origin.
    #[serde(rename = "origin.add")]
    OriginAdd {
        /// Origin pattern, e.g. `https://example.com`.
        origin: String,
    },
    /// Remove a granted origin.
    #[serde(rename = "origin.remove")]
    OriginRemove {
        /// Origin pattern.
        origin: String,
    },
    /// Replace one origin's rule in place.
    #[serde(rename = "origin.update")]
    OriginUpdate {
        /// Origin pattern.
        origin: String,
        /// New rule.
        options: OriginRule,
    },
}

/// Responses, serialized in the same shapes the page and UI expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Liveness acknowledgement.
    Pong {
        /// Status tag.
        status: String,
        /// Engine identity.
        extension: String,
    },
    /// The page configuration payload.
    Config {
        /// Payload attached to the page global.
        config: ConfigPayload,
    },
    /// Compiled HTML.
    Html {
        /// The rendered fragment.
        html: String,
    },
    /// Notebook JSON handed back to the pipeline.
    NbJson {
        /// The notebook document.
        nbjson: Value,
    },
    /// Autoreload fetch result.
    Fetched {
        /// Error description, when the fetch failed.
        err: Option<String>,
        /// Body text, when it succeeded.
        body: Option<String>,
    },
    /// Popup settings snapshot.
    Popup(PopupSnapshot),
    /// Origin list for the options page.
    Origins {
        /// Granted origins and their rules.
        origins: BTreeMap<String, OriginRule>,
        /// Whether header sniffing is on.
        header: bool,
        /// Global fallback pattern.
        r#match: String,
    },
    /// Empty acknowledgement for mutations.
    Done {},
}

/// Everything the popup needs in one round trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopupSnapshot {
    /// Active theme id.
    pub theme: String,
    /// Raw source display flag.
    pub raw: bool,
    /// Presentation toggles.
    pub themes: BTreeMap<String, bool>,
    /// Content flags.
    pub content: ContentFlags,
    /// Active backend id.
    pub compiler: String,
    /// Active backend's current options.
    pub options: Value,
    /// Active backend's option descriptions.
    pub description: Value,
    /// All registered backend ids.
    pub compilers: Vec<String>,
}

/// Push-style notices delivered to the active tab after a settings
/// mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum ContentNotice {
    /// The theme changed; restyle in place.
    #[serde(rename = "theme")]
    Theme {
        /// New theme id.
        theme: String,
    },
    /// The presentation toggles changed.
    #[serde(rename = "themes")]
    Themes {
        /// New toggles.
        themes: BTreeMap<String, bool>,
    },
    /// Raw display toggled; re-render.
    #[serde(rename = "raw")]
    Raw {
        /// New raw flag.
        raw: bool,
    },
    /// Settings changed in a way that needs a full reload.
    #[serde(rename = "reload")]
    Reload,
}

/// Stateless request dispatcher.
pub struct MessageRouter {
    store: Arc<Store>,
    compilers: Arc<CompilerRegistry>,
    platform: Arc<dyn Platform>,
    fetcher: Fetcher,
}

impl MessageRouter {
    /// New router over a ready store.
    pub fn new(
        store: Arc<Store>,
        compilers: Arc<CompilerRegistry>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            store,
            compilers,
            platform,
            fetcher: Fetcher::new(),
        }
    }

    /// Dispatch one request.
    pub async fn handle(&self, request: Request) -> Response {
        debug!(?request, "dispatching message");
        match request {
            Request::Ping => Response::Pong {
                status: "ok".to_string(),
                extension: "dashmark".to_string(),
            },

            Request::GetConfig => {
                let record = self.store.snapshot().await;
                Response::Config {
                    config: ConfigPayload {
                        theme: record.theme,
                        raw: record.raw,
                        themes: record.themes,
                        content: record.content,
                        compiler: record.compiler,
                    },
                }
            }

            Request::Markdown { markdown } => Response::Html {
                html: self.compile(&markdown).await,
            },

            Request::NbJson { nbjson } => Response::NbJson { nbjson },

            Request::Autoreload { location } => match self.fetcher.fetch_fresh(&location).await {
                Ok(body) => Response::Fetched {
                    err: None,
                    body: Some(body),
                },
                Err(e) => Response::Fetched {
                    err: Some(e.to_string()),
                    body: None,
                },
            },

            Request::Popup => {
                let record = self.store.snapshot().await;
                let compiler = self.compilers.get(&record.compiler);
                let options = record
                    .extra
                    .get(&record.compiler)
                    .cloned()
                    .or_else(|| compiler.map(|c| c.defaults()))
                    .unwrap_or(Value::Null);
                let description = compiler.map(|c| c.description()).unwrap_or(Value::Null);
                Response::Popup(PopupSnapshot {
                    theme: record.theme,
                    raw: record.raw,
                    themes: record.themes,
                    content: record.content,
                    compiler: record.compiler,
                    options,
                    description,
                    compilers: self.compilers.names(),
                })
            }

            Request::PopupTheme { theme } => {
                self.store.update(|r| r.theme = theme.clone()).await;
                self.notify(ContentNotice::Theme { theme }).await;
                Response::Done {}
            }

            Request::PopupRaw { raw } => {
                self.store.update(|r| r.raw = raw).await;
                self.notify(ContentNotice::Raw { raw }).await;
                Response::Done {}
            }

            Request::PopupThemes { themes } => {
                self.store.update(|r| r.themes = themes.clone()).await;
                self.notify(ContentNotice::Themes { themes }).await;
                Response::Done {}
            }

            Request::PopupDefaults => {
                let defaults = self.store.defaults().clone();
                self.store
                    .update(|r| {
                        let origins = std::mem::take(&mut r.origins);
                        *r = defaults;
                        r.origins = origins;
                    })
                    .await;
                self.notify(ContentNotice::Reload).await;
                Response::Done {}
            }

            Request::PopupCompilerName { compiler } => {
                self.store.update(|r| r.compiler = compiler).await;
                self.notify(ContentNotice::Reload).await;
                Response::Done {}
            }

            Request::PopupCompilerOptions { compiler, options } => {
                self.store
                    .update(|r| {
                        r.extra.insert(compiler, options);
                    })
                    .await;
                self.notify(ContentNotice::Reload).await;
                Response::Done {}
            }

            Request::PopupContent { content } => {
                self.store.update(|r| r.content = content).await;
                self.notify(ContentNotice::Reload).await;
                self.rewatch().await;
                Response::Done {}
            }

            Request::OptionsOrigins => {
                let record = self.store.snapshot().await;
                Response::Origins {
                    origins: record.origins,
                    header: record.header,
                    r#match: record.match_pattern,
                }
            }

            Request::OptionsHeader { header } => {
                self.store.update(|r| r.header = header).await;
                Response::Done {}
            }

            Request::OriginAdd { origin } => {
                let pattern = self.store.defaults().match_pattern.clone();
                self.store
                    .update(|r| {
                        r.origins.insert(origin, OriginRule::notebook(pattern));
                    })
                    .await;
                self.rewatch().await;
                Response::Done {}
            }

            Request::OriginRemove { origin } => {
                self.store
                    .update(|r| {
                        r.origins.remove(&origin);
                    })
                    .await;
                self.rewatch().await;
                Response::Done {}
            }

            Request::OriginUpdate { origin, options } => {
                self.store
                    .update(|r| {
                        r.origins.insert(origin, options);
                    })
                    .await;
                self.rewatch().await;
                Response::Done {}
            }
        }
    }

    /// Compile markdown with the active backend, shielding math spans
    /// when typesetting is enabled. A failure becomes an HTML error
    /// fragment, never an error to the page.
    async fn compile(&self, source: &str) -> String {
        let record = self.store.snapshot().await;
        let Some(compiler) = self.compilers.get(&record.compiler) else {
            warn!(compiler = %record.compiler, "active compiler is not registered");
            return error_fragment(&format!("unknown compiler `{}`", record.compiler));
        };
        let options = record
            .extra
            .get(&record.compiler)
            .cloned()
            .unwrap_or_else(|| compiler.defaults());

        let mut guard = MathGuard::new();
        let prepared = if record.content.mathjax {
            guard.shield(source)
        } else {
            source.to_string()
        };

        match compiler.compile(&prepared, &options) {
            Ok(html) if record.content.mathjax => guard.unshield(&html),
            Ok(html) => html,
            Err(e) => {
                warn!(error = %e, "markdown compilation failed");
                error_fragment(&e.to_string())
            }
        }
    }

    /// Best-effort push notice to the active tab.
    async fn notify(&self, notice: ContentNotice) {
        if let Err(e) = self.platform.notify_active_tab(&notice).await {
            debug!(error = %e, "active tab notice not delivered");
        }
    }

    /// Re-evaluate which origins the host should observe.
    async fn rewatch(&self) {
        let record = self.store.snapshot().await;
        let origins: Vec<String> = record.origins.keys().cloned().collect();
        if let Err(e) = self.platform.watch_origins(&origins).await {
            debug!(error = %e, "origin watch re-evaluation failed");
        }
    }
}

fn error_fragment(reason: &str) -> String {
    format!(
        "<pre class=\"dashmark-error\">Rendering failed: {}</pre>",
        html_escape(reason)
    )
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compilers::Compiler;
    use crate::error::{Error, Result};
    use crate::test_support::{HostCall, MemoryStorage, MockPlatform};
    use serde_json::json;

    async fn router_with(platform: Arc<MockPlatform>) -> MessageRouter {
        router_with_registry(platform, CompilerRegistry::with_defaults()).await
    }

    async fn router_with_registry(
        platform: Arc<MockPlatform>,
        registry: CompilerRegistry,
    ) -> MessageRouter {
        let registry = Arc::new(registry);
        let store = Store::load(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            &registry,
            platform.as_ref(),
        )
        .await;
        MessageRouter::new(store, registry, platform)
    }

    #[test]
    fn requests_deserialize_from_wire_tags() {
        let request: Request =
            serde_json::from_value(json!({"message": "ping"})).unwrap();
        assert_eq!(request, Request::Ping);

        let request: Request = serde_json::from_value(json!({
            "message": "popup.theme",
            "theme": "jupyter",
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::PopupTheme {
                theme: "jupyter".into()
            }
        );

        let request: Request = serde_json::from_value(json!({
            "message": "origin.update",
            "origin": "https://a.com",
            "options": {"match": "x", "csp": true, "encoding": "utf-8"},
        }))
        .unwrap();
        assert!(matches!(request, Request::OriginUpdate { .. }));

        assert!(serde_json::from_value::<Request>(json!({"message": "nope"})).is_err());
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let router = router_with(Arc::new(MockPlatform::new())).await;
        let response = router.handle(Request::Ping).await;
        assert!(matches!(response, Response::Pong { ref status, .. } if status == "ok"));
    }

    #[tokio::test]
    async fn get_config_reflects_the_record() {
        let router = router_with(Arc::new(MockPlatform::new())).await;
        let Response::Config { config } = router.handle(Request::GetConfig).await else {
            panic!("expected config response");
        };
        assert_eq!(config.theme, "github");
        assert_eq!(config.compiler, "cmark");
        assert!(config.content.mathjax);
    }

    #[tokio::test]
    async fn markdown_compiles_with_active_backend() {
        let router = router_with(Arc::new(MockPlatform::new())).await;
        let Response::Html { html } = router
            .handle(Request::Markdown {
                markdown: "# Hi".into(),
            })
            .await
        else {
            panic!("expected html response");
        };
        assert!(html.contains("<h1>Hi</h1>"));
    }

    #[tokio::test]
    async fn markdown_preserves_math_spans() {
        let router = router_with(Arc::new(MockPlatform::new())).await;
        let Response::Html { html } = router
            .handle(Request::Markdown {
                markdown: "value $a * b$ here".into(),
            })
            .await
        else {
            panic!("expected html response");
        };
        assert!(html.contains("$a * b$"));
        assert!(!html.contains("<em>"));
    }

    struct FailingCompiler;

    impl Compiler for FailingCompiler {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn defaults(&self) -> Value {
            json!({})
        }
        fn description(&self) -> Value {
            json!({})
        }
        fn compile(&self, _source: &str, _options: &Value) -> Result<String> {
            Err(Error::Compile("<bad input>".into()))
        }
    }

    #[tokio::test]
    async fn compile_failure_becomes_error_fragment() {
        let mut registry = CompilerRegistry::new();
        registry.register(Arc::new(FailingCompiler));
        let router = router_with_registry(Arc::new(MockPlatform::new()), registry).await;

        let Response::Html { html } = router
            .handle(Request::Markdown {
                markdown: "x".into(),
            })
            .await
        else {
            panic!("expected html response");
        };
        assert!(html.contains("dashmark-error"));
        // The reason is escaped, not injected.
        assert!(html.contains("&lt;bad input&gt;"));
    }

    #[tokio::test]
    async fn nbjson_is_echoed_to_the_pipeline() {
        let router = router_with(Arc::new(MockPlatform::new())).await;
        let notebook = json!({"cells": [], "nbformat": 4});
        let response = router
            .handle(Request::NbJson {
                nbjson: notebook.clone(),
            })
            .await;
        assert_eq!(response, Response::NbJson { nbjson: notebook });
    }

    #[tokio::test]
    async fn theme_change_persists_and_notifies() {
        let platform = Arc::new(MockPlatform::new());
        let router = router_with(Arc::clone(&platform)).await;

        router
            .handle(Request::PopupTheme {
                theme: "jupyter".into(),
            })
            .await;

        assert_eq!(router.store.snapshot().await.theme, "jupyter");
        assert!(platform.calls().iter().any(|call| matches!(
            call,
            HostCall::Notify {
                notice: ContentNotice::Theme { .. }
            }
        )));
    }

    #[tokio::test]
    async fn defaults_reset_preserves_origins() {
        let platform = Arc::new(MockPlatform::new());
        let router = router_with(Arc::clone(&platform)).await;

        router
            .handle(Request::OriginAdd {
                origin: "https://kept.example".into(),
            })
            .await;
        router
            .handle(Request::PopupTheme {
                theme: "jupyter".into(),
            })
            .await;

        router.handle(Request::PopupDefaults).await;

        let record = router.store.snapshot().await;
        assert_eq!(record.theme, "github");
        assert!(record.origins.contains_key("https://kept.example"));
        assert!(platform.calls().iter().any(|call| matches!(
            call,
            HostCall::Notify {
                notice: ContentNotice::Reload
            }
        )));
    }

    #[tokio::test]
    async fn compiler_switch_pushes_reload() {
        let platform = Arc::new(MockPlatform::new());
        let router = router_with(Arc::clone(&platform)).await;

        router
            .handle(Request::PopupCompilerOptions {
                compiler: "cmark".into(),
                options: json!({"gfm": false}),
            })
            .await;

        let record = router.store.snapshot().await;
        assert_eq!(record.extra["cmark"], json!({"gfm": false}));
    }

    #[tokio::test]
    async fn origin_lifecycle_updates_watch_list() {
        let platform = Arc::new(MockPlatform::new());
        let router = router_with(Arc::clone(&platform)).await;

        router
            .handle(Request::OriginAdd {
                origin: "https://a.com".into(),
            })
            .await;
        let record = router.store.snapshot().await;
        assert_eq!(
            record.origins["https://a.com"].match_pattern,
            record.match_pattern
        );

        router
            .handle(Request::OriginUpdate {
                origin: "https://a.com".into(),
                options: OriginRule {
                    match_pattern: "custom".into(),
                    csp: true,
                    encoding: "utf-8".into(),
                },
            })
            .await;
        assert!(router.store.snapshot().await.origins["https://a.com"].csp);

        router
            .handle(Request::OriginRemove {
                origin: "https://a.com".into(),
            })
            .await;
        assert!(!router
            .store
            .snapshot()
            .await
            .origins
            .contains_key("https://a.com"));

        // Every origin mutation re-evaluated the watch list.
        let watches = platform
            .calls()
            .iter()
            .filter(|call| matches!(call, HostCall::WatchOrigins { .. }))
            .count();
        assert_eq!(watches, 3);
    }

    #[tokio::test]
    async fn popup_snapshot_includes_compiler_surface() {
        let router = router_with(Arc::new(MockPlatform::new())).await;
        let Response::Popup(snapshot) = router.handle(Request::Popup).await else {
            panic!("expected popup response");
        };
        assert_eq!(snapshot.compiler, "cmark");
        assert_eq!(snapshot.compilers, vec!["cmark".to_string()]);
        assert!(snapshot.options.is_object());
        assert!(snapshot.description.is_object());
    }

    #[tokio::test]
    async fn options_surface_round_trips_header() {
        let router = router_with(Arc::new(MockPlatform::new())).await;

        router.handle(Request::OptionsHeader { header: true }).await;
        let Response::Origins { header, .. } = router.handle(Request::OptionsOrigins).await else {
            panic!("expected origins response");
        };
        assert!(header);
    }

    #[test]
    fn notices_serialize_with_wire_tags() {
        let notice = serde_json::to_value(ContentNotice::Reload).unwrap();
        assert_eq!(notice, json!({"message": "reload"}));

        let notice = serde_json::to_value(ContentNotice::Theme {
            theme: "github".into(),
        })
        .unwrap();
        assert_eq!(notice, json!({"message": "theme", "theme": "github"}));
    }
}
