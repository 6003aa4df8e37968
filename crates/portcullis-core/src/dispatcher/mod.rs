//! The route table: application registration and middleware composition.
//!
//! Registration is two-phase. [`Dispatcher::register_application`] derives
//! an application's routes (path-prefix or pattern-set), wraps the
//! forwarding closure with the application's hyperlink rewriter and the
//! behavior stack, and binds safe and mutating handlers to their methods.
//! [`Dispatcher::initialize`] then merges routes contributed by behaviors
//! (the authentication endpoint) and the 404 fallback.

pub mod behaviour;

pub use behaviour::{AuthenticationBehavior, Behavior, CachingBehavior, RateLimitBehavior};

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, RawPathParams, Request},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use http::{header, HeaderValue, StatusCode};
use regex::Regex;
use thiserror::Error;

use crate::{
    config::{Application, Configuration, RoutingKind},
    discovery::ServiceResolver,
    proxy::ProxyForwarder,
    rewrite::{HyperlinkRewriter, RewriteError},
    types::{error_response, BufferedResponse, HandlerPair, ProxyRequest, RouteHandler},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("application '{0}' has no backend url or service")]
    NoBackend(String),

    #[error("application '{0}': invalid URL mapping: {1}")]
    InvalidMapping(String, RewriteError),
}

/// Builds the proxy route table.
pub struct Dispatcher {
    config: Arc<Configuration>,
    forwarder: Arc<ProxyForwarder>,
    resolver: Arc<dyn ServiceResolver>,
    behaviours: Vec<Arc<dyn Behavior>>,
    router: Router,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: Arc<Configuration>,
        forwarder: Arc<ProxyForwarder>,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Self {
        Self {
            config,
            forwarder,
            resolver,
            behaviours: Vec::new(),
            router: Router::new(),
        }
    }

    /// Adds behaviors to the stack. Behaviors are called in LIFO order at
    /// request time: the one added last runs first.
    pub fn add_behaviour(&mut self, behaviours: Vec<Arc<dyn Behavior>>) {
        self.behaviours.extend(behaviours);
    }

    /// Derives and registers the routes of one application.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing backend or an uncompilable URL
    /// mapping. Registration errors are fatal at startup.
    pub fn register_application(
        &mut self,
        name: &str,
        app: &Application,
    ) -> Result<(), DispatchError> {
        let backend_url = self.backend_url(name, app)?;
        tracing::info!(application = %name, backend = %backend_url, "registering application");

        let app_arc = Arc::new(app.clone());
        let mut routes: Vec<(String, RouteHandler)> = Vec::new();
        let rewriter = match app.routing.kind {
            RoutingKind::Path => {
                let prefix = app.routing.path.trim_end_matches('/').to_string();
                let handler = self.path_handler(name, &app_arc, &backend_url, &prefix);
                let base = if prefix.is_empty() { "/".to_string() } else { prefix.clone() };
                routes.push((base, handler.clone()));
                routes.push((format!("{prefix}/{{*path}}"), handler));
                HyperlinkRewriter::for_path_prefix()
            }
            RoutingKind::Pattern => {
                for (pattern, target) in &app.routing.patterns {
                    let handler = self.pattern_handler(name, &app_arc, &backend_url, target);
                    routes.push((to_axum_path(pattern), handler));
                }
                HyperlinkRewriter::for_patterns(&app.routing.patterns)
            }
        }
        .map_err(|e| DispatchError::InvalidMapping(name.to_string(), e))?;
        let rewriter = Arc::new(rewriter);

        for (path, handler) in routes {
            let decorated = rewriter.clone().decorate(handler);
            let mut pair = HandlerPair::shared(decorated);
            for behaviour in &self.behaviours {
                pair = behaviour.apply(name, app, pair);
            }

            let options_handler = if self.config.proxy.options.enabled {
                synthesize_options(pair.safe.clone(), self.config.proxy.options.cors)
            } else {
                pair.safe.clone()
            };

            let method_router = get(into_axum_handler(pair.safe.clone()))
                .head(into_axum_handler(pair.safe))
                .options(into_axum_handler(options_handler))
                .post(into_axum_handler(pair.mutating.clone()))
                .put(into_axum_handler(pair.mutating.clone()))
                .patch(into_axum_handler(pair.mutating.clone()))
                .delete(into_axum_handler(pair.mutating));

            self.router = std::mem::take(&mut self.router).route(&path, method_router);
        }

        Ok(())
    }

    /// Finishes registration: merges behavior-contributed routes.
    pub fn initialize(&mut self) {
        let contributed: Vec<Router> =
            self.behaviours.iter().filter_map(|b| b.routes()).collect();
        for routes in contributed {
            self.router = std::mem::take(&mut self.router).merge(routes);
        }
    }

    /// Consumes the dispatcher into the servable router. Unknown routes
    /// answer 404.
    #[must_use]
    pub fn into_router(self) -> Router {
        self.router.fallback(handle_not_found)
    }

    fn backend_url(&self, name: &str, app: &Application) -> Result<String, DispatchError> {
        if let Some(url) = &app.backend.url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        if let Some(service) = &app.backend.service {
            return Ok(self.resolver.resolve(service, app.backend.tag.as_deref()));
        }
        Err(DispatchError::NoBackend(name.to_string()))
    }

    /// Handler for a path-prefix route: strips the prefix and forwards the
    /// remainder to the backend.
    fn path_handler(
        &self,
        name: &str,
        app: &Arc<Application>,
        backend_url: &str,
        prefix: &str,
    ) -> RouteHandler {
        let forwarder = self.forwarder.clone();
        let app = app.clone();
        let name = name.to_string();
        let backend_url = backend_url.to_string();
        let prefix = prefix.to_string();

        Arc::new(move |request: ProxyRequest| {
            let forwarder = forwarder.clone();
            let app = app.clone();
            let name = name.clone();
            let backend_url = backend_url.clone();
            let prefix = prefix.clone();
            Box::pin(async move {
                let sanitized = {
                    let path = request.uri().path();
                    path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string()
                };
                let target = format!("{backend_url}{sanitized}");
                forwarder.forward(request, &target, &name, &app).await
            })
        })
    }

    /// Handler for one pattern route: substitutes the target template's
    /// named parameters with the matched path parameters.
    fn pattern_handler(
        &self,
        name: &str,
        app: &Arc<Application>,
        backend_url: &str,
        target: &str,
    ) -> RouteHandler {
        let forwarder = self.forwarder.clone();
        let app = app.clone();
        let name = name.to_string();
        let backend_url = backend_url.to_string();
        let target = target.to_string();
        let parameters = template_parameters(&target);

        Arc::new(move |request: ProxyRequest| {
            let forwarder = forwarder.clone();
            let app = app.clone();
            let name = name.clone();
            let backend_url = backend_url.clone();
            let target = target.to_string();
            let parameters = parameters.clone();
            Box::pin(async move {
                let mut path = target;
                for parameter in &parameters {
                    if let Some(value) = request.param(parameter) {
                        path = path.replace(&format!(":{parameter}"), value);
                    }
                }
                let url = format!("{backend_url}{path}");
                forwarder.forward(request, &url, &name, &app).await
            })
        })
    }
}

/// Converts a `:name` routing pattern into axum's `{name}` syntax.
fn to_axum_path(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => format!("{{{name}}}"),
            None => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Names of the `:name` parameters in a target template.
fn template_parameters(target: &str) -> Vec<String> {
    let placeholder = Regex::new(":([a-zA-Z0-9]+)").expect("placeholder regex is valid");
    placeholder
        .captures_iter(target)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Adapts a [`RouteHandler`] into an axum handler, carrying the matched
/// path parameters and the peer address into the [`ProxyRequest`].
fn into_axum_handler(
    handler: RouteHandler,
) -> impl Fn(RawPathParams, Request) -> futures::future::BoxFuture<'static, Response>
       + Clone
       + Send
       + Sync
       + 'static {
    move |params: RawPathParams, request: Request| {
        let handler = handler.clone();
        Box::pin(async move {
            let params: Vec<(String, String)> =
                params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip());
            handler(ProxyRequest { request, params, peer }).await
        })
    }
}

/// The synthesized OPTIONS handler: records the safe handler's response and
/// overlays `Allow` (and, with CORS, `Access-Control-*`) where missing.
fn synthesize_options(handler: RouteHandler, cors: bool) -> RouteHandler {
    const ALLOWED: &str = "GET, HEAD, POST, PUT, PATCH, DELETE, OPTIONS";

    Arc::new(move |request: ProxyRequest| {
        let inner = handler.clone();
        Box::pin(async move {
            let response = inner(request).await;
            let mut buffered = match BufferedResponse::record(response).await {
                Ok(buffered) => buffered,
                Err(e) => {
                    tracing::error!(error = %e, "could not buffer OPTIONS response");
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error",
                    );
                }
            };

            if !buffered.headers.contains_key(header::ALLOW) {
                buffered.headers.insert(header::ALLOW, HeaderValue::from_static(ALLOWED));
            }
            if cors {
                let overlay: [(&str, &str); 4] = [
                    ("Access-Control-Allow-Origin", "*"),
                    ("Access-Control-Allow-Methods", ALLOWED),
                    ("Access-Control-Allow-Headers", "X-Requested-With, Authorization, Content-Type"),
                    ("Access-Control-Allow-Credentials", "true"),
                ];
                for (name, value) in overlay {
                    if !buffered.headers.contains_key(name) {
                        if let (Ok(name), Ok(value)) = (
                            header::HeaderName::try_from(name),
                            HeaderValue::from_str(value),
                        ) {
                            buffered.headers.insert(name, value);
                        }
                    }
                }
            }

            buffered.into_response()
        })
    })
}

async fn handle_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}
