//! Gateway assembly and request helpers.

use std::{net::SocketAddr, sync::Arc};

use axum::{body::Body, extract::connect_info::MockConnectInfo, Router};
use bytes::Bytes;
use http::{Request, Response};
use tower::ServiceExt;

use portcullis_core::{
    auth::{AuthPipeline, CachedTokenStore, JwtVerifier, KvTokenStore, TokenStore},
    cache::ResponseCache,
    config::{
        Application, ApplicationAuth, Backend, Caching, Configuration, RateLimitingConfig,
        Routing, RoutingKind,
    },
    discovery::DnsResolver,
    dispatcher::{
        AuthenticationBehavior, Behavior, CachingBehavior, Dispatcher, RateLimitBehavior,
    },
    kv::{KvBackend, MemoryKv},
    proxy::ProxyForwarder,
    ratelimit::RateLimiter,
    testutil,
    types::BufferedResponse,
};

/// Host the tests present as the client-visible gateway host.
pub const GATEWAY_HOST: &str = "gateway.test";

/// A fully wired gateway over the in-memory backend.
pub struct TestGateway {
    pub router: Router,
    pub token_store: Arc<dyn TokenStore>,
    pub verifier: Arc<JwtVerifier>,
    pub kv: Arc<MemoryKv>,
}

/// Wires the full pipeline the way the server binary does, with the
/// in-memory backend standing in for Redis.
///
/// # Panics
///
/// Panics on invalid test configuration; tests own their configs.
#[must_use]
pub fn build_gateway(mut config: Configuration) -> TestGateway {
    if config.authentication.verification_key.is_none() {
        config.authentication.verification_key =
            Some(testutil::TEST_RSA_PUBLIC_PEM.to_string());
    }
    let config = Arc::new(config);

    let kv = Arc::new(MemoryKv::new());
    let kv_backend: Arc<dyn KvBackend> = kv.clone();

    let verifier = Arc::new(JwtVerifier::new(&config.authentication).unwrap());
    let token_store: Arc<dyn TokenStore> = Arc::new(CachedTokenStore::new(Arc::new(
        KvTokenStore::new(kv_backend.clone(), verifier.clone()),
    )));
    let pipeline = Arc::new(AuthPipeline::new(
        config.clone(),
        token_store.clone(),
        verifier.clone(),
    ));

    let limiter = Arc::new(RateLimiter::new(&config.rate_limiting, kv_backend));
    let cache = Arc::new(ResponseCache::new(ResponseCache::DEFAULT_CAPACITY));
    let forwarder = Arc::new(ProxyForwarder::new(Arc::new(config.proxy.clone())).unwrap());
    let resolver = Arc::new(DnsResolver::default());

    let mut dispatcher = Dispatcher::new(config.clone(), forwarder, resolver);
    dispatcher.add_behaviour(vec![
        Arc::new(CachingBehavior::new(cache)) as Arc<dyn Behavior>,
        Arc::new(AuthenticationBehavior::new(pipeline)),
        Arc::new(RateLimitBehavior::new(limiter)),
    ]);
    for (name, app) in &config.applications {
        dispatcher.register_application(name, app).unwrap();
    }
    dispatcher.initialize();

    let router = dispatcher
        .into_router()
        .layer(MockConnectInfo(SocketAddr::from(([10, 1, 2, 3], 52000))));

    TestGateway { router, token_store, verifier, kv }
}

/// A path-prefixed application pointing at `backend_url`, auth disabled.
#[must_use]
pub fn path_app(path: &str, backend_url: &str) -> Application {
    Application {
        routing: Routing {
            kind: RoutingKind::Path,
            path: path.to_string(),
            ..Routing::default()
        },
        backend: Backend { url: Some(backend_url.to_string()), ..Backend::default() },
        auth: ApplicationAuth { disable: true, ..ApplicationAuth::default() },
        caching: Caching::default(),
        rate_limiting: false,
    }
}

/// A pattern-routed application pointing at `backend_url`, auth disabled.
#[must_use]
pub fn pattern_app(patterns: &[(&str, &str)], backend_url: &str) -> Application {
    let mut app = path_app("/unused", backend_url);
    app.routing.kind = RoutingKind::Pattern;
    app.routing.path = String::new();
    app.routing.patterns = patterns
        .iter()
        .map(|(public, target)| ((*public).to_string(), (*target).to_string()))
        .collect();
    app
}

/// A configuration with one named application and test-suitable global
/// rate limiting.
#[must_use]
pub fn config_with_app(name: &str, app: Application) -> Configuration {
    let mut config = Configuration::default();
    config.applications.insert(name.to_string(), app);
    config.rate_limiting = RateLimitingConfig { burst: 3, window: 60 };
    config
}

/// Sends one request through the gateway router and buffers the response.
///
/// # Panics
///
/// Panics if the router fails, which tests treat as fatal.
pub async fn send(router: &Router, request: Request<Body>) -> BufferedResponse {
    let response: Response<axum::body::Body> =
        router.clone().oneshot(request).await.expect("router call cannot fail");
    BufferedResponse::record(response).await.expect("response buffering cannot fail")
}

/// Builds a request with the gateway test host set.
#[must_use]
pub fn gateway_request(method: &str, uri: &str) -> http::request::Builder {
    Request::builder().method(method).uri(uri).header("Host", GATEWAY_HOST)
}

/// Shorthand for an empty-body request.
#[must_use]
pub fn empty_body() -> Body {
    Body::empty()
}

/// Shorthand for a bytes body.
#[must_use]
pub fn bytes_body(bytes: &[u8]) -> Body {
    Body::from(Bytes::copy_from_slice(bytes))
}
