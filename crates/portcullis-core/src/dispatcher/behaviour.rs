//! Route behaviors: the middleware a route's handler pair is wrapped in.
//!
//! Behaviors are applied in registration order, each wrapping the handler
//! the previous one produced. At request time the composition runs LIFO:
//! the behavior added last sees the request first.

use std::sync::Arc;

use axum::Router;

use crate::{
    auth::AuthPipeline,
    cache::ResponseCache,
    config::Application,
    ratelimit::RateLimiter,
    types::HandlerPair,
};

/// A middleware that decorates a route's handler pair.
pub trait Behavior: Send + Sync {
    /// Wraps the pair for one application. Behaviors an application has not
    /// opted into return the pair unchanged.
    fn apply(&self, app_name: &str, app: &Application, pair: HandlerPair) -> HandlerPair;

    /// Top-level routes this behavior contributes, if any.
    fn routes(&self) -> Option<Router> {
        None
    }
}

/// Response caching for applications with `caching.enabled`.
pub struct CachingBehavior {
    cache: Arc<ResponseCache>,
}

impl CachingBehavior {
    #[must_use]
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }
}

impl Behavior for CachingBehavior {
    fn apply(&self, _app_name: &str, app: &Application, mut pair: HandlerPair) -> HandlerPair {
        if app.caching.enabled {
            let ttl = (app.caching.ttl > 0)
                .then(|| std::time::Duration::from_secs(app.caching.ttl));
            pair.safe = self.cache.decorate_safe(pair.safe, ttl);
            if app.caching.auto_flush {
                pair.mutating = self.cache.decorate_unsafe(pair.mutating);
            }
        }
        pair
    }
}

/// Authentication for applications without `auth.disable`.
pub struct AuthenticationBehavior {
    pipeline: Arc<AuthPipeline>,
}

impl AuthenticationBehavior {
    #[must_use]
    pub fn new(pipeline: Arc<AuthPipeline>) -> Self {
        Self { pipeline }
    }
}

impl Behavior for AuthenticationBehavior {
    fn apply(&self, app_name: &str, app: &Application, mut pair: HandlerPair) -> HandlerPair {
        if !app.auth.disable {
            pair.safe = self.pipeline.decorate(pair.safe, app_name);
            pair.mutating = self.pipeline.decorate(pair.mutating, app_name);
        }
        pair
    }

    fn routes(&self) -> Option<Router> {
        self.pipeline.routes()
    }
}

/// Rate limiting for applications with `rateLimiting` set.
pub struct RateLimitBehavior {
    limiter: Arc<RateLimiter>,
}

impl RateLimitBehavior {
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Behavior for RateLimitBehavior {
    fn apply(&self, _app_name: &str, app: &Application, mut pair: HandlerPair) -> HandlerPair {
        if app.rate_limiting {
            pair.safe = self.limiter.decorate(pair.safe);
            pair.mutating = self.limiter.decorate(pair.mutating);
        }
        pair
    }
}
