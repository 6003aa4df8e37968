//! In-process response cache.
//!
//! An LRU of fully buffered responses keyed by the request fingerprint
//! `<method>|<uri>|<Accept>`. The cache is exposed as two handler
//! decorators: the *safe* decorator serves and stores GET/HEAD responses,
//! the *unsafe* decorator evicts the fingerprint before a mutating request
//! is proxied.
//!
//! The cache honors neither upstream `Cache-Control` nor `Vary` beyond
//! `Accept`: applications opt into caching explicitly in their
//! configuration.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::response::IntoResponse;
use http::{header, HeaderValue, StatusCode};
use lru::LruCache;
use parking_lot::Mutex;

use crate::types::{error_response, BufferedResponse, ProxyRequest, RouteHandler};

const X_CACHE: &str = "X-Cache";

struct CacheSlot {
    response: Arc<BufferedResponse>,
    stored_at: Instant,
    ttl: Option<Duration>,
}

impl CacheSlot {
    fn fresh(&self) -> bool {
        self.ttl.is_none_or(|ttl| self.stored_at.elapsed() < ttl)
    }
}

/// Thread-safe LRU of buffered responses.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheSlot>>,
}

impl ResponseCache {
    pub const DEFAULT_CAPACITY: usize = 4096;

    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)) }
    }

    /// The cache key for a request: `<method>|<uri>|<Accept>`.
    #[must_use]
    pub fn fingerprint(request: &ProxyRequest) -> String {
        format!(
            "{}|{}|{}",
            request.method(),
            request.uri(),
            request.header(header::ACCEPT.as_str()).unwrap_or("")
        )
    }

    fn lookup(&self, key: &str) -> Option<Arc<BufferedResponse>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(slot) if slot.fresh() => Some(slot.response.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: String, response: Arc<BufferedResponse>, ttl: Option<Duration>) {
        self.entries
            .lock()
            .put(key, CacheSlot { response, stored_at: Instant::now(), ttl });
    }

    fn evict(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wraps a safe-method handler with cache lookup and insertion.
    ///
    /// `Cache-Control: no-cache` skips both lookup and insertion (PASS).
    /// Error responses (status >= 400) are never stored. A hit replays the
    /// buffered entry byte for byte; the `X-Cache` header is the only
    /// addition.
    pub fn decorate_safe(
        self: &Arc<Self>,
        handler: RouteHandler,
        ttl: Option<Duration>,
    ) -> RouteHandler {
        let cache = self.clone();
        Arc::new(move |request: ProxyRequest| {
            let cache = cache.clone();
            let inner = handler.clone();
            Box::pin(async move {
                let key = Self::fingerprint(&request);
                let use_cache = request.header(header::CACHE_CONTROL.as_str()) != Some("no-cache");

                if use_cache {
                    if let Some(entry) = cache.lookup(&key) {
                        let mut response = entry.dump();
                        response
                            .headers_mut()
                            .insert(X_CACHE, HeaderValue::from_static("HIT"));
                        return response;
                    }
                }

                let response = inner(request).await;
                let buffered = match BufferedResponse::record(response).await {
                    Ok(buffered) => buffered,
                    Err(e) => {
                        tracing::error!(error = %e, "could not buffer response for caching");
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "internal server error",
                        );
                    }
                };

                let store = use_cache && buffered.status.as_u16() < 400;
                let verdict = if store { "MISS" } else { "PASS" };
                if store {
                    cache.store(key, Arc::new(buffered.clone()), ttl);
                }

                let mut response = buffered.into_response();
                response.headers_mut().insert(X_CACHE, HeaderValue::from_static(verdict));
                response
            })
        })
    }

    /// Wraps a mutating-method handler: the request's fingerprint is evicted
    /// unconditionally before the inner handler runs (PURGED).
    pub fn decorate_unsafe(self: &Arc<Self>, handler: RouteHandler) -> RouteHandler {
        let cache = self.clone();
        Arc::new(move |request: ProxyRequest| {
            let cache = cache.clone();
            let inner = handler.clone();
            Box::pin(async move {
                // Auto-flush evicts the safe-method entries sharing this
                // URI and Accept pair.
                let accept = request.header(header::ACCEPT.as_str()).unwrap_or("").to_string();
                for method in ["GET", "HEAD", "OPTIONS"] {
                    cache.evict(&format!("{}|{}|{}", method, request.uri(), accept));
                }
                let mut response = inner(request).await;
                response.headers_mut().insert(X_CACHE, HeaderValue::from_static("PURGED"));
                response
            })
        })
    }
}
