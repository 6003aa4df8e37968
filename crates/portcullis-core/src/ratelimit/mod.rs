//! Fixed-window burst rate limiting backed by the shared KV.
//!
//! The limiter itself is stateless: each request performs one atomic
//! create-and-decrement against `RL_BUCKET_<client>` in the backend, so
//! every gateway replica observes the same counters. The limiter never
//! blocks and never retries; backend failures answer 503 without
//! propagating.

use std::{sync::Arc, time::Duration};

use http::{header, HeaderValue, StatusCode};

use crate::{
    config::RateLimitingConfig,
    kv::{KvBackend, KvError},
    types::{error_response, ProxyRequest, RouteHandler},
};

const X_RATE_LIMIT: &str = "X-RateLimit";
const X_RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";

/// Per-client token bucket over the shared backend.
pub struct RateLimiter {
    burst: i64,
    window: Duration,
    kv: Arc<dyn KvBackend>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitingConfig, kv: Arc<dyn KvBackend>) -> Self {
        tracing::info!(burst = config.burst, window = config.window, "initializing rate limiter");
        Self { burst: config.burst, window: config.window_duration(), kv }
    }

    /// The identity a bucket is keyed by: the verbatim `Authorization`
    /// header with whitespace removed, or the source IP without the port.
    #[must_use]
    pub fn identify_client(request: &ProxyRequest) -> String {
        if let Some(auth) = request.header(header::AUTHORIZATION.as_str()) {
            return auth.split_whitespace().collect();
        }
        request
            .client_ip()
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
    }

    /// Takes one token from the client's bucket, returning the decremented
    /// counter value. Negative values mean the bucket was already drained.
    async fn take(&self, client: &str) -> Result<i64, KvError> {
        let key = format!("RL_BUCKET_{client}");
        self.kv.counter_take(&key, self.burst, self.window).await
    }

    /// Wraps a handler with the rate limit check.
    ///
    /// `X-RateLimit` and `X-RateLimit-Remaining` are set exactly once on
    /// every response this decorator produces, including rejections.
    pub fn decorate(self: &Arc<Self>, handler: RouteHandler) -> RouteHandler {
        let limiter = self.clone();
        Arc::new(move |request: ProxyRequest| {
            let limiter = limiter.clone();
            let inner = handler.clone();
            Box::pin(async move {
                let client = Self::identify_client(&request);
                let remaining = match limiter.take(&client).await {
                    Ok(remaining) => remaining,
                    Err(e) => {
                        tracing::error!(error = %e, client = %client, "rate limiter backend failure");
                        let mut response = error_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "service unavailable",
                        );
                        let headers = response.headers_mut();
                        headers.insert(X_RATE_LIMIT, header_value(limiter.burst));
                        headers.insert(X_RATE_LIMIT_REMAINING, header_value(0));
                        return response;
                    }
                };

                let mut response = if remaining < 0 {
                    error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
                } else {
                    inner(request).await
                };

                let headers = response.headers_mut();
                headers.insert(X_RATE_LIMIT, header_value(limiter.burst));
                headers.insert(X_RATE_LIMIT_REMAINING, header_value(remaining.max(0)));
                response
            })
        })
    }
}

fn header_value(n: i64) -> HeaderValue {
    HeaderValue::from_str(&n.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::response::Response;
    use http::Request;

    use super::*;
    use crate::{
        kv::{HashScan, MemoryKv},
        types::route_handler,
    };

    /// Backend whose every operation fails, for the 503 path.
    struct FailingKv;

    #[async_trait]
    impl KvBackend for FailingKv {
        async fn hash_put(&self, _key: &str, _fields: &[(&str, &str)]) -> Result<(), KvError> {
            Err(KvError::Connection("backend is down".to_string()))
        }

        async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<String>, KvError> {
            Err(KvError::Connection("backend is down".to_string()))
        }

        async fn hash_get_all(
            &self,
            _key: &str,
        ) -> Result<HashMap<String, String>, KvError> {
            Err(KvError::Connection("backend is down".to_string()))
        }

        async fn expire_at(&self, _key: &str, _unix_seconds: i64) -> Result<(), KvError> {
            Err(KvError::Connection("backend is down".to_string()))
        }

        async fn counter_take(
            &self,
            _key: &str,
            _initial: i64,
            _window: Duration,
        ) -> Result<i64, KvError> {
            Err(KvError::Connection("backend is down".to_string()))
        }

        async fn scan_hashes(&self, _pattern: &str) -> Result<HashScan, KvError> {
            Err(KvError::Connection("backend is down".to_string()))
        }
    }

    fn limiter(burst: i64) -> Arc<RateLimiter> {
        let config = RateLimitingConfig { burst, window: 60 };
        Arc::new(RateLimiter::new(&config, Arc::new(MemoryKv::new())))
    }

    fn request(auth: Option<&str>) -> ProxyRequest {
        let mut builder = Request::builder().uri("/r");
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        let mut req = ProxyRequest::new(builder.body(Body::empty()).unwrap());
        req.peer = Some("10.0.0.7:43210".parse::<std::net::SocketAddr>().unwrap().ip());
        req
    }

    fn ok_handler() -> RouteHandler {
        route_handler(|_req| async { Response::new(Body::from("ok")) })
    }

    fn header_i64(response: &Response, name: &str) -> i64 {
        response.headers().get(name).unwrap().to_str().unwrap().parse().unwrap()
    }

    #[test]
    fn client_identity_prefers_authorization_without_whitespace() {
        assert_eq!(
            RateLimiter::identify_client(&request(Some("Bearer  abc def"))),
            "Bearerabcdef"
        );
        assert_eq!(RateLimiter::identify_client(&request(None)), "10.0.0.7");
    }

    #[tokio::test]
    async fn burst_of_three_admits_exactly_three() {
        let handler = limiter(3).decorate(ok_handler());

        let mut statuses = Vec::new();
        let mut remaining = Vec::new();
        for _ in 0..4 {
            let response = handler(request(None)).await;
            statuses.push(response.status().as_u16());
            remaining.push(header_i64(&response, X_RATE_LIMIT_REMAINING));
            assert_eq!(header_i64(&response, X_RATE_LIMIT), 3);
        }

        assert_eq!(statuses, vec![200, 200, 200, 429]);
        assert_eq!(remaining, vec![2, 1, 0, 0]);
    }

    #[tokio::test]
    async fn rejection_carries_envelope_and_headers() {
        let handler = limiter(1).decorate(ok_handler());
        handler(request(None)).await;

        let response = handler(request(None)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_i64(&response, X_RATE_LIMIT_REMAINING), 0);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"msg":"rate limit exceeded"}"#);
    }

    #[tokio::test]
    async fn separate_clients_get_separate_buckets() {
        let handler = limiter(1).decorate(ok_handler());

        assert_eq!(handler(request(Some("Bearer a"))).await.status(), StatusCode::OK);
        assert_eq!(handler(request(Some("Bearer b"))).await.status(), StatusCode::OK);
        assert_eq!(
            handler(request(Some("Bearer a"))).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn headers_are_present_exactly_once() {
        let handler = limiter(2).decorate(ok_handler());
        let response = handler(request(None)).await;
        assert_eq!(response.headers().get_all(X_RATE_LIMIT).iter().count(), 1);
        assert_eq!(response.headers().get_all(X_RATE_LIMIT_REMAINING).iter().count(), 1);
    }

    #[tokio::test]
    async fn backend_failure_is_503_with_headers() {
        let config = RateLimitingConfig { burst: 3, window: 60 };
        let limiter = Arc::new(RateLimiter::new(&config, Arc::new(FailingKv)));
        let handler = limiter.decorate(ok_handler());

        let response = handler(request(None)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header_i64(&response, X_RATE_LIMIT), 3);
        assert_eq!(header_i64(&response, X_RATE_LIMIT_REMAINING), 0);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"msg":"service unavailable"}"#);
    }
}
