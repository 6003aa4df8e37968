//! Shared request/response types for the proxy pipeline.
//!
//! Route handlers are boxed async closures over [`ProxyRequest`]. Behaviors
//! (cache, auth, rate limiting) wrap handlers and return new handlers, so a
//! route's final handler is the composition of everything registered for it.

use std::{future::Future, net::IpAddr, sync::Arc};

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use serde_json::json;

/// Upper bound for response bodies that are buffered by a decorator.
pub const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

/// Content type used for all gateway-generated JSON envelopes.
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf8";

/// A request travelling through the proxy pipeline.
///
/// Wraps the raw HTTP request together with the matched path parameters and
/// the peer address the connection was accepted from.
pub struct ProxyRequest {
    pub request: Request<Body>,
    pub params: Vec<(String, String)>,
    pub peer: Option<IpAddr>,
}

impl ProxyRequest {
    #[must_use]
    pub fn new(request: Request<Body>) -> Self {
        Self { request, params: Vec::new(), peer: None }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.request.headers_mut()
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// The client-visible host, from the `Host` header or the request URI.
    #[must_use]
    pub fn host(&self) -> &str {
        self.header(header::HOST.as_str())
            .or_else(|| self.request.uri().authority().map(|a| a.as_str()))
            .unwrap_or("")
    }

    /// The raw query string, without the leading `?`.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.request.uri().query()
    }

    /// Looks up a single query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Looks up a request cookie by name.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        let cookies = self.header(header::COOKIE.as_str())?;
        for pair in cookies.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                return parts.next().map(str::to_string);
            }
        }
        None
    }

    /// Looks up a matched path parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// The peer IP address, without the port.
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.peer
    }
}

pub type HandlerFuture = BoxFuture<'static, Response>;

/// A composable route handler. Behaviors take one of these and return a new
/// one wrapping it, which is how the per-route middleware stack is built.
pub type RouteHandler = Arc<dyn Fn(ProxyRequest) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure into a [`RouteHandler`].
pub fn route_handler<F, Fut>(f: F) -> RouteHandler
where
    F: Fn(ProxyRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// The handler pair bound to a route: one handler for safe methods
/// (GET/HEAD/OPTIONS), one for mutating methods (POST/PUT/PATCH/DELETE).
#[derive(Clone)]
pub struct HandlerPair {
    pub safe: RouteHandler,
    pub mutating: RouteHandler,
}

impl HandlerPair {
    /// Builds a pair where both methods share the same handler.
    #[must_use]
    pub fn shared(handler: RouteHandler) -> Self {
        Self { safe: handler.clone(), mutating: handler }
    }
}

/// A fully buffered response: status, headers, and body bytes.
///
/// Used wherever a decorator needs to observe or replay a complete response
/// (response cache entries, token reminting, OPTIONS synthesis).
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Drains a streaming response into a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the body fails or it exceeds
    /// [`MAX_BUFFERED_BODY`].
    pub async fn record(response: Response) -> Result<Self, axum::Error> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, MAX_BUFFERED_BODY).await?;
        Ok(Self { status: parts.status, headers: parts.headers, body })
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Replays the buffered response. The body bytes are exactly those
    /// captured by [`record`](Self::record).
    #[must_use]
    pub fn dump(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Builds the standard gateway error envelope `{"msg": …}`.
#[must_use]
pub fn error_response(status: StatusCode, msg: &str) -> Response {
    envelope(status, &json!({ "msg": msg }))
}

/// Builds the gateway error envelope with a detail field,
/// `{"msg": …, "reason": …}`.
#[must_use]
pub fn error_response_with_reason(status: StatusCode, msg: &str, reason: &str) -> Response {
    envelope(status, &json!({ "msg": msg, "reason": reason }))
}

fn envelope(status: StatusCode, body: &serde_json::Value) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, http::HeaderValue::from_static(JSON_CONTENT_TYPE));
    response
}
