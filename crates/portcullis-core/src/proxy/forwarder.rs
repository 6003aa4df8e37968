//! The upstream HTTP forwarder.
//!
//! Builds the outbound request from the inbound one, executes it with
//! redirect-following disabled (3xx responses go back to the client so their
//! `Location` can be rewritten), and streams the response body through.
//! Transport failures and deadlines are rendered into the gateway envelope
//! here and never escape.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use http::{header, HeaderValue, StatusCode};

use crate::{
    config::{Application, ProxyConfig},
    metrics,
    proxy::ProxyError,
    types::{error_response, error_response_with_reason, ProxyRequest},
};

/// Forwards requests to resolved upstream URLs.
pub struct ProxyForwarder {
    client: reqwest::Client,
    config: Arc<ProxyConfig>,
    timeout: Duration,
}

impl ProxyForwarder {
    /// Creates the forwarder and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self, ProxyError> {
        let timeout = config.timeout_duration();
        let client = reqwest::ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls()
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build upstream http client");
                ProxyError::ClientBuild(e)
            })?;

        Ok(Self { client, config, timeout })
    }

    /// Proxies one request to `target_url` (path already rewritten, no query
    /// string) and returns the upstream response with the gateway's header
    /// policies applied.
    pub async fn forward(
        &self,
        request: ProxyRequest,
        target_url: &str,
        app_name: &str,
        app: &Application,
    ) -> Response {
        let started = Instant::now();

        let mut url = target_url.to_string();
        if let Some(query) = request.query() {
            url.push('?');
            url.push_str(query);
        }

        let host = request.host().to_string();
        let client_ip = request.client_ip();
        let method = request.method().clone();

        let mut headers = request.request.headers().clone();
        // Message framing is re-negotiated for the upstream hop; stale
        // values from the client connection would corrupt it.
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::HOST);
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(header::HOST, value);
        }
        if let Some(ip) = client_ip {
            let forwarded = match headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("X-Forwarded-For", value);
            }
        }
        for (name, value) in &self.config.set_request_headers {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let body = reqwest::Body::wrap_stream(request.request.into_body().into_data_stream());

        let mut builder = self
            .client
            .request(method, &url)
            .headers(headers)
            .timeout(self.timeout)
            .body(body);
        if let Some(username) = &app.backend.username {
            builder = builder.basic_auth(username, app.backend.password.as_deref());
        }

        let upstream = match builder.send().await {
            Ok(upstream) => upstream,
            Err(e) if e.is_timeout() => {
                tracing::error!(application = %app_name, url = %url, "upstream request timed out");
                metrics::record_error(app_name, "timeout");
                return error_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout");
            }
            Err(e) => {
                tracing::error!(application = %app_name, url = %url, error = %e, "could not proxy request");
                metrics::record_error(app_name, "upstream_unavailable");
                return error_response_with_reason(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service unavailable",
                    "no can do; sorry.",
                );
            }
        };

        metrics::record_upstream_time(app_name, started.elapsed().as_secs_f64());

        let mut response = Response::builder().status(upstream.status());
        if let Some(headers) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if self
                    .config
                    .strip_response_headers
                    .iter()
                    .any(|stripped| name.as_str().eq_ignore_ascii_case(stripped))
                {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
            for (name, value) in &self.config.set_response_headers {
                if let (Ok(name), Ok(value)) = (
                    header::HeaderName::try_from(name.as_str()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }

        let timed = TimedStream::new(upstream.bytes_stream(), app_name.to_string(), started);
        match response.body(Body::from_stream(timed)) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(application = %app_name, error = %e, "could not assemble upstream response");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

/// Wraps the upstream body stream so the total request time is observed when
/// the body finishes, or when the client goes away and the stream is
/// dropped.
struct TimedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    application: String,
    started: Instant,
    recorded: bool,
}

impl TimedStream {
    fn new(
        inner: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        application: String,
        started: Instant,
    ) -> Self {
        Self { inner: Box::pin(inner), application, started, recorded: false }
    }

    fn record_once(&mut self) {
        if !self.recorded {
            self.recorded = true;
            metrics::record_total_time(&self.application, self.started.elapsed().as_secs_f64());
        }
    }
}

impl Stream for TimedStream {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.as_mut().poll_next(cx);
        if matches!(polled, Poll::Ready(None)) {
            self.record_once();
        }
        polled
    }
}

impl Drop for TimedStream {
    fn drop(&mut self) {
        self.record_once();
    }
}
