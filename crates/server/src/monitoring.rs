//! The monitoring listener: Prometheus exposition and a liveness probe.

use axum::{body::Body, response::Response, routing::get, Router};
use http::{header, HeaderValue};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Installs the global Prometheus recorder and registers the gateway's
/// metric descriptions.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    portcullis_core::metrics::describe();
    Ok(handle)
}

/// Builds the monitoring router.
#[must_use]
pub fn create_monitoring_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .route("/status", get(handle_status))
}

async fn handle_status() -> Response {
    let mut response = Response::new(Body::from(r#"{"status":"ok"}"#));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
