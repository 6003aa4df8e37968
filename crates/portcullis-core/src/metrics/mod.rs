//! Prometheus metrics facade for the proxy pipeline.
//!
//! Thin wrappers over the `metrics` macros so call sites stay one-liners and
//! metric names live in a single place. The exporter itself is installed by
//! the monitoring server.

/// Total request time per application: forwarder entry until the response
/// body has been written (or the client went away).
pub const TOTAL_TIME: &str = "portcullis_proxy_total_seconds";

/// Upstream time per application: request sent until response headers
/// arrived.
pub const UPSTREAM_TIME: &str = "portcullis_proxy_upstream_seconds";

/// Proxy errors per application and reason.
pub const ERRORS: &str = "portcullis_proxy_errors_total";

/// Registers metric descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_histogram!(TOTAL_TIME, "HTTP total response times");
    metrics::describe_histogram!(UPSTREAM_TIME, "HTTP upstream response times");
    metrics::describe_counter!(ERRORS, "HTTP proxy errors");
}

pub fn record_total_time(application: &str, seconds: f64) {
    metrics::histogram!(TOTAL_TIME, "application" => application.to_string()).record(seconds);
}

pub fn record_upstream_time(application: &str, seconds: f64) {
    metrics::histogram!(UPSTREAM_TIME, "application" => application.to_string()).record(seconds);
}

pub fn record_error(application: &str, reason: &'static str) {
    metrics::counter!(
        ERRORS,
        "application" => application.to_string(),
        "reason" => reason,
    )
    .increment(1);
}
