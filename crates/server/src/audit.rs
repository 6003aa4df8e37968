//! Audit logging for authenticated requests.
//!
//! One fan-out listener on the auth pipeline: every authenticated request
//! emits a structured event under the `audit` target, which deployments
//! route to their log shipper via the subscriber configuration.

use portcullis_core::{auth::AuthRequestListener, types::ProxyRequest};

/// Emits one `audit`-targeted tracing event per authenticated request.
pub struct AuditLogListener;

impl AuthRequestListener for AuditLogListener {
    fn on_authenticated_request(&self, request: &ProxyRequest, _jwt: &str) {
        tracing::info!(
            target: "audit",
            method = %request.method(),
            path = %request.uri().path(),
            client = ?request.client_ip(),
            "authenticated request"
        );
    }
}
