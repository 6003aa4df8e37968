//! Authentication: JWT verification, the opaque-token store, credential
//! extraction and injection, and the per-route auth pipeline.
//!
//! Clients never see JWTs. They hold short opaque tokens which the gateway
//! maps to stored JWTs ([`token_store`]); the JWT is verified
//! ([`verifier`]), checked against the application whitelist, and installed
//! on the upstream request ([`writer`]). Responses from the provider
//! application may carry fresh JWTs, which are reminted into opaque tokens
//! before they leave the gateway ([`pipeline`]).

pub mod handler;
pub mod pipeline;
pub mod reader;
pub mod token_store;
pub mod verifier;
pub mod writer;

pub use handler::AuthenticationHandler;
pub use pipeline::AuthPipeline;
pub use reader::BearerTokenReader;
pub use token_store::{CachedTokenStore, KvTokenStore, MappedToken, TokenStore, TokenStoreError};
pub use verifier::{JwtVerifier, VerifiedToken, VerifyError};
pub use writer::TokenWriter;

use serde_json::Value;
use thiserror::Error;

use crate::types::ProxyRequest;

/// A stored JWT together with the applications it is restricted to.
/// An empty whitelist means any application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JwtResponse {
    pub jwt: String,
    pub allowed_applications: Vec<String>,
}

impl JwtResponse {
    #[must_use]
    pub fn new(jwt: impl Into<String>) -> Self {
        Self { jwt: jwt.into(), allowed_applications: Vec::new() }
    }
}

/// Observer notified for every authenticated request passing the pipeline.
///
/// Listeners are called synchronously with the verified JWT; anything
/// long-running belongs in a task the listener spawns itself.
pub trait AuthRequestListener: Send + Sync {
    fn on_authenticated_request(&self, request: &ProxyRequest, jwt: &str);
}

/// Failures inside the authentication pipeline and endpoint.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials given")]
    InvalidCredentials,

    /// The provider answered 202: authentication needs another step. The
    /// map is relayed to the client as the 202 response body.
    #[error("authentication incomplete")]
    Incomplete(serde_json::Map<String, Value>),

    #[error("token store failure: {0}")]
    Store(#[from] TokenStoreError),

    #[error("verification key retrieval failed: {0}")]
    KeyFetch(String),

    #[error("authentication provider failure: {0}")]
    Provider(String),

    #[error("pre-authentication hook failure: {0}")]
    Hook(String),
}
