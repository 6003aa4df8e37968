//! Credential extraction from incoming requests.

use std::sync::Arc;

use crate::{
    auth::{JwtResponse, TokenStore, TokenStoreError},
    types::ProxyRequest,
};

/// Where the opaque token was NOT found: either there was nothing, or the
/// client used an Authorization scheme the gateway does not speak.
#[derive(Debug, PartialEq, Eq)]
pub enum MissingCredential {
    NoToken,
    UnsupportedScheme(String),
}

/// Pulls the opaque token string out of a request. First hit wins:
///
/// 1. `Authorization: Bearer <token>`
/// 2. cookie `ACCESSTOKEN`, else cookie `access_token`
/// 3. header `X-JWT`, else `x-access-token`
/// 4. query parameter `access_token`
pub fn token_string_from_request(
    request: &ProxyRequest,
) -> Result<String, MissingCredential> {
    if let Some(authorization) = request.header("Authorization") {
        let mut parts = authorization.splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        if scheme != "Bearer" {
            return Err(MissingCredential::UnsupportedScheme(scheme.to_string()));
        }
        return parts
            .next()
            .map(str::to_string)
            .ok_or(MissingCredential::NoToken);
    }

    if let Some(token) = request.cookie("ACCESSTOKEN").or_else(|| request.cookie("access_token")) {
        return Ok(token);
    }

    if let Some(token) = request.header("X-JWT").or_else(|| request.header("x-access-token")) {
        return Ok(token.to_string());
    }

    request
        .query_param("access_token")
        .ok_or(MissingCredential::NoToken)
}

/// Resolves extracted opaque tokens through the token store.
pub struct BearerTokenReader {
    store: Arc<dyn TokenStore>,
}

impl BearerTokenReader {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Extracts and resolves the request's credential.
    ///
    /// `None` means the request carries no usable credential (nothing
    /// present, unsupported scheme, or an unknown token) and is simply
    /// unauthenticated.
    ///
    /// # Errors
    ///
    /// Backend failures while resolving the token propagate; the caller
    /// turns them into 503.
    pub async fn token_from_request(
        &self,
        request: &ProxyRequest,
    ) -> Result<Option<JwtResponse>, TokenStoreError> {
        let token = match token_string_from_request(request) {
            Ok(token) => token,
            Err(MissingCredential::NoToken) => return Ok(None),
            Err(MissingCredential::UnsupportedScheme(scheme)) => {
                tracing::debug!(scheme = %scheme, "unsupported authorization scheme");
                return Ok(None);
            }
        };
        self.resolve_token(&token).await
    }

    /// Resolves an already-extracted opaque token through the token store.
    ///
    /// Split out from [`Self::token_from_request`] so callers that must hold
    /// an async result across a `.await` without retaining a borrow of the
    /// (non-`Sync`) [`ProxyRequest`] can extract the token string first.
    pub async fn resolve_token(
        &self,
        token: &str,
    ) -> Result<Option<JwtResponse>, TokenStoreError> {
        match self.store.get_token(token).await {
            Ok(response) => Ok(Some(response)),
            Err(TokenStoreError::NoSuchToken) => Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "error while loading JWT for token");
                Err(e)
            }
        }
    }
}
