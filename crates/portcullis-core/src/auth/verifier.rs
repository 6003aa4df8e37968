//! RSA JWT verification with a TTL-cached verification key.
//!
//! The key comes from static configuration or is fetched from a URL and
//! cached until `keyCacheTtl` elapses. Refreshes are single-flight: a
//! double-checked read escapes the lock when the key is fresh, and a mutex
//! serializes the slow path so concurrent expiries trigger one fetch.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::config::AuthenticationConfig;

/// Verification failures, partitioned by what the caller may do about them.
///
/// [`is_unauthenticated`](VerifyError::is_unauthenticated) variants describe
/// invalid-but-well-formed credentials: the request is simply not
/// authenticated. Everything else is a fault of the gateway's own
/// dependencies and surfaces as 503.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token has expired")]
    Expired,

    #[error("token signature is invalid")]
    SignatureInvalid,

    #[error("unexpected signing method: {0}")]
    BadAlgorithm(String),

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("could not retrieve key from '{0}': {1}")]
    KeyFetch(String, String),

    #[error("no verification key configured")]
    NoKey,
}

impl VerifyError {
    /// Whether the error means "this credential is invalid" rather than
    /// "verification itself failed".
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::Expired | Self::SignatureInvalid | Self::BadAlgorithm(_) | Self::Malformed(_)
        )
    }
}

/// The registered claims the gateway cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StandardClaims {
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub nbf: Option<i64>,
    pub sub: Option<String>,
    pub iss: Option<String>,
}

/// A successfully verified token: the standard claims plus the free-form
/// claim map.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub claims: StandardClaims,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl VerifiedToken {
    /// The token's expiry as seconds since epoch, `0` when it has none.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.claims.exp.unwrap_or(0)
    }
}

struct CachedKey {
    key: Arc<DecodingKey>,
    expires_at: Instant,
}

/// Verifies RSA-signed compact JWTs.
pub struct JwtVerifier {
    static_key: Option<Arc<DecodingKey>>,
    key_url: Option<String>,
    cache_ttl: Duration,
    http: reqwest::Client,
    cached: RwLock<Option<CachedKey>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl JwtVerifier {
    /// Builds a verifier from the authentication configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Malformed`] if the static key is not valid
    /// RSA PEM, or [`VerifyError::NoKey`] if neither a key nor a key URL is
    /// configured.
    pub fn new(config: &AuthenticationConfig) -> Result<Self, VerifyError> {
        let static_key = config
            .verification_key
            .as_deref()
            .map(|pem| {
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map(Arc::new)
                    .map_err(|e| VerifyError::Malformed(format!("verification key: {e}")))
            })
            .transpose()?;

        if static_key.is_none() && config.verification_key_url.is_none() {
            return Err(VerifyError::NoKey);
        }

        Ok(Self {
            static_key,
            key_url: config.verification_key_url.clone(),
            cache_ttl: config.key_cache_ttl_duration(),
            http: reqwest::Client::new(),
            cached: RwLock::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn fresh_cached_key(&self) -> Option<Arc<DecodingKey>> {
        let cached = self.cached.read();
        cached
            .as_ref()
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.key.clone())
    }

    /// Returns the verification key, fetching and caching it if needed.
    async fn verification_key(&self) -> Result<Arc<DecodingKey>, VerifyError> {
        if let Some(key) = &self.static_key {
            return Ok(key.clone());
        }
        if let Some(key) = self.fresh_cached_key() {
            return Ok(key);
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(key) = self.fresh_cached_key() {
            return Ok(key);
        }

        let url = self.key_url.as_deref().ok_or(VerifyError::NoKey)?;
        match self.fetch_key(url).await {
            Ok(key) => {
                let key = Arc::new(key);
                *self.cached.write() = Some(CachedKey {
                    key: key.clone(),
                    expires_at: Instant::now() + self.cache_ttl,
                });
                Ok(key)
            }
            Err(e) => {
                *self.cached.write() = None;
                Err(e)
            }
        }
    }

    async fn fetch_key(&self, url: &str) -> Result<DecodingKey, VerifyError> {
        let fetch_err = |e: String| VerifyError::KeyFetch(url.to_string(), e);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| fetch_err(e.to_string()))?;
        let pem = response.bytes().await.map_err(|e| fetch_err(e.to_string()))?;

        DecodingKey::from_rsa_pem(&pem).map_err(|e| fetch_err(format!("invalid key data: {e}")))
    }

    /// Verifies a compact JWT.
    ///
    /// The token's signing method must be in the RSA family. The token is
    /// parsed twice, once into the standard-claims shape and once into the
    /// free-form map, and both land in the returned [`VerifiedToken`].
    ///
    /// # Errors
    ///
    /// See [`VerifyError`] for the partition between invalid credentials
    /// and verification faults.
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken, VerifyError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(VerifyError::BadAlgorithm(format!("{:?}", header.alg)));
        }

        let key = self.verification_key().await?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        // `exp` is optional here: tokens without one never expire.
        validation.required_spec_claims.clear();

        let standard = jsonwebtoken::decode::<StandardClaims>(token, &key, &validation)
            .map_err(map_jwt_error)?;
        let map = jsonwebtoken::decode::<serde_json::Map<String, serde_json::Value>>(
            token,
            &key,
            &validation,
        )
        .map_err(map_jwt_error)?;

        Ok(VerifiedToken { claims: standard.claims, extra: map.claims })
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> VerifyError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => VerifyError::Expired,
        ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            VerifyError::BadAlgorithm(err.to_string())
        }
        _ => VerifyError::Malformed(err.to_string()),
    }
}
