//! Opaque-token ↔ JWT mapping.
//!
//! Records live in the shared backend as hashes under `token_<opaque>` with
//! fields `jwt`, `token` and `applications` (semicolon-joined), scheduled
//! for deletion at the JWT's `exp`. [`CachedTokenStore`] puts a small LRU in
//! front; the LRU hides backend lookups, never backend errors, and refuses
//! entries whose expiry has passed.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;

use crate::{
    auth::{JwtResponse, JwtVerifier, VerifyError},
    kv::{KvBackend, KvError},
};

/// Backend key prefix for token records.
pub const TOKEN_KEY_PREFIX: &str = "token_";

const FIELD_JWT: &str = "jwt";
const FIELD_TOKEN: &str = "token";
const FIELD_APPLICATIONS: &str = "applications";

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("no such token")]
    NoSuchToken,

    #[error("JWT is invalid: {0}")]
    InvalidJwt(#[source] VerifyError),

    #[error(transparent)]
    Backend(#[from] KvError),
}

/// One entry of the token listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedToken {
    pub token: String,
    pub jwt: String,
}

/// Stream of stored tokens. Lazy and non-restartable; the producer holds one
/// backend connection until the stream ends or is dropped. Entries the
/// backend has not swept yet may still appear.
pub type TokenScan = BoxStream<'static, Result<MappedToken, TokenStoreError>>;

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Verifies the JWT, mints a fresh opaque token, and stores the record.
    /// Returns the token and the record's expiry (`0` for none). Nothing is
    /// written when verification fails.
    async fn add_token(&self, response: &JwtResponse) -> Result<(String, i64), TokenStoreError>;

    /// Like [`add_token`](Self::add_token), but with a caller-chosen opaque
    /// token. Overwrites an existing record for that token.
    async fn set_token(&self, token: &str, response: &JwtResponse)
        -> Result<i64, TokenStoreError>;

    /// Resolves an opaque token to its stored JWT.
    async fn get_token(&self, token: &str) -> Result<JwtResponse, TokenStoreError>;

    /// Streams all stored tokens. Not for the proxy request path.
    async fn list_tokens(&self) -> Result<TokenScan, TokenStoreError>;
}

/// Token store writing directly to the shared backend.
pub struct KvTokenStore {
    kv: Arc<dyn KvBackend>,
    verifier: Arc<JwtVerifier>,
}

impl KvTokenStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvBackend>, verifier: Arc<JwtVerifier>) -> Self {
        Self { kv, verifier }
    }

    /// Verifies the JWT and returns its absolute expiry (`0` for none).
    async fn verify_expiry(&self, jwt: &str) -> Result<i64, TokenStoreError> {
        let verified = self.verifier.verify(jwt).await.map_err(TokenStoreError::InvalidJwt)?;
        Ok(verified.expires_at())
    }

    async fn store_record(
        &self,
        token: &str,
        response: &JwtResponse,
        expires_at: i64,
    ) -> Result<(), TokenStoreError> {
        let key = format!("{TOKEN_KEY_PREFIX}{token}");
        let applications = response.allowed_applications.join(";");
        self.kv
            .hash_put(
                &key,
                &[
                    (FIELD_JWT, response.jwt.as_str()),
                    (FIELD_TOKEN, token),
                    (FIELD_APPLICATIONS, applications.as_str()),
                ],
            )
            .await?;
        if expires_at > 0 {
            self.kv.expire_at(&key, expires_at).await?;
        }
        Ok(())
    }
}

/// Mints an opaque token: 32 random bytes, base32 without padding.
fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl TokenStore for KvTokenStore {
    async fn add_token(&self, response: &JwtResponse) -> Result<(String, i64), TokenStoreError> {
        let expires_at = self.verify_expiry(&response.jwt).await?;
        let token = mint_token();
        self.store_record(&token, response, expires_at).await?;
        Ok((token, expires_at))
    }

    async fn set_token(
        &self,
        token: &str,
        response: &JwtResponse,
    ) -> Result<i64, TokenStoreError> {
        let expires_at = self.verify_expiry(&response.jwt).await?;
        self.store_record(token, response, expires_at).await?;
        Ok(expires_at)
    }

    async fn get_token(&self, token: &str) -> Result<JwtResponse, TokenStoreError> {
        let key = format!("{TOKEN_KEY_PREFIX}{token}");
        let record = self.kv.hash_get_all(&key).await?;
        let jwt = record.get(FIELD_JWT).ok_or(TokenStoreError::NoSuchToken)?;
        let allowed_applications = record
            .get(FIELD_APPLICATIONS)
            .map(|joined| {
                joined.split(';').filter(|s| !s.is_empty()).map(str::to_string).collect()
            })
            .unwrap_or_default();
        Ok(JwtResponse { jwt: jwt.clone(), allowed_applications })
    }

    async fn list_tokens(&self) -> Result<TokenScan, TokenStoreError> {
        let scan = self.kv.scan_hashes(&format!("{TOKEN_KEY_PREFIX}*")).await?;
        let tokens = scan.map(|item| {
            let (key, hash) = item?;
            let token = hash
                .get(FIELD_TOKEN)
                .cloned()
                .unwrap_or_else(|| key.trim_start_matches(TOKEN_KEY_PREFIX).to_string());
            let jwt = hash.get(FIELD_JWT).cloned().unwrap_or_default();
            Ok(MappedToken { token, jwt })
        });
        Ok(tokens.boxed())
    }
}

struct CachedToken {
    response: JwtResponse,
    expires_at: i64,
}

impl CachedToken {
    fn live(&self) -> bool {
        self.expires_at == 0 || self.expires_at > unix_now()
    }
}

/// LRU decorator in front of another token store.
pub struct CachedTokenStore {
    wrapped: Arc<dyn TokenStore>,
    cache: Arc<Mutex<LruCache<String, CachedToken>>>,
}

impl CachedTokenStore {
    pub const DEFAULT_CAPACITY: usize = 128;

    #[must_use]
    pub fn new(wrapped: Arc<dyn TokenStore>) -> Self {
        Self::with_capacity(wrapped, Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(wrapped: Arc<dyn TokenStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { wrapped, cache: Arc::new(Mutex::new(LruCache::new(capacity))) }
    }

    fn remember(&self, token: String, response: JwtResponse, expires_at: i64) {
        self.cache.lock().put(token.clone(), CachedToken { response, expires_at });

        // Backend expiry removes the record; this removes the local copy.
        // An entry overwritten in the meantime makes the delete a no-op for
        // the newer record only if the expiry moved, so re-check liveness.
        if expires_at > 0 {
            let cache = self.cache.clone();
            let delay = u64::try_from(expires_at - unix_now()).unwrap_or(0);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                let mut cache = cache.lock();
                if cache.peek(&token).is_some_and(|c| !c.live()) {
                    cache.pop(&token);
                }
            });
        }
    }
}

#[async_trait]
impl TokenStore for CachedTokenStore {
    async fn add_token(&self, response: &JwtResponse) -> Result<(String, i64), TokenStoreError> {
        let (token, expires_at) = self.wrapped.add_token(response).await?;
        self.remember(token.clone(), response.clone(), expires_at);
        Ok((token, expires_at))
    }

    async fn set_token(
        &self,
        token: &str,
        response: &JwtResponse,
    ) -> Result<i64, TokenStoreError> {
        let expires_at = self.wrapped.set_token(token, response).await?;
        self.remember(token.to_string(), response.clone(), expires_at);
        Ok(expires_at)
    }

    async fn get_token(&self, token: &str) -> Result<JwtResponse, TokenStoreError> {
        {
            let mut cache = self.cache.lock();
            match cache.get(token) {
                Some(cached) if cached.live() => return Ok(cached.response.clone()),
                Some(_) => {
                    // Stale entries are refused, not served.
                    cache.pop(token);
                }
                None => {}
            }
        }
        self.wrapped.get_token(token).await
    }

    async fn list_tokens(&self) -> Result<TokenScan, TokenStoreError> {
        self.wrapped.list_tokens().await
    }
}
