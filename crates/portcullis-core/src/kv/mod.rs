//! Shared key-value backend abstraction.
//!
//! The token store and the rate limiter keep all of their durable state in a
//! shared backend so that gateway replicas observe the same tokens and
//! counters. [`KvBackend`] is the seam: production uses [`RedisKv`], tests
//! use [`MemoryKv`].

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

/// Errors from the shared backend.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("backend command failed: {0}")]
    Command(String),
}

/// A stream of `(key, hash)` pairs produced by a key scan.
///
/// The producer holds one dedicated backend connection for the scan's
/// duration; dropping the stream releases it.
pub type HashScan = BoxStream<'static, Result<(String, HashMap<String, String>), KvError>>;

/// Operations the gateway needs from the shared backend.
///
/// The surface is deliberately narrow: hashes with absolute expiry for token
/// records, an atomic create-and-decrement for rate buckets, and a key scan
/// for the admin token listing.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Writes fields into the hash stored at `key`, creating it if absent.
    async fn hash_put(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), KvError>;

    /// Reads a single field of the hash at `key`.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    /// Reads the whole hash at `key`. Absent keys yield an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    /// Schedules `key` for deletion at an absolute unix timestamp.
    async fn expire_at(&self, key: &str, unix_seconds: i64) -> Result<(), KvError>;

    /// Atomically ensures the counter at `key` exists (created at `initial`
    /// with a `window` TTL) and decrements it, returning the decremented
    /// value. The create and the decrement execute as one transactional
    /// batch, so the first decrement after a window boundary observes a
    /// fresh `initial - 1`.
    async fn counter_take(
        &self,
        key: &str,
        initial: i64,
        window: Duration,
    ) -> Result<i64, KvError>;

    /// Scans keys matching `pattern` (glob syntax) and yields each key with
    /// its hash contents. The scan is lazy and non-restartable.
    async fn scan_hashes(&self, pattern: &str) -> Result<HashScan, KvError>;
}
