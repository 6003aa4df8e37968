//! In-process implementation of the shared backend.
//!
//! Used by the test suites and as a single-replica fallback. Semantics match
//! the Redis implementation: hashes with absolute expiry, counters with a
//! window TTL, lazy expiry on access.

use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::kv::{HashScan, KvBackend, KvError};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<SystemTime>,
}

impl Entry {
    fn expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Shared backend held entirely in process memory.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
        let now = SystemTime::now();
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
        }
    }

    /// Test hook: reports whether a key currently exists (expired keys do
    /// not).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        entries.contains_key(key)
    }

    /// Test hook: returns the absolute expiry recorded for a key.
    #[must_use]
    pub fn expiry_of(&self, key: &str) -> Option<i64> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|e| e.expires_at).and_then(|at| {
            at.duration_since(UNIX_EPOCH).ok().map(|d| i64::try_from(d.as_secs()).unwrap_or(0))
        })
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn hash_put(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Hash(HashMap::new()), expires_at: None });
        match &mut entry.value {
            Value::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert((*field).to_string(), (*value).to_string());
                }
                Ok(())
            }
            Value::Counter(_) => {
                Err(KvError::Command(format!("WRONGTYPE key '{key}' holds a counter")))
            }
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        match entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(Value::Counter(_)) => {
                Err(KvError::Command(format!("WRONGTYPE key '{key}' holds a counter")))
            }
            None => Ok(None),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        match entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(Value::Counter(_)) => {
                Err(KvError::Command(format!("WRONGTYPE key '{key}' holds a counter")))
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn expire_at(&self, key: &str, unix_seconds: i64) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            let at = UNIX_EPOCH + Duration::from_secs(unix_seconds.max(0).unsigned_abs());
            entry.expires_at = Some(at);
        }
        Ok(())
    }

    async fn counter_take(
        &self,
        key: &str,
        initial: i64,
        window: Duration,
    ) -> Result<i64, KvError> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(initial),
            expires_at: Some(SystemTime::now() + window),
        });
        match &mut entry.value {
            Value::Counter(count) => {
                *count -= 1;
                Ok(*count)
            }
            Value::Hash(_) => Err(KvError::Command(format!("WRONGTYPE key '{key}' holds a hash"))),
        }
    }

    async fn scan_hashes(&self, pattern: &str) -> Result<HashScan, KvError> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let now = SystemTime::now();
        let snapshot: Vec<(String, HashMap<String, String>)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(key, entry)| key.starts_with(prefix) && !entry.expired(now))
                .filter_map(|(key, entry)| match &entry.value {
                    Value::Hash(hash) => Some((key.clone(), hash.clone())),
                    Value::Counter(_) => None,
                })
                .collect()
        };
        Ok(futures::stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }
}
