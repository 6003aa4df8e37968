//! Redis implementation of the shared backend.

use std::{collections::HashMap, collections::VecDeque, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;

use crate::{
    config::RedisConfig,
    kv::{HashScan, KvBackend, KvError},
};

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            KvError::Connection(err.to_string())
        } else {
            KvError::Command(err.to_string())
        }
    }
}

/// Shared backend on top of a Redis server.
///
/// Regular commands go through a multiplexed [`ConnectionManager`]; key scans
/// open a dedicated connection that lives as long as the returned stream.
pub struct RedisKv {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisKv {
    /// Connects to the configured Redis server and verifies it responds.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the server is
    /// unreachable.
    pub async fn connect(config: &RedisConfig) -> Result<Self, KvError> {
        let (host, port) = config
            .address
            .rsplit_once(':')
            .ok_or_else(|| KvError::Connection(format!("invalid address '{}'", config.address)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| KvError::Connection(format!("invalid port in '{}'", config.address)))?;

        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db: config.database,
                username: None,
                password: config.password.clone(),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info)?;
        let mut manager = ConnectionManager::new(client.clone()).await?;

        let _: String = redis::cmd("PING").query_async(&mut manager).await?;
        tracing::debug!(address = %config.address, database = config.database, "redis backend connected");

        Ok(Self { client, manager })
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn hash_put(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        let value: Option<String> =
            redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.manager.clone();
        let value: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn expire_at(&self, key: &str, unix_seconds: i64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("EXPIREAT").arg(key).arg(unix_seconds).query_async(&mut conn).await?;
        Ok(())
    }

    async fn counter_take(
        &self,
        key: &str,
        initial: i64,
        window: Duration,
    ) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(key)
            .arg(initial)
            .arg("EX")
            .arg(window.as_secs())
            .arg("NX")
            .ignore()
            .cmd("DECR")
            .arg(key);
        let (remaining,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(remaining)
    }

    async fn scan_hashes(&self, pattern: &str) -> Result<HashScan, KvError> {
        // Dedicated connection: the SCAN cursor is connection-local, and the
        // stream may outlive any single manager round-trip.
        let conn = self.client.get_multiplexed_async_connection().await?;

        struct ScanState {
            conn: redis::aio::MultiplexedConnection,
            cursor: u64,
            pending: VecDeque<String>,
            pattern: String,
            done: bool,
        }

        let state = ScanState {
            conn,
            cursor: 0,
            pending: VecDeque::new(),
            pattern: pattern.to_string(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(key) = st.pending.pop_front() {
                    let hash: Result<HashMap<String, String>, redis::RedisError> =
                        redis::cmd("HGETALL").arg(&key).query_async(&mut st.conn).await;
                    return match hash {
                        Ok(h) => Some((Ok((key, h)), st)),
                        Err(e) => {
                            st.done = true;
                            st.pending.clear();
                            Some((Err(e.into()), st))
                        }
                    };
                }
                if st.done {
                    return None;
                }
                let batch: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                    .arg(st.cursor)
                    .arg("MATCH")
                    .arg(&st.pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut st.conn)
                    .await;
                match batch {
                    Ok((cursor, keys)) => {
                        st.cursor = cursor;
                        st.done = cursor == 0;
                        st.pending.extend(keys);
                    }
                    Err(e) => {
                        st.done = true;
                        st.pending.clear();
                        return Some((Err(e.into()), st));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
