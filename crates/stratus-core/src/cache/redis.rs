//! Redis cache backend.
//!
//! Values are stored as compact JSON text; the multiplexed connection is
//! cheaply cloneable per operation. `SET NX PX` provides the atomic
//! set-if-absent the distributed lock is built on, and pattern deletion runs
//! `SCAN MATCH` + `DEL` so it never blocks the server the way `KEYS` would.

use super::{CacheError, CacheStore, StoreStats};
use crate::utils::sanitize_url;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use serde_json::Value;
use std::time::Duration;

/// Redis-backed [`CacheStore`].
pub struct RedisStore {
    conn: MultiplexedConnection,
    display_url: String,
}

impl RedisStore {
    /// Connects to the Redis instance at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if the client cannot be built or
    /// the connection handshake fails.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Connection(format!("redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Connection(format!("redis connect: {e}")))?;

        Ok(Self { conn, display_url: sanitize_url(url) })
    }

    /// Sanitised connection URL for logs and the health endpoint.
    #[must_use]
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    fn backend_err(e: redis::RedisError) -> CacheError {
        CacheError::Backend(e.to_string())
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.conn.clone();
        let text: Option<String> = conn.get(key).await.map_err(Self::backend_err)?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let text = serde_json::to_string(value)?;
        match ttl {
            // Round sub-second TTLs up so a positive TTL never becomes 0
            // (Redis rejects SETEX 0).
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                let _: () = conn.set_ex(key, text, secs).await.map_err(Self::backend_err)?;
            }
            None => {
                let _: () = conn.set(key, text).await.map_err(Self::backend_err)?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let text = serde_json::to_string(value)?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(text)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::backend_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(Self::backend_err)?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let keys: Vec<String> = {
            let mut scan_conn = self.conn.clone();
            let mut iter = scan_conn
                .scan_match::<&str, String>(pattern)
                .await
                .map_err(Self::backend_err)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let deleted: u64 = conn.del(keys).await.map_err(Self::backend_err)?;
        Ok(deleted)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let texts: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(Self::backend_err)?;

        texts
            .into_iter()
            .map(|text| match text {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            })
            .collect()
    }

    async fn multi_set(
        &self,
        entries: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        // Serial on purpose: MSET has no per-key TTL form.
        for (key, value) in entries {
            self.set(key, value, ttl).await?;
        }
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(Self::backend_err)?;
        Ok(())
    }

    fn backend_kind(&self) -> &'static str {
        "redis"
    }

    fn is_shared(&self) -> bool {
        true
    }

    async fn stats(&self) -> StoreStats {
        let mut conn = self.conn.clone();
        let size: Option<usize> =
            redis::cmd("DBSIZE").query_async(&mut conn).await.ok();
        StoreStats { entries: size }
    }
}
