//! Pluggable key-value cache store.
//!
//! Two backends implement one contract: an in-process [`MemoryStore`]
//! (exact value objects, expiry timers) and a [`RedisStore`] (canonical JSON
//! text, shared across proxy instances). Backends return identical observable
//! behaviour modulo durability; callers serialise and deserialise
//! consistently because both sides of the trait speak `serde_json::Value`.
//!
//! # Failure semantics
//!
//! Store operations return `Result`; the pipeline logs failures and treats
//! them as cache-miss for reads and best-effort for writes. A broken store
//! never fails a client request.
//!
//! # Key namespaces
//!
//! - `<fp>`: positive entries
//! - `stale:<fp>`: longer-lived stale siblings
//! - `negative:<fp>`: cached upstream failures
//! - `lock:<fp>`: distributed lock records

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::config::{CacheBackendKind, ProxyConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Namespace prefix for stale sibling entries.
pub const STALE_PREFIX: &str = "stale:";
/// Namespace prefix for negative (error) entries.
pub const NEGATIVE_PREFIX: &str = "negative:";
/// Namespace prefix for distributed lock records.
pub const LOCK_PREFIX: &str = "lock:";

/// Key of the stale sibling for a fingerprint.
#[must_use]
pub fn stale_key(fingerprint: &str) -> String {
    format!("{STALE_PREFIX}{fingerprint}")
}

/// Key of the negative entry for a fingerprint.
#[must_use]
pub fn negative_key(fingerprint: &str) -> String {
    format!("{NEGATIVE_PREFIX}{fingerprint}")
}

/// Key of the lock record for a fingerprint.
#[must_use]
pub fn lock_key(fingerprint: &str) -> String {
    format!("{LOCK_PREFIX}{fingerprint}")
}

/// Errors raised by cache store backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend rejected or failed the operation.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// Could not reach the backend at startup.
    #[error("cache connection failed: {0}")]
    Connection(String),

    /// Stored text was not valid JSON.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Point-in-time backend statistics for the stats endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Number of live entries, when the backend can report it cheaply.
    pub entries: Option<usize>,
}

/// Uniform cache store contract.
///
/// `ttl = None` means the entry never expires. `set_if_absent` must be atomic
/// with respect to concurrent callers of the same backend; it is the
/// cornerstone of the distributed lock.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    /// Atomically stores `value` under `key` only if the key is absent.
    /// Returns `true` when this caller created the entry.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Deletes all keys matching `pattern` under glob semantics
    /// (`*` any run, `?` single char, `\` escape). Returns the count removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Batched get; may be implemented serially when the backend lacks
    /// native pipelining.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, CacheError>;

    /// Batched set with one TTL for all entries; serial fallback allowed.
    async fn multi_set(
        &self,
        entries: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn flush_all(&self) -> Result<(), CacheError>;

    /// Backend identifier exposed by the health endpoint.
    fn backend_kind(&self) -> &'static str;

    /// Whether the store is visible to other proxy instances. Drives
    /// distributed lock enablement.
    fn is_shared(&self) -> bool;

    async fn stats(&self) -> StoreStats;
}

/// Glob match with `*`, `?`, and `\`-escape semantics.
///
/// Classic backtracking; patterns here are operator-supplied and short
/// (typically a namespace prefix with a trailing `*`).
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some(b'?') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(b'\\') if p.len() >= 2 => {
                !t.is_empty() && t[0] == p[1] && inner(&p[2..], &t[1..])
            }
            Some(&c) => !t.is_empty() && t[0] == c && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Connects the cache backend selected by configuration.
///
/// `auto` with a configured remote URL attempts Redis and falls back to the
/// in-process store on connection failure; `redis` makes the failure fatal;
/// `memory` (or `REDIS_URL=memory`) skips the remote entirely.
///
/// Memory backends get their expiry sweeper spawned against `shutdown`.
///
/// # Errors
///
/// Returns [`CacheError::Connection`] only for `cache_type = redis`.
pub async fn connect_store(
    config: &ProxyConfig,
    shutdown: &tokio::sync::broadcast::Sender<()>,
) -> Result<Arc<dyn CacheStore>, CacheError> {
    let redis_url = config
        .redis_url
        .as_deref()
        .filter(|url| !url.is_empty() && *url != "memory");

    let memory = |reason: &str| -> Arc<dyn CacheStore> {
        tracing::info!("{reason}");
        let store = Arc::new(MemoryStore::new());
        store.spawn_expiry_sweeper(shutdown);
        store
    };

    match (config.cache_type, redis_url) {
        (CacheBackendKind::Memory, _) | (CacheBackendKind::Auto, None) => {
            Ok(memory("using in-process memory cache"))
        }
        (CacheBackendKind::Redis, None) => Err(CacheError::Connection(
            "CACHE_TYPE=redis requires REDIS_URL".to_string(),
        )),
        (CacheBackendKind::Redis, Some(url)) => {
            let store = RedisStore::connect(url).await?;
            tracing::info!("connected to redis cache");
            Ok(Arc::new(store))
        }
        (CacheBackendKind::Auto, Some(url)) => match RedisStore::connect(url).await {
            Ok(store) => {
                tracing::info!("connected to redis cache");
                Ok(Arc::new(store))
            }
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, falling back to memory cache");
                Ok(memory("using in-process memory cache"))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces() {
        assert_eq!(stale_key("eth_blockNumber:[]"), "stale:eth_blockNumber:[]");
        assert_eq!(negative_key("fp"), "negative:fp");
        assert_eq!(lock_key("fp"), "lock:fp");
    }

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("abc", "abc"));
        assert!(!glob_match("abc", "abd"));
        assert!(!glob_match("abc", "abcd"));
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("stale:*", "stale:eth_blockNumber:[]"));
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abbbc"));
        assert!(!glob_match("stale:*", "negative:fp"));
    }

    #[test]
    fn test_glob_question() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("a?c", "abbc"));
    }

    #[test]
    fn test_glob_escape() {
        assert!(glob_match(r"a\*c", "a*c"));
        assert!(!glob_match(r"a\*c", "abc"));
        assert!(glob_match(r"a\?", "a?"));
    }

    fn shutdown_channel() -> tokio::sync::broadcast::Sender<()> {
        tokio::sync::broadcast::channel(1).0
    }

    #[tokio::test]
    async fn test_connect_store_memory() {
        let config = ProxyConfig {
            cache_type: CacheBackendKind::Memory,
            ..ProxyConfig::default()
        };
        let store = connect_store(&config, &shutdown_channel()).await.unwrap();
        assert_eq!(store.backend_kind(), "memory");
        assert!(!store.is_shared());
    }

    #[tokio::test]
    async fn test_connect_store_auto_without_url() {
        let config = ProxyConfig::default();
        let store = connect_store(&config, &shutdown_channel()).await.unwrap();
        assert_eq!(store.backend_kind(), "memory");
    }

    #[tokio::test]
    async fn test_connect_store_redis_url_memory_sentinel() {
        let config = ProxyConfig {
            redis_url: Some("memory".to_string()),
            ..ProxyConfig::default()
        };
        let store = connect_store(&config, &shutdown_channel()).await.unwrap();
        assert_eq!(store.backend_kind(), "memory");
    }

    #[tokio::test]
    async fn test_connect_store_redis_requires_url() {
        let config = ProxyConfig {
            cache_type: CacheBackendKind::Redis,
            ..ProxyConfig::default()
        };
        assert!(connect_store(&config, &shutdown_channel()).await.is_err());
    }
}
