//! Proxy configuration loaded from the environment.
//!
//! # Configuration Hierarchy
//!
//! 1. **Compiled defaults**: hardcoded via `set_default` / `Default`.
//! 2. **Environment variables**: flat, unprefixed names (`PORT`,
//!    `UPSTREAM_RPC_URL`, `CACHE_TYPE`, ...). The names are part of the
//!    operational contract and map 1:1 onto the lower-cased field names of
//!    [`ProxyConfig`].
//!
//! # Validation
//!
//! Configuration is validated at load time. Invalid configurations (no
//! upstream URL, error percentage out of range) return errors rather than
//! failing at the first request.

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Try Redis when a URL is configured, fall back to memory.
    Auto,
    /// Require Redis; startup fails if unreachable.
    Redis,
    /// In-process memory store only.
    Memory,
}

impl std::fmt::Display for CacheBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBackendKind::Auto => write!(f, "auto"),
            CacheBackendKind::Redis => write!(f, "redis"),
            CacheBackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// Root proxy configuration.
///
/// Field names deliberately mirror the environment variable contract: the
/// `config` crate's [`Environment`] source maps `PERMANENT_CACHE_HEIGHT` onto
/// `permanent_cache_height` and so on. Millisecond-valued fields keep the
/// `_ttl`/`_timeout`/`_delay` names from the contract; accessors below return
/// typed [`Duration`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// HTTP bind port.
    pub port: u16,
    /// HTTP bind address.
    pub host: String,

    /// Single upstream URL or comma-separated list, in failover order.
    pub upstream_rpc_url: String,
    /// When `false`, only the first upstream URL is used.
    pub rpc_fallback_enabled: bool,
    /// Per-URL retry budget for transient network errors.
    pub rpc_max_retries_per_url: u32,

    /// Redis connection URL, the literal string `memory`, or unset.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Backend selection: `auto` / `redis` / `memory`.
    pub cache_type: CacheBackendKind,

    /// Block height at or below which chain data is treated as immutable.
    pub permanent_cache_height: u64,
    /// TTL in seconds for `latest`-tagged data.
    pub latest_block_ttl: u64,
    /// TTL in seconds for post-merge but not-yet-permanent block data.
    pub recent_block_ttl: u64,
    /// TTL in seconds for `eth_call` against `latest`.
    pub eth_call_ttl: u64,

    /// Enables the in-process request coalescer.
    pub coalescing_enabled: bool,
    /// Watchdog timeout for a coalesced in-flight fetch, in milliseconds.
    pub coalescing_timeout: u64,

    /// Enables the cross-instance distributed lock (requires a shared store).
    pub distributed_lock_enabled: bool,
    /// Lock TTL in milliseconds.
    pub lock_ttl: u64,
    /// Lock acquisition attempts before degrading to unlocked execution.
    pub lock_retry_attempts: u32,
    /// Base backoff delay between lock attempts, in milliseconds.
    pub lock_retry_delay: u64,

    /// Enables the circuit breaker around upstream calls.
    pub circuit_breaker_enabled: bool,
    /// Consecutive failures tripping the breaker.
    pub circuit_failure_threshold: u32,
    /// Consecutive half-open successes required to close the breaker.
    pub circuit_success_threshold: u32,
    /// Per-call timeout in milliseconds; a timeout counts as a failure.
    pub circuit_timeout: u64,
    /// Milliseconds an open breaker waits before admitting a probe.
    pub circuit_reset_timeout: u64,
    /// Minimum rolling-window sample count before percentage tripping.
    pub circuit_volume_threshold: u32,
    /// Failure percentage (0-100) tripping the breaker within the window.
    pub circuit_error_percentage: u32,

    /// Serve recently-expired entries while refreshing in the background.
    pub stale_while_revalidate: bool,
    /// TTL in seconds for the stale sibling entry.
    pub stale_ttl: u64,
    /// Cache upstream failures to suppress retry storms.
    pub negative_caching: bool,
    /// TTL in seconds for negative entries.
    pub negative_ttl: u64,

    /// Log output format: `pretty` or `json`.
    pub log_format: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            upstream_rpc_url: String::new(),
            rpc_fallback_enabled: true,
            rpc_max_retries_per_url: 2,
            redis_url: None,
            cache_type: CacheBackendKind::Auto,
            permanent_cache_height: 15_537_393,
            latest_block_ttl: 2,
            recent_block_ttl: 60,
            eth_call_ttl: 300,
            coalescing_enabled: true,
            coalescing_timeout: 30_000,
            distributed_lock_enabled: true,
            lock_ttl: 5_000,
            lock_retry_attempts: 10,
            lock_retry_delay: 50,
            circuit_breaker_enabled: true,
            circuit_failure_threshold: 5,
            circuit_success_threshold: 2,
            circuit_timeout: 10_000,
            circuit_reset_timeout: 60_000,
            circuit_volume_threshold: 10,
            circuit_error_percentage: 50,
            stale_while_revalidate: false,
            stale_ttl: 300,
            negative_caching: false,
            negative_ttl: 60,
            log_format: "pretty".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from the process environment over compiled
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an environment value fails to parse into
    /// the target field type.
    pub fn from_env() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("port", 3000_i64)?
            .set_default("host", "0.0.0.0")?
            .set_default("upstream_rpc_url", "")?
            .set_default("rpc_fallback_enabled", true)?
            .set_default("rpc_max_retries_per_url", 2_i64)?
            .set_default("cache_type", "auto")?
            .set_default("permanent_cache_height", 15_537_393_i64)?
            .set_default("latest_block_ttl", 2_i64)?
            .set_default("recent_block_ttl", 60_i64)?
            .set_default("eth_call_ttl", 300_i64)?
            .set_default("coalescing_enabled", true)?
            .set_default("coalescing_timeout", 30_000_i64)?
            .set_default("distributed_lock_enabled", true)?
            .set_default("lock_ttl", 5_000_i64)?
            .set_default("lock_retry_attempts", 10_i64)?
            .set_default("lock_retry_delay", 50_i64)?
            .set_default("circuit_breaker_enabled", true)?
            .set_default("circuit_failure_threshold", 5_i64)?
            .set_default("circuit_success_threshold", 2_i64)?
            .set_default("circuit_timeout", 10_000_i64)?
            .set_default("circuit_reset_timeout", 60_000_i64)?
            .set_default("circuit_volume_threshold", 10_i64)?
            .set_default("circuit_error_percentage", 50_i64)?
            .set_default("stale_while_revalidate", false)?
            .set_default("stale_ttl", 300_i64)?
            .set_default("negative_caching", false)?
            .set_default("negative_ttl", 60_i64)?
            .set_default("log_format", "pretty")?
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        builder.try_deserialize()
    }

    /// Upstream URLs in configured failover order.
    ///
    /// Honors `rpc_fallback_enabled`: when disabled only the first URL is
    /// returned.
    #[must_use]
    pub fn upstream_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .upstream_rpc_url
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if !self.rpc_fallback_enabled {
            urls.truncate(1);
        }
        urls
    }

    /// Parsed socket address for the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error string if host and port do not combine into a valid
    /// socket address.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| format!("invalid socket address: {}:{}", self.host, self.port))
    }

    /// Coalescer watchdog timeout.
    #[must_use]
    pub fn coalescing_timeout(&self) -> Duration {
        Duration::from_millis(self.coalescing_timeout)
    }

    /// Per-call upstream timeout enforced by the breaker.
    #[must_use]
    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_timeout)
    }

    /// Delay before an open breaker admits a probe request.
    #[must_use]
    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_timeout)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        let urls = self.upstream_urls();
        if urls.is_empty() {
            return Err("UPSTREAM_RPC_URL must be set to at least one URL".to_string());
        }
        for url in &urls {
            if !url.starts_with("http") {
                return Err(format!("invalid upstream URL: {url}"));
            }
        }

        if self.circuit_error_percentage > 100 {
            return Err("CIRCUIT_ERROR_PERCENTAGE must be within 0-100".to_string());
        }
        if self.circuit_failure_threshold == 0 {
            return Err("CIRCUIT_FAILURE_THRESHOLD must be greater than 0".to_string());
        }
        if self.circuit_success_threshold == 0 {
            return Err("CIRCUIT_SUCCESS_THRESHOLD must be greater than 0".to_string());
        }
        if self.coalescing_timeout == 0 {
            return Err("COALESCING_TIMEOUT must be greater than 0".to_string());
        }
        if self.lock_ttl == 0 {
            return Err("LOCK_TTL must be greater than 0".to_string());
        }
        if self.port == 0 {
            return Err("PORT must be greater than 0".to_string());
        }
        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return Err("LOG_FORMAT must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
