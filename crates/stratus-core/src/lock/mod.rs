//! Best-effort distributed lock over the shared cache store.
//!
//! Extends request coalescing across a fleet of proxy instances: the holder
//! of `lock:<fp>` is the only instance that should be fetching that
//! fingerprint from upstream. Built on the store's atomic set-if-absent with
//! a TTL so a crashed holder cannot deadlock the fleet.
//!
//! The lock disables itself when the store is process-local (no
//! cross-instance coordination is possible) and its failure is never fatal:
//! a caller that cannot acquire proceeds unlocked, trading a rare duplicate
//! upstream call for availability.

use crate::cache::{lock_key, CacheStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::config::ProxyConfig;

/// Backoff cap between acquisition attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(1_000);

/// Lock configuration.
#[derive(Debug, Clone)]
pub struct DistributedLockConfig {
    pub enabled: bool,
    /// Lock record TTL; auto-expiry prevents deadlock on crash.
    pub ttl: Duration,
    /// Attempts made by [`DistributedLock::acquire`].
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_delay: Duration,
}

impl Default for DistributedLockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_millis(5_000),
            retry_attempts: 10,
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl DistributedLockConfig {
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            enabled: config.distributed_lock_enabled,
            ttl: Duration::from_millis(config.lock_ttl),
            retry_attempts: config.lock_retry_attempts,
            retry_delay: Duration::from_millis(config.lock_retry_delay),
        }
    }
}

/// Serialisable snapshot for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedLockStats {
    pub enabled: bool,
    pub held: usize,
    pub acquired_total: u64,
    pub contentions_total: u64,
}

/// Cross-instance lock keyed by request fingerprint.
pub struct DistributedLock {
    store: Arc<dyn CacheStore>,
    config: DistributedLockConfig,
    process_id: String,
    /// Fingerprints this process currently holds, for crash-time cleanup.
    active: Mutex<HashSet<String>>,
    acquired_total: AtomicU64,
    contentions_total: AtomicU64,
    enabled: bool,
}

impl DistributedLock {
    /// Builds the lock over `store`, auto-disabling when the store is not
    /// shared across instances.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, config: DistributedLockConfig) -> Self {
        let enabled = config.enabled && store.is_shared();
        if config.enabled && !store.is_shared() {
            tracing::info!(
                backend = store.backend_kind(),
                "distributed lock disabled: store is process-local"
            );
        }
        Self {
            store,
            config,
            process_id: uuid::Uuid::new_v4().to_string(),
            active: Mutex::new(HashSet::new()),
            acquired_total: AtomicU64::new(0),
            contentions_total: AtomicU64::new(0),
            enabled,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Lock record value: `<processId>-<acquisitionTimestamp>`. Never
    /// rewritten once stored.
    fn lock_value(&self) -> Value {
        Value::String(format!("{}-{}", self.process_id, chrono::Utc::now().timestamp_millis()))
    }

    /// Single acquisition attempt.
    pub async fn try_acquire(&self, fingerprint: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let key = lock_key(fingerprint);
        match self.store.set_if_absent(&key, &self.lock_value(), self.config.ttl).await {
            Ok(true) => {
                self.active.lock().insert(fingerprint.to_string());
                self.acquired_total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(error = %e, fingerprint, "lock store error, treating as not acquired");
                false
            }
        }
    }

    /// Acquisition with exponential backoff: up to `retry_attempts` tries,
    /// sleeping `min(base · 2^n, 1000 ms)` between them.
    pub async fn acquire(&self, fingerprint: &str) -> bool {
        if !self.enabled {
            return false;
        }
        for attempt in 0..self.config.retry_attempts {
            if self.try_acquire(fingerprint).await {
                return true;
            }
            self.contentions_total.fetch_add(1, Ordering::Relaxed);
            let backoff =
                (self.config.retry_delay * 2_u32.saturating_pow(attempt.min(16))).min(MAX_BACKOFF);
            tokio::time::sleep(backoff).await;
        }
        tracing::warn!(
            fingerprint,
            attempts = self.config.retry_attempts,
            "lock acquisition failed, proceeding unlocked"
        );
        false
    }

    /// Releases the lock unconditionally (delete, never rewrite).
    pub async fn release(&self, fingerprint: &str) {
        if !self.enabled {
            return;
        }
        self.active.lock().remove(fingerprint);
        if let Err(e) = self.store.delete(&lock_key(fingerprint)).await {
            // TTL expiry will reclaim it.
            tracing::warn!(error = %e, fingerprint, "lock release failed");
        }
    }

    /// Best-effort batch release of every lock this process holds. Wired to
    /// the shutdown path.
    pub async fn release_all(&self) {
        let held: Vec<String> = self.active.lock().drain().collect();
        if held.is_empty() {
            return;
        }
        tracing::info!(count = held.len(), "releasing held distributed locks");
        for fingerprint in held {
            if let Err(e) = self.store.delete(&lock_key(&fingerprint)).await {
                tracing::warn!(error = %e, fingerprint = %fingerprint, "lock release failed");
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> DistributedLockStats {
        DistributedLockStats {
            enabled: self.enabled,
            held: self.active.lock().len(),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            contentions_total: self.contentions_total.load(Ordering::Relaxed),
        }
    }
}
