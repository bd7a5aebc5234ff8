//! Request metrics.
//!
//! Lock-free atomic counters recorded on the hot path and exported as a
//! camelCase JSON snapshot by the health and stats endpoints. `flush`
//! resets everything alongside the caches so a flushed proxy reports like a
//! cold start.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Hits over hits + misses; `0.0` before any cacheable traffic.
    pub cache_hit_rate: f64,
    pub coalesced_requests: u64,
    pub stale_served: u64,
    pub negative_cache_hits: u64,
    pub lock_contentions: u64,
    pub upstream_errors: u64,
    pub circuit_breaker_rejections: u64,
}

/// Atomic counters shared across the pipeline.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced_requests: AtomicU64,
    stale_served: AtomicU64,
    negative_cache_hits: AtomicU64,
    lock_contentions: AtomicU64,
    upstream_errors: AtomicU64,
    circuit_breaker_rejections: AtomicU64,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_cache_hit(&self) {
        self.negative_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contentions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_rejection(&self) {
        self.circuit_breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Resets every counter to zero.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.coalesced_requests.store(0, Ordering::Relaxed);
        self.stale_served.store(0, Ordering::Relaxed);
        self.negative_cache_hits.store(0, Ordering::Relaxed);
        self.lock_contentions.store(0, Ordering::Relaxed);
        self.upstream_errors.store(0, Ordering::Relaxed);
        self.circuit_breaker_rejections.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let cache_hit_rate = if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 };

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate,
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            negative_cache_hits: self.negative_cache_hits.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            circuit_breaker_rejections: self.circuit_breaker_rejections.load(Ordering::Relaxed),
        }
    }
}
