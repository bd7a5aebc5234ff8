//! In-process request coalescer.
//!
//! Collapses concurrent identical fetches into a single upstream call: the
//! first caller for a fingerprint becomes the leader and spawns the producer
//! as a detached task under a watchdog timeout; everyone (leader included)
//! awaits a broadcast of the shared outcome. The map entry is removed
//! *before* the outcome is broadcast, so late arrivals start a fresh flight
//! instead of subscribing to a dead one.
//!
//! Running the producer in a spawned task means cancelling any single waiter
//! never cancels the fetch the other waiters are riding.

use dashmap::DashMap;
use serde_json::Value;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::ProxyConfig;

/// Failure of a coalesced fetch, cloneable so every waiter receives the same
/// error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The in-flight watchdog fired before the producer finished.
    #[error("in-flight request timed out")]
    Timeout,

    /// The circuit breaker rejected the fetch without calling upstream.
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// The upstream returned a JSON-RPC error body.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// Transport-level upstream failure.
    #[error("{0}")]
    Upstream(String),
}

/// Shared outcome of a single in-flight fetch.
pub type FetchOutcome = Result<Value, FetchError>;

/// Coalescer configuration.
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Disabled coalescers bypass the map entirely (the watchdog still
    /// applies).
    pub enabled: bool,
    /// Watchdog timeout for one in-flight fetch.
    pub in_flight_timeout: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { enabled: true, in_flight_timeout: Duration::from_secs(30) }
    }
}

impl CoalescerConfig {
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self { enabled: config.coalescing_enabled, in_flight_timeout: config.coalescing_timeout() }
    }
}

/// Serialisable snapshot for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalescerStats {
    pub enabled: bool,
    pub in_flight: usize,
    pub coalesced_total: u64,
    pub timeouts_total: u64,
}

/// Process-local map from fingerprint to the single ongoing fetch.
pub struct RequestCoalescer {
    inflight: Arc<DashMap<String, broadcast::Sender<FetchOutcome>>>,
    config: CoalescerConfig,
    coalesced_total: Arc<AtomicU64>,
    timeouts_total: Arc<AtomicU64>,
}

impl RequestCoalescer {
    #[must_use]
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            config,
            coalesced_total: Arc::new(AtomicU64::new(0)),
            timeouts_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Joins the in-flight fetch for `fingerprint`, or starts one running
    /// `producer`.
    ///
    /// Returns the shared outcome and whether this caller joined an existing
    /// flight (for the coalesced-requests metric).
    pub async fn get_or_fetch<F>(&self, fingerprint: &str, producer: F) -> (FetchOutcome, bool)
    where
        F: Future<Output = FetchOutcome> + Send + 'static,
    {
        if !self.config.enabled {
            let outcome =
                match tokio::time::timeout(self.config.in_flight_timeout, producer).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
                        Err(FetchError::Timeout)
                    }
                };
            return (outcome, false);
        }

        let (mut rx, joined) = match self.inflight.entry(fingerprint.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // Subscribing while the shard guard is held guarantees the
                // subscription exists before the leader can remove + send.
                let rx = entry.get().subscribe();
                drop(entry);
                self.coalesced_total.fetch_add(1, Ordering::Relaxed);
                (rx, true)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(1);
                entry.insert(tx.clone());

                let inflight = Arc::clone(&self.inflight);
                let timeouts = Arc::clone(&self.timeouts_total);
                let key = fingerprint.to_string();
                let watchdog = self.config.in_flight_timeout;

                tokio::spawn(async move {
                    let outcome = match tokio::time::timeout(watchdog, producer).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            timeouts.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(fingerprint = %key, "in-flight fetch timed out");
                            Err(FetchError::Timeout)
                        }
                    };
                    // Remove before notifying: a waiter arriving after the
                    // broadcast must start a fresh flight, not subscribe to a
                    // finished one.
                    inflight.remove(&key);
                    let _ = tx.send(outcome);
                });

                (rx, false)
            }
        };

        let outcome = match rx.recv().await {
            Ok(outcome) => outcome,
            // Sender dropped without sending (producer task died); the
            // pipeline tolerates a dropped flight.
            Err(_) => Err(FetchError::Upstream("in-flight fetch was dropped".to_string())),
        };

        (outcome, joined)
    }

    /// Drops all in-flight entries. Used at shutdown; outstanding producer
    /// tasks finish into a closed channel.
    pub fn clear(&self) {
        self.inflight.clear();
    }

    /// Number of distinct fingerprints currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            enabled: self.config.enabled,
            in_flight: self.inflight.len(),
            coalesced_total: self.coalesced_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
        }
    }
}
