//! Per-URL upstream endpoint with health tracking.
//!
//! Health policy: three consecutive failures mark an endpoint unhealthy; a
//! detached one-shot timer marks it healthy again after the recovery delay
//! ("passive recheck"), and the next successful call resets its counters.
//! Readers (the health endpoint) may observe slightly stale but consistent
//! snapshots.

use crate::utils::sanitize_url;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Consecutive failures after which an endpoint is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Default delay before an unhealthy endpoint is passively rechecked.
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct EndpointHealth {
    healthy: bool,
    consecutive_failures: u32,
    success_count: u64,
    failure_count: u64,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

impl EndpointHealth {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            success_count: 0,
            failure_count: 0,
            last_error: None,
            last_error_time: None,
            last_success_time: None,
        }
    }
}

/// Serialisable health snapshot for the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHealthSnapshot {
    /// Sanitised URL; API-key path segments are rewritten.
    pub url: String,
    pub healthy: bool,
    pub failure_count: u64,
    pub success_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<DateTime<Utc>>,
}

/// A single upstream URL with its health record.
pub struct UpstreamEndpoint {
    url: String,
    display_url: String,
    health: RwLock<EndpointHealth>,
    recheck_pending: AtomicBool,
}

impl UpstreamEndpoint {
    #[must_use]
    pub fn new(url: String) -> Self {
        let display_url = sanitize_url(&url);
        Self {
            url,
            display_url,
            health: RwLock::new(EndpointHealth::new()),
            recheck_pending: AtomicBool::new(false),
        }
    }

    /// The raw URL used for requests. Never log this; use
    /// [`display_url`](Self::display_url).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sanitised URL safe for logs and metrics.
    #[must_use]
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health.read().healthy
    }

    /// Records a successful call: resets the consecutive-failure count and
    /// re-marks the endpoint healthy.
    pub fn record_success(&self) {
        let mut health = self.health.write();
        health.consecutive_failures = 0;
        health.success_count += 1;
        health.healthy = true;
        health.last_success_time = Some(Utc::now());
    }

    /// Records a failed call. Returns `true` when this failure crossed the
    /// unhealthy threshold, so the caller can schedule a recheck.
    pub fn record_failure(&self, error: &str) -> bool {
        let mut health = self.health.write();
        health.consecutive_failures += 1;
        health.failure_count += 1;
        health.last_error = Some(error.to_string());
        health.last_error_time = Some(Utc::now());

        if health.healthy && health.consecutive_failures >= UNHEALTHY_THRESHOLD {
            health.healthy = false;
            tracing::warn!(
                url = %self.display_url,
                consecutive_failures = health.consecutive_failures,
                "upstream endpoint marked unhealthy"
            );
            return true;
        }
        false
    }

    /// Schedules a one-shot passive recheck that re-marks the endpoint
    /// healthy after `delay`, regardless of intervening traffic.
    ///
    /// At most one recheck is pending at a time; the task is detached and
    /// does not keep the process alive.
    pub fn schedule_recheck(self: &Arc<Self>, delay: Duration) {
        if self
            .recheck_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut health = endpoint.health.write();
                health.healthy = true;
            }
            endpoint.recheck_pending.store(false, Ordering::Release);
            tracing::info!(
                url = %endpoint.display_url,
                "upstream endpoint re-eligible after recovery delay"
            );
        });
    }

    /// Consistent point-in-time snapshot for the health endpoint.
    #[must_use]
    pub fn snapshot(&self) -> EndpointHealthSnapshot {
        let health = self.health.read();
        EndpointHealthSnapshot {
            url: self.display_url.clone(),
            healthy: health.healthy,
            failure_count: health.failure_count,
            success_count: health.success_count,
            last_error: health.last_error.clone(),
            last_error_time: health.last_error_time,
            last_success_time: health.last_success_time,
        }
    }
}
