//! Circuit breaker guarding upstream calls.
//!
//! Three-state machine:
//!
//! - `Closed` → `Open`: consecutive failures reach the threshold, or the
//!   rolling window holds at least `volume_threshold` samples with a failure
//!   ratio at or above `error_threshold_percentage`.
//! - `Open` → `HalfOpen`: lazily, on the first arrival after `next_attempt`.
//! - `HalfOpen` → `Closed`: after `success_threshold` consecutive successes.
//! - `HalfOpen` → `Open`: on any failure.
//!
//! Every admitted call is capped by a per-call timeout; a timeout counts as a
//! failure. All mutable state lives under a single `RwLock` so state reads
//! and the rolling-window buffer are serialised against transitions.

use std::{
    collections::VecDeque,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::ProxyConfig;

/// Circuit breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests are forwarded and failures counted.
    Closed,
    /// Requests are rejected without touching the upstream.
    Open,
    /// Recovery probing; limited successes close the circuit.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Errors produced by a guarded call.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the upstream was not invoked.
    #[error("circuit breaker is open")]
    Open,

    /// The guarded call exceeded the per-call timeout.
    #[error("circuit breaker call timeout")]
    Timeout,

    /// The guarded call itself failed.
    #[error(transparent)]
    Inner(E),
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Disabled breakers admit everything but still apply the call timeout.
    pub enabled: bool,
    /// Consecutive failures tripping `Closed` → `Open`.
    pub failure_threshold: u32,
    /// Consecutive `HalfOpen` successes required to close.
    pub success_threshold: u32,
    /// Per-call timeout; a timeout counts as a failure.
    pub call_timeout: Duration,
    /// Time an open circuit waits before admitting a probe.
    pub reset_timeout: Duration,
    /// Rolling window length for percentage-based tripping.
    pub window_size: Duration,
    /// Minimum window samples before the percentage rule applies.
    pub volume_threshold: u32,
    /// Failure percentage (0-100) tripping within the window.
    pub error_threshold_percentage: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_millis(10_000),
            reset_timeout: Duration::from_millis(60_000),
            window_size: Duration::from_secs(60),
            volume_threshold: 10,
            error_threshold_percentage: 50,
        }
    }
}

impl CircuitBreakerConfig {
    /// Builds breaker configuration from proxy configuration.
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            enabled: config.circuit_breaker_enabled,
            failure_threshold: config.circuit_failure_threshold,
            success_threshold: config.circuit_success_threshold,
            call_timeout: config.circuit_timeout(),
            reset_timeout: config.circuit_reset_timeout(),
            window_size: Duration::from_secs(60),
            volume_threshold: config.circuit_volume_threshold,
            error_threshold_percentage: config.circuit_error_percentage,
        }
    }
}

/// Hook invoked on every state transition as `(from, to)`.
pub type TransitionHook = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Internal mutable state under a single lock.
///
/// Consolidating the state variable, counters, and the rolling-window buffer
/// prevents torn reads during transitions.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    next_attempt: Option<Instant>,
    window: VecDeque<(Instant, bool)>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            next_attempt: None,
            window: VecDeque::new(),
        }
    }

    fn prune_window(&mut self, window_size: Duration) {
        let cutoff = Instant::now().checked_sub(window_size);
        if let Some(cutoff) = cutoff {
            while self.window.front().is_some_and(|(at, _)| *at < cutoff) {
                self.window.pop_front();
            }
        }
    }

    fn window_failure_ratio_tripped(&self, volume_threshold: u32, error_pct: u32) -> bool {
        let samples = self.window.len() as u32;
        if samples < volume_threshold {
            return false;
        }
        let failures = self.window.iter().filter(|(_, success)| !success).count() as u32;
        failures * 100 >= samples * error_pct
    }
}

/// Serialisable snapshot for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub window_samples: usize,
    pub enabled: bool,
}

/// Three-state circuit breaker with rolling-window percentage tripping.
pub struct CircuitBreaker {
    inner: RwLock<BreakerInner>,
    config: CircuitBreakerConfig,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { inner: RwLock::new(BreakerInner::new()), config, on_transition: None }
    }

    /// Attaches a transition hook for logging and metrics.
    #[must_use]
    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        // The target state owns its transient counters; entering it resets them.
        match to {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.next_attempt = None;
            }
            CircuitState::Open => {
                inner.half_open_successes = 0;
                inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
            }
        }

        match to {
            CircuitState::Open => tracing::warn!(from = from.as_str(), "circuit breaker opened"),
            CircuitState::HalfOpen => {
                tracing::info!(from = from.as_str(), "circuit breaker half-open");
            }
            CircuitState::Closed => {
                tracing::info!(from = from.as_str(), "circuit breaker closed");
            }
        }

        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }

    /// Runs `fut` under the breaker and the per-call timeout.
    ///
    /// # Errors
    ///
    /// - [`CircuitBreakerError::Open`] when the circuit rejects without
    ///   invoking the upstream.
    /// - [`CircuitBreakerError::Timeout`] when the call exceeds the per-call
    ///   timeout (recorded as a failure).
    /// - [`CircuitBreakerError::Inner`] wrapping the call's own error.
    pub async fn execute<T, E, F>(&self, fut: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if self.config.enabled && !self.try_admit().await {
            return Err(CircuitBreakerError::Open);
        }

        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                if self.config.enabled {
                    self.record_success().await;
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                if self.config.enabled {
                    self.record_failure().await;
                }
                Err(CircuitBreakerError::Inner(e))
            }
            Err(_) => {
                if self.config.enabled {
                    self.record_failure().await;
                }
                Err(CircuitBreakerError::Timeout)
            }
        }
    }

    /// Whether a call may proceed, lazily transitioning `Open` → `HalfOpen`
    /// once `next_attempt` has passed.
    ///
    /// Double-checked locking: the fast path takes only the read lock.
    async fn try_admit(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    match inner.next_attempt {
                        Some(at) if Instant::now() >= at => {} // fall through to write path
                        _ => return false,
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;
        // Re-check: another task may have transitioned while we waited.
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match inner.next_attempt {
                Some(at) if Instant::now() >= at => {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                }
                _ => false,
            },
        }
    }

    /// Records a successful guarded call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.prune_window(self.config.window_size);
        inner.window.push_back((Instant::now(), true));

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A success observed while nominally open means a probe raced the
            // transition; treat it as recovery.
            CircuitState::Open => {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    /// Records a failed guarded call, tripping the circuit when a threshold
    /// is crossed.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.prune_window(self.config.window_size);
        inner.window.push_back((Instant::now(), false));

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                let consecutive_trip =
                    inner.consecutive_failures >= self.config.failure_threshold;
                let window_trip = inner.window_failure_ratio_tripped(
                    self.config.volume_threshold,
                    self.config.error_threshold_percentage,
                );
                if consecutive_trip || window_trip {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the circuit open.
    pub async fn trip(&self) {
        let mut inner = self.inner.write().await;
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Forces the circuit closed and clears counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        self.transition(&mut inner, CircuitState::Closed);
        inner.window.clear();
    }

    /// Forces the circuit into recovery probing.
    pub async fn attempt_reset(&self) {
        let mut inner = self.inner.write().await;
        self.transition(&mut inner, CircuitState::HalfOpen);
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read().await;
        CircuitBreakerStats {
            state: inner.state.as_str(),
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            window_samples: inner.window.len(),
            enabled: self.config.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 2,
            call_timeout: Duration::from_millis(200),
            reset_timeout: Duration::from_millis(100),
            window_size: Duration::from_secs(60),
            volume_threshold: 100, // effectively disable window tripping
            error_threshold_percentage: 50,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute::<(), _, _>(async { Err::<(), &str>("boom") })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute::<_, &str, _>(async { Ok::<_, &str>(1) }).await;
    }

    #[tokio::test]
    async fn test_trips_open_at_threshold() {
        let breaker = CircuitBreaker::new(test_config());
        assert_eq!(breaker.state().await, CircuitState::Closed);

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Open rejects without invoking the upstream.
        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute::<(), &str, _>(async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_after_reset_timeout_then_closes() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        // First arrival after next_attempt transitions lazily to HalfOpen.
        succeed(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        // success_threshold = 2: second success closes.
        succeed(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        breaker.attempt_reset().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_window_percentage_trip() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1000, // consecutive rule out of the way
            volume_threshold: 10,
            error_threshold_percentage: 50,
            ..test_config()
        };
        let breaker = CircuitBreaker::new(config);

        // 5 successes then 5 failures: 10 samples, 50% failure ratio.
        for _ in 0..5 {
            succeed(&breaker).await;
        }
        for _ in 0..4 {
            fail(&breaker).await;
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig { failure_threshold: 1, ..test_config() };
        let breaker = CircuitBreaker::new(config);

        let result = breaker
            .execute::<(), &str, _>(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout)));
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_manual_operations() {
        let breaker = CircuitBreaker::new(test_config());

        breaker.trip().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        breaker.attempt_reset().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.stats().await.window_samples, 0);
    }

    #[tokio::test]
    async fn test_transition_hook_fires() {
        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        let breaker = CircuitBreaker::new(test_config()).with_transition_hook(Arc::new(
            move |from, to| {
                seen.lock().push((from, to));
            },
        ));

        for _ in 0..3 {
            fail(&breaker).await;
        }
        breaker.reset().await;

        let seen = transitions.lock();
        assert_eq!(
            *seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed)
            ]
        );
    }

    #[tokio::test]
    async fn test_disabled_breaker_admits_everything() {
        let config = CircuitBreakerConfig { enabled: false, failure_threshold: 1, ..test_config() };
        let breaker = CircuitBreaker::new(config);

        fail(&breaker).await;
        fail(&breaker).await;
        // Still admitted: disabled breakers never open.
        let result = breaker.execute::<_, &str, _>(async { Ok::<_, &str>(7) }).await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }
}
