//! The request-resolution pipeline.
//!
//! For every cacheable request the engine walks a strict, observable order:
//! negative check → positive check → stale check → coalesce → distributed
//! lock → cache re-read → circuit breaker → upstream → cache write → lock
//! release. Non-cacheable methods pass straight through the breaker to the
//! upstream client.
//!
//! The pipeline catches every failure, updates metrics, optionally writes a
//! negative entry or serves a stale sibling, and always returns a well-formed
//! JSON-RPC response; nothing propagates to the HTTP framing layer.

use crate::{
    cache::{negative_key, stale_key, CacheStore, StoreStats},
    coalesce::{CoalescerConfig, CoalescerStats, FetchError, FetchOutcome, RequestCoalescer},
    config::ProxyConfig,
    lock::{DistributedLock, DistributedLockConfig, DistributedLockStats},
    metrics::MetricsCollector,
    policy::{fingerprint, CacheTtl, MethodPolicy},
    proxy::errors::ProxyError,
    types::{error_codes, JsonRpcRequest, JsonRpcResponse},
    upstream::{
        circuit_breaker::CircuitBreakerStats, CircuitBreaker, CircuitBreakerConfig,
        CircuitBreakerError, EndpointHealthSnapshot, RpcClient, UpstreamError,
    },
};
use serde_json::{json, Value};
use std::{future::Future, sync::Arc, time::Duration};

/// Delay before re-reading the cache after a failed lock acquisition:
/// another instance probably just filled it.
const POST_LOCK_FAILURE_RECHECK_DELAY: Duration = Duration::from_millis(100);

/// Stale/negative caching switches derived from configuration.
#[derive(Debug, Clone)]
struct EngineOptions {
    stale_while_revalidate: bool,
    stale_ttl: Duration,
    negative_caching: bool,
    negative_ttl: Duration,
}

/// Core engine orchestrating policy, caches, coalescer, lock, breaker, and
/// the upstream client. One instance per process, shared via `Arc`.
pub struct ProxyEngine {
    policy: MethodPolicy,
    store: Arc<dyn CacheStore>,
    coalescer: Arc<RequestCoalescer>,
    lock: Arc<DistributedLock>,
    breaker: Arc<CircuitBreaker>,
    client: Arc<RpcClient>,
    metrics: Arc<MetricsCollector>,
    options: EngineOptions,
}

impl ProxyEngine {
    /// Wires the pipeline from configuration plus the externally-constructed
    /// store and client.
    #[must_use]
    pub fn new(config: &ProxyConfig, store: Arc<dyn CacheStore>, client: Arc<RpcClient>) -> Self {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::from_config(config))
            .with_transition_hook(Arc::new(|from, to| {
                tracing::debug!(from = from.as_str(), to = to.as_str(), "breaker transition");
            }));

        Self {
            policy: MethodPolicy::from_config(config),
            coalescer: Arc::new(RequestCoalescer::new(CoalescerConfig::from_config(config))),
            lock: Arc::new(DistributedLock::new(
                Arc::clone(&store),
                DistributedLockConfig::from_config(config),
            )),
            breaker: Arc::new(breaker),
            client,
            metrics: Arc::new(MetricsCollector::new()),
            store,
            options: EngineOptions {
                stale_while_revalidate: config.stale_while_revalidate,
                stale_ttl: Duration::from_secs(config.stale_ttl),
                negative_caching: config.negative_caching,
                negative_ttl: Duration::from_secs(config.negative_ttl),
            },
        }
    }

    /// Processes a raw JSON payload: a single request object or a batch
    /// array. Batches run concurrently and return in order.
    pub async fn process_value(self: &Arc<Self>, payload: Value) -> Value {
        match payload {
            Value::Array(elements) => {
                let futures = elements.into_iter().map(|element| {
                    let engine = Arc::clone(self);
                    async move { engine.process_element(element).await }
                });
                Value::Array(futures::future::join_all(futures).await)
            }
            other => self.process_element(other).await,
        }
    }

    async fn process_element(&self, element: Value) -> Value {
        let response = match serde_json::from_value::<JsonRpcRequest>(element) {
            Ok(request) => self.process_request(request).await,
            Err(e) => JsonRpcResponse::error_with_data(
                error_codes::INVALID_REQUEST,
                "Invalid Request",
                json!(e.to_string()),
                Arc::new(Value::Null),
            ),
        };
        serde_json::to_value(response).unwrap_or_else(|_| json!(null))
    }

    /// Resolves one JSON-RPC request end to end.
    pub async fn process_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        self.metrics.record_request();
        let id = Arc::clone(&request.id);

        // 1. Protocol gate.
        if let Err(reason) = request.validate() {
            return JsonRpcResponse::error_with_data(
                error_codes::INVALID_REQUEST,
                "Invalid Request",
                json!(reason),
                id,
            );
        }

        // 2. Classify.
        let ttl = self.policy.ttl(&request.method, request.params.as_ref());
        if !ttl.is_cacheable() {
            return self.passthrough(&request).await;
        }

        // 3. Fingerprint.
        let fp = fingerprint(&request.method, request.params.as_ref());

        // 4. Negative check.
        if self.options.negative_caching {
            if let Some(entry) = read_cache(&self.store, &negative_key(&fp)).await {
                self.metrics.record_negative_cache_hit();
                let message = entry
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or("Internal error")
                    .to_string();
                let data = json!({
                    "cached": true,
                    "timestamp": entry.get("timestamp").cloned().unwrap_or(Value::Null),
                });
                return JsonRpcResponse::error_with_data(
                    error_codes::INTERNAL_ERROR,
                    message,
                    data,
                    id,
                );
            }
        }

        // 5. Positive check; the stale sibling is only consulted on a miss.
        if let Some(value) = read_cache(&self.store, &fp).await {
            self.metrics.record_cache_hit();
            return JsonRpcResponse::success(value, id, true);
        }
        if self.options.stale_while_revalidate {
            if let Some(value) = read_cache(&self.store, &stale_key(&fp)).await {
                self.metrics.record_cache_hit();
                self.metrics.record_stale_served();
                self.spawn_background_refresh(
                    fp.clone(),
                    request.method.clone(),
                    request.params.clone(),
                    ttl,
                );
                return JsonRpcResponse::success(value, id, true);
            }
        }
        self.metrics.record_cache_miss();

        // 6. Coalesce; the producer runs lock → re-read → breaker → upstream
        //    → cache write → lock release.
        let producer =
            self.producer(fp.clone(), request.method.clone(), request.params.clone(), ttl);
        let (outcome, joined) = self.coalescer.get_or_fetch(&fp, producer).await;
        if joined {
            self.metrics.record_coalesced();
        }

        match outcome {
            // 7. Every waiter of a live fetch reports cached: false; only a
            //    response served without triggering a fetch is cached: true.
            Ok(value) => JsonRpcResponse::success(value, id, false),
            Err(err) => self.resolve_fetch_error(err, &fp, id).await,
        }
    }

    /// Non-cacheable path: straight through the breaker to upstream.
    async fn passthrough(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = Arc::clone(&request.id);
        let call = self.client.call(&request.method, request.params.as_ref());
        match self.breaker.execute(call).await {
            Ok(value) => JsonRpcResponse::success(value, id, false),
            Err(e) => {
                let detail = self.record_breaker_error(&e);
                JsonRpcResponse::error_with_data(
                    error_codes::INTERNAL_ERROR,
                    "Internal error",
                    json!(detail),
                    id,
                )
            }
        }
    }

    /// Records metrics for a breaker-guarded failure and renders its detail.
    fn record_breaker_error(&self, error: &CircuitBreakerError<UpstreamError>) -> String {
        match error {
            CircuitBreakerError::Open => {
                self.metrics.record_circuit_breaker_rejection();
                error.to_string()
            }
            CircuitBreakerError::Timeout | CircuitBreakerError::Inner(_) => {
                self.metrics.record_upstream_error();
                error.to_string()
            }
        }
    }

    /// Builds the single-flight producer for a cache miss.
    fn producer(
        &self,
        fp: String,
        method: String,
        params: Option<Value>,
        ttl: CacheTtl,
    ) -> impl Future<Output = FetchOutcome> + Send + 'static {
        let store = Arc::clone(&self.store);
        let lock = Arc::clone(&self.lock);
        let breaker = Arc::clone(&self.breaker);
        let client = Arc::clone(&self.client);
        let metrics = Arc::clone(&self.metrics);
        let options = self.options.clone();

        async move {
            // a. Cross-instance dedup, best effort.
            let lock_acquired = if lock.is_enabled() {
                let acquired = lock.acquire(&fp).await;
                if !acquired {
                    metrics.record_lock_contention();
                    // Another instance is probably fetching; give it a moment
                    // and honour an intervening fill.
                    tokio::time::sleep(POST_LOCK_FAILURE_RECHECK_DELAY).await;
                    if let Some(value) = read_cache(&store, &fp).await {
                        return Ok(value);
                    }
                }
                acquired
            } else {
                false
            };

            let outcome: FetchOutcome = async {
                // b. Re-read inside the critical section: another instance
                //    may have filled the cache while we acquired.
                if lock_acquired {
                    if let Some(value) = read_cache(&store, &fp).await {
                        return Ok(value);
                    }
                }

                // c. Upstream through the breaker.
                let call = client.call(&method, params.as_ref());
                match breaker.execute(call).await {
                    Ok(value) => {
                        // d. Fill positive (and stale) shards.
                        write_result(&store, &fp, &value, ttl, &options).await;
                        Ok(value)
                    }
                    Err(CircuitBreakerError::Open) => {
                        metrics.record_circuit_breaker_rejection();
                        Err(FetchError::BreakerOpen)
                    }
                    Err(CircuitBreakerError::Timeout) => {
                        metrics.record_upstream_error();
                        Err(FetchError::Upstream("upstream call timed out".to_string()))
                    }
                    Err(CircuitBreakerError::Inner(UpstreamError::RpcError { code, message })) => {
                        metrics.record_upstream_error();
                        Err(FetchError::Rpc { code, message })
                    }
                    Err(CircuitBreakerError::Inner(e)) => {
                        metrics.record_upstream_error();
                        Err(FetchError::Upstream(e.to_string()))
                    }
                }
            }
            .await;

            // e. Release on every exit path from the critical section.
            if lock_acquired {
                lock.release(&fp).await;
            }
            outcome
        }
    }

    /// Error path of the coalesced fetch: stale fallback for breaker
    /// rejections, negative entry, JSON-RPC mapping.
    async fn resolve_fetch_error(
        &self,
        error: FetchError,
        fp: &str,
        id: Arc<Value>,
    ) -> JsonRpcResponse {
        if matches!(error, FetchError::BreakerOpen) && self.options.stale_while_revalidate {
            if let Some(value) = read_cache(&self.store, &stale_key(fp)).await {
                self.metrics.record_stale_served();
                tracing::debug!(fingerprint = fp, "serving stale entry while breaker is open");
                return JsonRpcResponse::success(value, id, true);
            }
        }

        if self.options.negative_caching {
            let entry = json!({
                "errorMessage": error.to_string(),
                "timestamp": chrono::Utc::now().timestamp_millis(),
            });
            if let Err(e) = self
                .store
                .set(&negative_key(fp), &entry, Some(self.options.negative_ttl))
                .await
            {
                tracing::warn!(error = %e, fingerprint = fp, "negative cache write failed");
            }
        }

        JsonRpcResponse::error_with_data(
            error_codes::INTERNAL_ERROR,
            "Internal error",
            json!(error.to_string()),
            id,
        )
    }

    /// Detached best-effort refresh behind a stale hit. Breaker applies,
    /// errors are swallowed.
    fn spawn_background_refresh(
        &self,
        fp: String,
        method: String,
        params: Option<Value>,
        ttl: CacheTtl,
    ) {
        let store = Arc::clone(&self.store);
        let breaker = Arc::clone(&self.breaker);
        let client = Arc::clone(&self.client);
        let options = self.options.clone();

        tokio::spawn(async move {
            let call = client.call(&method, params.as_ref());
            match breaker.execute(call).await {
                Ok(value) => {
                    write_result(&store, &fp, &value, ttl, &options).await;
                    tracing::debug!(fingerprint = %fp, "background refresh completed");
                }
                Err(e) => {
                    tracing::debug!(fingerprint = %fp, error = %e, "background refresh failed");
                }
            }
        });
    }

    /// Flushes every cache shard and resets metrics.
    ///
    /// # Errors
    ///
    /// Surfaces the store error; flush is an operator action, not a request
    /// path, so failures are not downgraded.
    pub async fn flush_all(&self) -> Result<(), ProxyError> {
        self.store.flush_all().await?;
        self.metrics.reset();
        tracing::info!("caches flushed, metrics reset");
        Ok(())
    }

    /// Best-effort shutdown: release held locks, drop in-flight map.
    pub async fn shutdown(&self) {
        self.lock.release_all().await;
        self.coalescer.clear();
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    #[must_use]
    pub fn cache_backend(&self) -> &'static str {
        self.store.backend_kind()
    }

    pub async fn store_stats(&self) -> StoreStats {
        self.store.stats().await
    }

    #[must_use]
    pub fn endpoints_snapshot(&self) -> Vec<EndpointHealthSnapshot> {
        self.client.endpoints().iter().map(|e| e.snapshot()).collect()
    }

    pub async fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats().await
    }

    #[must_use]
    pub fn coalescer_stats(&self) -> CoalescerStats {
        self.coalescer.stats()
    }

    #[must_use]
    pub fn lock_stats(&self) -> DistributedLockStats {
        self.lock.stats()
    }
}

/// Cache read with store failures downgraded to a miss.
async fn read_cache(store: &Arc<dyn CacheStore>, key: &str) -> Option<Value> {
    match store.get(key).await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, key, "cache read failed, treating as miss");
            None
        }
    }
}

/// Best-effort positive (and stale sibling) write.
///
/// Permanent entries get no stale sibling: they never expire, so there is
/// nothing to revalidate. Bounded entries get a sibling that outlives the
/// fresh copy by the configured stale TTL. A successful fill also clears the
/// negative shard: a fresh positive entry must never sit shadowed behind a
/// stored failure.
async fn write_result(
    store: &Arc<dyn CacheStore>,
    fp: &str,
    value: &Value,
    ttl: CacheTtl,
    options: &EngineOptions,
) {
    let expiry = match ttl {
        CacheTtl::Skip => return,
        CacheTtl::Permanent => None,
        CacheTtl::Seconds(secs) => Some(Duration::from_secs(secs)),
    };

    if let Err(e) = store.set(fp, value, expiry).await {
        tracing::warn!(error = %e, fingerprint = fp, "cache write failed");
    }

    if options.stale_while_revalidate {
        if let Some(fresh_ttl) = expiry {
            let stale_expiry = fresh_ttl + options.stale_ttl;
            if let Err(e) = store.set(&stale_key(fp), value, Some(stale_expiry)).await {
                tracing::warn!(error = %e, fingerprint = fp, "stale cache write failed");
            }
        }
    }

    if options.negative_caching {
        if let Err(e) = store.delete(&negative_key(fp)).await {
            tracing::warn!(error = %e, fingerprint = fp, "negative entry delete failed");
        }
    }
}
