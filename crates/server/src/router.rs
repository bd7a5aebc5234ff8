//! HTTP surface: JSON-RPC endpoint plus health and cache management routes.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Instant};
use stratus_core::{
    config::ProxyConfig,
    proxy::ProxyEngine,
    types::{error_codes, JsonRpcResponse},
    upstream::EndpointHealthSnapshot,
};

/// Configuration excerpt reported by the health endpoint. Only toggles and
/// policy knobs; never URLs with credentials.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub cache_type: String,
    pub permanent_cache_height: u64,
    pub latest_block_ttl: u64,
    pub recent_block_ttl: u64,
    pub eth_call_ttl: u64,
    pub coalescing_enabled: bool,
    pub distributed_lock_enabled: bool,
    pub circuit_breaker_enabled: bool,
    pub stale_while_revalidate: bool,
    pub negative_caching: bool,
    pub upstream_count: usize,
}

impl ConfigSummary {
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            cache_type: config.cache_type.to_string(),
            permanent_cache_height: config.permanent_cache_height,
            latest_block_ttl: config.latest_block_ttl,
            recent_block_ttl: config.recent_block_ttl,
            eth_call_ttl: config.eth_call_ttl,
            coalescing_enabled: config.coalescing_enabled,
            distributed_lock_enabled: config.distributed_lock_enabled,
            circuit_breaker_enabled: config.circuit_breaker_enabled,
            stale_while_revalidate: config.stale_while_revalidate,
            negative_caching: config.negative_caching,
            upstream_count: config.upstream_urls().len(),
        }
    }
}

/// Shared handler state.
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub started_at: Instant,
    pub config: ConfigSummary,
}

/// Builds the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/health", get(handle_health))
        .route("/cache/stats", get(handle_cache_stats))
        .route("/cache/flush", post(handle_cache_flush))
        .with_state(state)
}

/// Handles JSON-RPC requests, single or batched.
///
/// A body that is not valid JSON gets a `-32700` envelope; shape errors in
/// individual requests surface as `-32600` per element.
async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> impl IntoResponse {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let response = JsonRpcResponse::error_with_data(
                error_codes::PARSE_ERROR,
                "Parse error",
                json!(rejection.body_text()),
                Arc::new(Value::Null),
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(response).unwrap_or(Value::Null)),
            );
        }
    };

    let result = state.engine.process_value(payload).await;
    (StatusCode::OK, Json(result))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    /// Seconds since startup.
    uptime: u64,
    cache_type: &'static str,
    metrics: Value,
    rpc_providers: Vec<EndpointHealthSnapshot>,
    config: ConfigSummary,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = &state.engine;
    let providers = engine.endpoints_snapshot();
    let status = if providers.iter().any(|p| p.healthy) { "healthy" } else { "degraded" };

    let mut metrics = serde_json::to_value(engine.metrics().snapshot()).unwrap_or(json!({}));
    if let Value::Object(map) = &mut metrics {
        map.insert(
            "coalescing".to_string(),
            serde_json::to_value(engine.coalescer_stats()).unwrap_or(Value::Null),
        );
        map.insert(
            "circuitBreaker".to_string(),
            serde_json::to_value(engine.breaker_stats().await).unwrap_or(Value::Null),
        );
        map.insert(
            "distributedLock".to_string(),
            serde_json::to_value(engine.lock_stats()).unwrap_or(Value::Null),
        );
    }

    Json(HealthResponse {
        status,
        uptime: state.started_at.elapsed().as_secs(),
        cache_type: engine.cache_backend(),
        metrics,
        rpc_providers: providers,
        config: state.config.clone(),
    })
}

async fn handle_cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = &state.engine;
    Json(json!({
        "backend": engine.cache_backend(),
        "store": engine.store_stats().await,
        "metrics": engine.metrics().snapshot(),
    }))
}

async fn handle_cache_flush(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.flush_all().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "all caches flushed, metrics reset" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "cache flush failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": e.to_string() })),
            )
        }
    }
}
