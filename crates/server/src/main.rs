//! Stratus server binary: loads configuration, wires the resolution
//! pipeline, and serves the JSON-RPC and management endpoints.

mod router;

use anyhow::Result;
use router::{AppState, ConfigSummary};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{signal, sync::broadcast};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{compression::CompressionLayer, limit::RequestBodyLimitLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stratus_core::{
    cache::connect_store,
    config::ProxyConfig,
    proxy::ProxyEngine,
    upstream::{RpcClient, RpcClientConfig},
};

/// Maximum accepted request body, covering large batches.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Concurrent in-flight HTTP requests.
const MAX_CONCURRENT_REQUESTS: usize = 1_024;

/// Initializes the logging system based on configuration.
fn init_logging(config: &ProxyConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,stratus_core=info,stratus=info,server=info"));

    let registry = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        registry.with(fmt_layer).init();
    }
}

/// Blocks until SIGINT or SIGTERM, then performs best-effort cleanup:
/// release held distributed locks, clear the coalescer, signal background
/// tasks.
async fn shutdown_signal(engine: Arc<ProxyEngine>, shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }

    engine.shutdown().await;
    let _ = shutdown_tx.send(());
    info!("shutdown cleanup complete");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProxyConfig::from_env()
        .map_err(|e| anyhow::anyhow!("configuration loading failed: {e}"))?;
    init_logging(&config);
    config.validate().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    info!(
        port = config.port,
        cache_type = %config.cache_type,
        upstreams = config.upstream_urls().len(),
        "starting stratus"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let store = connect_store(&config, &shutdown_tx)
        .await
        .map_err(|e| anyhow::anyhow!("cache store initialization failed: {e}"))?;

    let client = Arc::new(
        RpcClient::new(
            config.upstream_urls(),
            RpcClientConfig {
                max_retries_per_url: config.rpc_max_retries_per_url,
                request_timeout: Duration::from_secs(30),
                ..RpcClientConfig::default()
            },
        )
        .map_err(|e| anyhow::anyhow!("upstream client initialization failed: {e}"))?,
    );

    let engine = Arc::new(ProxyEngine::new(&config, store, client));

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        started_at: Instant::now(),
        config: ConfigSummary::from_config(&config),
    });

    let app = router::build_router(state)
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS));

    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "stratus listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine, shutdown_tx))
        .await?;

    info!("stratus stopped");
    Ok(())
}
