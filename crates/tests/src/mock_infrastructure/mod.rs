//! Reusable mock infrastructure for pipeline tests.
//!
//! - [`RpcMockBuilder`]: wraps mockito with Ethereum JSON-RPC response
//!   builders and hit-count expectations.
//! - [`build_engine`]: assembles a `ProxyEngine` over a memory store and a
//!   client pointed at the mock servers, returning the store handle so tests
//!   can seed and inspect shards directly.

pub mod rpc_mock;

pub use rpc_mock::RpcMockBuilder;

use std::{sync::Arc, time::Duration};
use stratus_core::{
    cache::{CacheStore, MemoryStore},
    config::ProxyConfig,
    proxy::ProxyEngine,
    upstream::{RpcClient, RpcClientConfig},
};

/// A pipeline test configuration with fast timeouts.
#[must_use]
pub fn test_config(upstream_url: &str) -> ProxyConfig {
    ProxyConfig {
        upstream_rpc_url: upstream_url.to_string(),
        circuit_timeout: 2_000,
        coalescing_timeout: 5_000,
        ..ProxyConfig::default()
    }
}

/// Builds an engine over a fresh memory store, returning both so tests can
/// inspect the store's shards.
#[must_use]
pub fn build_engine(config: &ProxyConfig) -> (Arc<ProxyEngine>, Arc<dyn CacheStore>) {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = Arc::new(
        RpcClient::new(
            config.upstream_urls(),
            RpcClientConfig {
                max_retries_per_url: config.rpc_max_retries_per_url,
                request_timeout: Duration::from_secs(2),
                recovery_delay: Duration::from_secs(60),
            },
        )
        .expect("client construction"),
    );
    let engine = Arc::new(ProxyEngine::new(config, Arc::clone(&store), client));
    (engine, store)
}
