//! Circuit breaker behaviour through the full pipeline.

use crate::mock_infrastructure::{build_engine, test_config, RpcMockBuilder};
use serde_json::json;
use stratus_core::{cache::CacheStore, config::ProxyConfig, types::JsonRpcRequest};

#[tokio::test]
async fn test_breaker_trips_after_threshold_and_fast_fails() {
    let mut mock = RpcMockBuilder::new().await;
    // Threshold is 5: exactly five upstream attempts, then rejection without
    // upstream contact.
    mock.mock_http_error(502, 5).await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    for i in 0..5 {
        let response = engine
            .process_request(JsonRpcRequest::new("eth_blockNumber", None, json!(i)))
            .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, -32603, "request {i}");
    }

    // Breaker is now open: the sixth request is rejected locally.
    let rejected = engine
        .process_request(JsonRpcRequest::new("eth_blockNumber", None, json!(6)))
        .await;
    let error = rejected.error.expect("error");
    assert_eq!(error.code, -32603);
    assert!(error
        .data
        .expect("data")
        .as_str()
        .expect("string")
        .contains("circuit breaker is open"));

    mock.assert_all().await;

    let snap = engine.metrics().snapshot();
    assert_eq!(snap.upstream_errors, 5);
    assert_eq!(snap.circuit_breaker_rejections, 1);
    assert_eq!(engine.breaker_stats().await.state, "OPEN");
}

#[tokio::test]
async fn test_breaker_open_serves_stale_when_enabled() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_http_error(502, 5).await;
    let config = ProxyConfig { stale_while_revalidate: true, ..test_config(&mock.url()) };
    let (engine, store) = build_engine(&config);

    // Trip the breaker with a different method so the target fingerprint
    // stays un-negative.
    for i in 0..5 {
        engine
            .process_request(JsonRpcRequest::new("eth_gasPrice", None, json!(i)))
            .await;
    }
    assert_eq!(engine.breaker_stats().await.state, "OPEN");

    // A stale sibling exists for the next request: served with cached: true
    // instead of an error.
    let fp = stratus_core::policy::fingerprint("eth_blockNumber", None);
    store
        .set(&stratus_core::cache::stale_key(&fp), &json!("0xstale"), None)
        .await
        .expect("seed");

    let response = engine
        .process_request(JsonRpcRequest::new("eth_blockNumber", None, json!(9)))
        .await;
    assert_eq!(response.result.expect("result"), json!("0xstale"));
    assert_eq!(response.cached, Some(true));
}

#[tokio::test]
async fn test_breaker_disabled_never_rejects() {
    let mut mock = RpcMockBuilder::new().await;
    // Seven requests, seven upstream attempts: nothing ever fast-fails.
    mock.mock_http_error(502, 7).await;
    let config = ProxyConfig {
        circuit_breaker_enabled: false,
        ..test_config(&mock.url())
    };
    let (engine, _store) = build_engine(&config);

    for i in 0..7 {
        let response = engine
            .process_request(JsonRpcRequest::new("eth_blockNumber", None, json!(i)))
            .await;
        let data = response.error.expect("error").data.expect("data");
        assert!(
            !data.as_str().expect("string").contains("circuit breaker"),
            "request {i} was breaker-rejected"
        );
    }
    mock.assert_all().await;
    assert_eq!(engine.metrics().snapshot().circuit_breaker_rejections, 0);
}
