//! End-to-end tests for the resolution pipeline: coalescing, cache hits,
//! stale serving, negative caching, batches, and flush round-trips.

use crate::mock_infrastructure::{build_engine, test_config, RpcMockBuilder};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use stratus_core::{
    cache::{stale_key, CacheStore},
    config::ProxyConfig,
    policy::fingerprint,
    types::JsonRpcRequest,
};

fn request(method: &str, params: Option<Value>, id: i64) -> JsonRpcRequest {
    JsonRpcRequest::new(method, params, json!(id))
}

#[tokio::test]
async fn test_concurrent_identical_requests_coalesce_to_one_fetch() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_slow_result(
        "eth_blockNumber",
        &json!("0x16433f9"),
        Duration::from_millis(100),
        1,
    )
    .await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.process_request(request("eth_blockNumber", None, i)).await
        }));
    }

    for handle in handles {
        let response = handle.await.expect("task");
        assert_eq!(response.result.expect("result"), json!("0x16433f9"));
        // Riders of a live fetch are part of that fetch: cached is false for
        // every one of the ten.
        assert_eq!(response.cached, Some(false));
    }

    // Exactly one upstream call was made.
    mock.assert_all().await;
    let snap = engine.metrics().snapshot();
    assert_eq!(snap.coalesced_requests, 9);
    assert_eq!(snap.cache_misses, 10);
}

#[tokio::test]
async fn test_fresh_cache_hit_serves_without_upstream() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number("0x1", 1).await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    let first = engine.process_request(request("eth_blockNumber", None, 1)).await;
    assert_eq!(first.cached, Some(false));

    let second = engine.process_request(request("eth_blockNumber", None, 2)).await;
    assert_eq!(second.result.expect("result"), json!("0x1"));
    assert_eq!(second.cached, Some(true));

    // expect(1): the second request never reached upstream.
    mock.assert_all().await;
    assert_eq!(engine.metrics().snapshot().cache_hits, 1);
}

#[tokio::test]
async fn test_historical_block_is_cached_permanently() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_result(
        "eth_getBlockByNumber",
        &json!({"number": "0x1", "hash": "0xabc"}),
        1,
    )
    .await;
    let (engine, store) = build_engine(&test_config(&mock.url()));

    let params = json!(["0x1", false]);
    let response = engine
        .process_request(request("eth_getBlockByNumber", Some(params.clone()), 1))
        .await;
    assert_eq!(response.result.expect("result")["number"], json!("0x1"));

    // Height 1 sits below the permanent cut-off: the entry is stored and
    // keeps serving hits without any further upstream traffic.
    let fp = fingerprint("eth_getBlockByNumber", Some(&params));
    assert!(store.get(&fp).await.expect("store read").is_some());

    let again = engine
        .process_request(request("eth_getBlockByNumber", Some(params), 2))
        .await;
    assert_eq!(again.cached, Some(true));
    mock.assert_all().await;
}

#[tokio::test]
async fn test_batch_fans_out_and_preserves_order() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number("0x123456", 1).await;
    mock.mock_result(
        "eth_getBlockByNumber",
        &json!({"number": "0x1", "hash": "0xabc"}),
        1,
    )
    .await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    let payload = json!([
        {"jsonrpc": "2.0", "method": "eth_blockNumber", "id": 1},
        {"jsonrpc": "2.0", "method": "eth_getBlockByNumber", "params": ["0x1", false], "id": 2},
    ]);

    let result = engine.process_value(payload).await;
    let responses = result.as_array().expect("array response");
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["result"], json!("0x123456"));
    assert_eq!(responses[1]["result"]["number"], json!("0x1"));
    assert_eq!(responses[0]["cached"], json!(false));
    assert_eq!(responses[1]["cached"], json!(false));
    mock.assert_all().await;
}

#[tokio::test]
async fn test_stale_hit_serves_immediately_and_revalidates() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number("0xfresh0", 1).await;
    let config = ProxyConfig { stale_while_revalidate: true, ..test_config(&mock.url()) };
    let (engine, store) = build_engine(&config);

    // Fresh entry expired; only the stale sibling remains.
    let fp = fingerprint("eth_blockNumber", None);
    store.set(&stale_key(&fp), &json!("0xstale"), None).await.expect("seed");

    let response = engine.process_request(request("eth_blockNumber", None, 1)).await;
    assert_eq!(response.result.expect("result"), json!("0xstale"));
    assert_eq!(response.cached, Some(true));

    // The detached refresh fills the positive shard.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.get(&fp).await.expect("read"), Some(json!("0xfresh0")));
    mock.assert_all().await;
    assert_eq!(engine.metrics().snapshot().stale_served, 1);
}

#[tokio::test]
async fn test_negative_cache_suppresses_retry_storm() {
    let mut mock = RpcMockBuilder::new().await;
    // A single upstream failure; the second client request must not produce
    // a second upstream call.
    mock.mock_http_error(503, 1).await;
    let config = ProxyConfig { negative_caching: true, ..test_config(&mock.url()) };
    let (engine, _store) = build_engine(&config);

    let first = engine.process_request(request("eth_chainId", None, 1)).await;
    assert_eq!(first.error.as_ref().expect("error").code, -32603);

    let second = engine.process_request(request("eth_chainId", None, 2)).await;
    let error = second.error.expect("error");
    assert_eq!(error.code, -32603);
    let data = error.data.expect("data");
    assert_eq!(data["cached"], json!(true));
    assert!(data["timestamp"].is_i64());

    mock.assert_all().await;
    assert_eq!(engine.metrics().snapshot().negative_cache_hits, 1);
}

#[tokio::test]
async fn test_negative_entry_never_shadows_fresh_positive() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number("0x2", 0).await;
    let config = ProxyConfig { negative_caching: true, ..test_config(&mock.url()) };
    let (engine, store) = build_engine(&config);

    // Both shards populated: the positive entry wins because the pipeline
    // consults the negative shard only for errors recorded under the
    // negative namespace, and a fresh positive is checked before fetching.
    let fp = fingerprint("eth_blockNumber", None);
    store.set(&fp, &json!("0x2"), None).await.expect("seed");

    let response = engine.process_request(request("eth_blockNumber", None, 1)).await;
    assert_eq!(response.result.expect("result"), json!("0x2"));
    assert_eq!(response.cached, Some(true));
}

#[tokio::test]
async fn test_rpc_error_surfaces_with_upstream_message() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_rpc_error("eth_call", -32000, "execution reverted", 1).await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    let response = engine
        .process_request(request("eth_call", Some(json!([{}, "latest"])), 1))
        .await;
    let error = response.error.expect("error");
    assert_eq!(error.code, -32603);
    assert_eq!(error.message, "Internal error");
    assert!(error
        .data
        .expect("data")
        .as_str()
        .expect("string data")
        .contains("execution reverted"));
    mock.assert_all().await;
}

#[tokio::test]
async fn test_flush_behaves_like_cold_start() {
    let mut mock = RpcMockBuilder::new().await;
    // Two upstream calls: one before the flush, one after.
    mock.mock_block_number("0x5", 2).await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    let warm = engine.process_request(request("eth_blockNumber", None, 1)).await;
    assert_eq!(warm.cached, Some(false));

    engine.flush_all().await.expect("flush");
    assert_eq!(engine.metrics().snapshot().total_requests, 0);

    let cold = engine.process_request(request("eth_blockNumber", None, 2)).await;
    assert_eq!(cold.cached, Some(false));
    assert_eq!(cold.result.expect("result"), json!("0x5"));
    mock.assert_all().await;
}

#[tokio::test]
async fn test_invalid_jsonrpc_version_rejected_without_upstream() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_block_number("0x1", 0).await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    let result = engine
        .process_value(json!({"jsonrpc": "1.0", "method": "eth_blockNumber", "id": 1}))
        .await;
    assert_eq!(result["error"]["code"], json!(-32600));
    mock.assert_all().await;
}

#[tokio::test]
async fn test_distinct_fingerprints_do_not_coalesce() {
    let mut mock = RpcMockBuilder::new().await;
    mock.mock_result("eth_getBalance", &json!("0x10"), 2).await;
    let (engine, _store) = build_engine(&test_config(&mock.url()));

    // Same method, different params: two distinct fingerprints, two fetches.
    let a = engine
        .process_request(request("eth_getBalance", Some(json!(["0xaa", "latest"])), 1))
        .await;
    let b = engine
        .process_request(request("eth_getBalance", Some(json!(["0xbb", "latest"])), 2))
        .await;
    assert_eq!(a.cached, Some(false));
    assert_eq!(b.cached, Some(false));
    mock.assert_all().await;
}
