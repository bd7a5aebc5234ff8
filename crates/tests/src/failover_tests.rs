//! Multi-URL failover through the full pipeline.

use crate::mock_infrastructure::{build_engine, RpcMockBuilder};
use serde_json::json;
use std::time::Duration;
use stratus_core::{
    config::ProxyConfig,
    types::JsonRpcRequest,
    upstream::{RpcClient, RpcClientConfig},
};

fn two_url_config(first: &str, second: &str) -> ProxyConfig {
    ProxyConfig {
        upstream_rpc_url: format!("{first},{second}"),
        circuit_timeout: 2_000,
        ..ProxyConfig::default()
    }
}

#[tokio::test]
async fn test_broken_primary_fails_over_to_working_fallback() {
    let mut working = RpcMockBuilder::new().await;
    working.mock_block_number("0xabc", 1).await;

    // Port 9 (discard) refuses TCP connections.
    let config = two_url_config("http://127.0.0.1:9", &working.url());
    let (engine, _store) = build_engine(&config);

    let response = engine
        .process_request(JsonRpcRequest::new("eth_blockNumber", None, json!(1)))
        .await;
    assert_eq!(response.result.expect("result"), json!("0xabc"));
    working.assert_all().await;

    let providers = engine.endpoints_snapshot();
    assert_eq!(providers.len(), 2);
    assert_eq!(providers[0].failure_count, 1);
    assert_eq!(providers[0].success_count, 0);
    assert_eq!(providers[1].failure_count, 0);
    assert_eq!(providers[1].success_count, 1);
}

#[tokio::test]
async fn test_all_endpoints_failed_surfaces_detail() {
    let config = two_url_config("http://127.0.0.1:9", "http://127.0.0.1:9");
    let (engine, _store) = build_engine(&config);

    let response = engine
        .process_request(JsonRpcRequest::new("eth_blockNumber", None, json!(1)))
        .await;
    let error = response.error.expect("error");
    assert_eq!(error.code, -32603);
    let data = error.data.expect("data");
    assert!(data.as_str().expect("string").contains("all endpoints failed"), "{data}");
}

#[tokio::test]
async fn test_attempt_budget_is_bounded_per_url() {
    // Both URLs answer 500; HTTP errors are not retried on the same URL, so
    // with two URLs the call makes exactly two attempts.
    let mut first = RpcMockBuilder::new().await;
    first.mock_http_error(500, 1).await;
    let mut second = RpcMockBuilder::new().await;
    second.mock_http_error(500, 1).await;

    let client = RpcClient::new(
        vec![first.url(), second.url()],
        RpcClientConfig {
            max_retries_per_url: 2,
            request_timeout: Duration::from_secs(2),
            recovery_delay: Duration::from_secs(60),
        },
    )
    .expect("client");

    let err = client.call("eth_blockNumber", None).await.expect_err("should fail");
    assert!(err.to_string().contains("all endpoints failed"));
    first.assert_all().await;
    second.assert_all().await;
}

#[tokio::test]
async fn test_unhealthy_primary_is_skipped_until_recheck() {
    let mut working = RpcMockBuilder::new().await;
    working.mock_result("eth_getBalance", &json!("0x1"), 4).await;

    let config = two_url_config("http://127.0.0.1:9", &working.url());
    let (engine, _store) = build_engine(&config);

    // Three failures mark the primary unhealthy.
    for i in 0..3 {
        engine
            .process_request(JsonRpcRequest::new(
                "eth_getBalance",
                Some(json!([format!("0x{i}"), "latest"])),
                json!(i),
            ))
            .await;
    }
    let providers = engine.endpoints_snapshot();
    assert!(!providers[0].healthy);
    assert_eq!(providers[0].failure_count, 3);

    // The next request goes straight to the fallback: the primary's failure
    // count stays put.
    engine
        .process_request(JsonRpcRequest::new(
            "eth_getBalance",
            Some(json!(["0xffff", "latest"])),
            json!(9),
        ))
        .await;
    assert_eq!(engine.endpoints_snapshot()[0].failure_count, 3);
    working.assert_all().await;
}
