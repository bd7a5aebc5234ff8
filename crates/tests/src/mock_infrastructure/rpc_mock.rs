//! RPC mock builder for Ethereum JSON-RPC testing.
//!
//! Wraps mockito to provide method-matched response builders with hit-count
//! expectations.

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};
use std::time::Duration;

/// Builder for mock Ethereum RPC upstreams.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

impl RpcMockBuilder {
    /// Creates a new builder with a fresh mockito server.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    /// URL of the mock server.
    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    fn method_matcher(method: &str) -> Matcher {
        Matcher::Regex(format!(r#""method":"{method}""#))
    }

    /// Mocks `method` to return `result`, expecting exactly `hits` upstream
    /// calls.
    pub async fn mock_result(&mut self, method: &str, result: &Value, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Self::method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string())
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Mocks `eth_blockNumber` returning the given hex string.
    pub async fn mock_block_number(&mut self, hex: &str, hits: usize) -> &mut Self {
        self.mock_result("eth_blockNumber", &json!(hex), hits).await
    }

    /// Mocks `method` with a response delayed by `delay`, for exercising the
    /// coalescer window.
    pub async fn mock_slow_result(
        &mut self,
        method: &str,
        result: &Value,
        delay: Duration,
        hits: usize,
    ) -> &mut Self {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string();
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Self::method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_chunked_body(move |writer| {
                std::thread::sleep(delay);
                writer.write_all(body.as_bytes())
            })
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Mocks `method` to return a JSON-RPC error body.
    pub async fn mock_rpc_error(
        &mut self,
        method: &str,
        code: i32,
        message: &str,
        hits: usize,
    ) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Self::method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": code, "message": message}
                })
                .to_string(),
            )
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Mocks any request to fail with an HTTP status.
    pub async fn mock_http_error(&mut self, status: usize, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .with_status(status)
            .with_body("upstream unavailable")
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Asserts every registered expectation.
    pub async fn assert_all(&self) {
        for mock in &self.mocks {
            mock.assert_async().await;
        }
    }
}
