//! Multi-URL failover JSON-RPC client.
//!
//! Iterates the configured endpoints in order, skipping unhealthy ones unless
//! nothing else remains, retrying the same URL only for transient network
//! errors, and surfacing `all endpoints failed: <detail>` once every
//! candidate is exhausted.

use super::{
    endpoint::{UpstreamEndpoint, DEFAULT_RECOVERY_DELAY},
    errors::UpstreamError,
};
use crate::types::{JsonRpcError, JsonRpcRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Attempts per URL before moving to the next candidate.
    pub max_retries_per_url: u32,
    /// Socket-level timeout for a single HTTP request.
    pub request_timeout: Duration,
    /// Delay before an unhealthy endpoint is passively rechecked.
    pub recovery_delay: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            max_retries_per_url: 2,
            request_timeout: Duration::from_secs(30),
            recovery_delay: DEFAULT_RECOVERY_DELAY,
        }
    }
}

/// Minimal upstream reply shape; `id` is ignored because the client issues
/// its own request IDs.
#[derive(Debug, Deserialize)]
struct UpstreamReply {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC client over one or more upstream URLs with per-URL health.
pub struct RpcClient {
    endpoints: Vec<Arc<UpstreamEndpoint>>,
    http: reqwest::Client,
    config: RpcClientConfig,
}

impl RpcClient {
    /// Builds a client over `urls` in failover order.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::AllEndpointsFailed`] when `urls` is empty or
    /// the HTTP client cannot be built.
    pub fn new(urls: Vec<String>, config: RpcClientConfig) -> Result<Self, UpstreamError> {
        if urls.is_empty() {
            return Err(UpstreamError::AllEndpointsFailed(
                "no upstream URLs configured".to_string(),
            ));
        }

        let http = reqwest::ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.request_timeout)
            .use_rustls_tls()
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::AllEndpointsFailed(format!("http client build failed: {e}"))
            })?;

        let endpoints = urls.into_iter().map(|url| Arc::new(UpstreamEndpoint::new(url))).collect();

        Ok(Self { endpoints, http, config })
    }

    /// All endpoints, for health reporting.
    #[must_use]
    pub fn endpoints(&self) -> &[Arc<UpstreamEndpoint>] {
        &self.endpoints
    }

    /// Calls `method` against the upstreams, failing over as needed, and
    /// returns the reply's `result` value.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::AllEndpointsFailed`] carrying the last
    /// per-endpoint error once every candidate is exhausted.
    pub async fn call(
        &self,
        method: &str,
        params: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let mut last_error: Option<UpstreamError> = None;
        let total = self.endpoints.len();

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let is_last_candidate = index + 1 == total;
            // Never leave all URLs unreachable purely due to health flags.
            if !endpoint.is_healthy() && !is_last_candidate {
                tracing::debug!(url = %endpoint.display_url(), "skipping unhealthy upstream");
                continue;
            }

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.call_endpoint(endpoint, method, params).await {
                    Ok(result) => {
                        endpoint.record_success();
                        if index > 0 {
                            tracing::info!(
                                url = %endpoint.display_url(),
                                method,
                                "request served by fallback upstream"
                            );
                        }
                        return Ok(result);
                    }
                    Err(e @ UpstreamError::RpcError { .. }) => {
                        // An RPC error body is a live, well-formed reply: the
                        // method call failed, not the endpoint. Other URLs
                        // would answer the same, so surface it directly.
                        endpoint.record_success();
                        return Err(e);
                    }
                    Err(e) => {
                        let became_unhealthy = endpoint.record_failure(&e.to_string());
                        if became_unhealthy {
                            endpoint.schedule_recheck(self.config.recovery_delay);
                        }
                        let retry_same_url = e.is_retryable_same_url() &&
                            attempt < self.config.max_retries_per_url;
                        tracing::debug!(
                            url = %endpoint.display_url(),
                            method,
                            attempt,
                            error = %e,
                            retry_same_url,
                            "upstream attempt failed"
                        );
                        last_error = Some(e);
                        if !retry_same_url {
                            break;
                        }
                    }
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no eligible upstream endpoints".to_string());
        Err(UpstreamError::AllEndpointsFailed(detail))
    }

    /// Single attempt against a single endpoint with full error
    /// classification.
    async fn call_endpoint(
        &self,
        endpoint: &UpstreamEndpoint,
        method: &str,
        params: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let request = JsonRpcRequest::new(method, params.cloned(), json!(1));

        let response = self
            .http
            .post(endpoint.url())
            .json(&request)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let truncated =
                if body.len() > 256 { format!("{}...", &body[..256]) } else { body };
            return Err(UpstreamError::HttpError(status.as_u16(), truncated));
        }

        let reply: UpstreamReply = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(format!("malformed JSON-RPC reply: {e}")))?;

        if let Some(error) = reply.error {
            return Err(UpstreamError::RpcError { code: error.code, message: error.message });
        }

        reply.result.ok_or_else(|| {
            UpstreamError::InvalidResponse("reply carried neither result nor error".to_string())
        })
    }
}
