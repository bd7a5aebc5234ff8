//! Upstream error taxonomy.
//!
//! The failover loop keys off this classification: only transient network
//! errors (timeouts, aborted connections) retry the same URL; RPC-level
//! errors, HTTP status errors, and connection-refused/DNS failures move on to
//! the next candidate immediately.

use thiserror::Error;

/// Errors that can occur when calling upstream RPC providers.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Request exceeded the configured timeout.
    #[error("request timeout")]
    Timeout,

    /// TCP connect refused or host not found; the endpoint is down, not slow.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Other network-level failure (aborted transfer, reset, decode).
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx HTTP status from the upstream.
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// The upstream returned a JSON-RPC error body.
    #[error("RPC error {code}: {message}")]
    RpcError { code: i32, message: String },

    /// Response was not parseable as a JSON-RPC reply.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Every configured endpoint was exhausted.
    #[error("all endpoints failed: {0}")]
    AllEndpointsFailed(String),
}

impl UpstreamError {
    /// Classifies a `reqwest` transport error.
    ///
    /// Error text from the HTTP stack can leak resolved addresses, so it is
    /// reduced to a stable category string.
    #[must_use]
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::ConnectionRefused("connection refused or unreachable".to_string())
        } else if error.is_body() || error.is_decode() {
            Self::Network("response body error".to_string())
        } else if error.is_request() {
            Self::Network("request aborted".to_string())
        } else {
            Self::Network("network error".to_string())
        }
    }

    /// Whether the same URL may be retried for this error.
    ///
    /// Timeouts and aborted transfers are worth retrying in place; everything
    /// else either indicates a down endpoint (refused, DNS) or a response the
    /// endpoint actively produced (RPC error, HTTP status), where retrying
    /// the same URL cannot help.
    #[must_use]
    pub fn is_retryable_same_url(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }

    /// Whether this error should count against endpoint health.
    ///
    /// RPC-level error bodies are live, well-formed replies; the endpoint is
    /// up even when the method call failed.
    #[must_use]
    pub fn penalizes_endpoint(&self) -> bool {
        !matches!(self, Self::RpcError { .. })
    }
}
