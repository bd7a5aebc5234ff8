//! Core type definitions for the JSON-RPC 2.0 protocol surface.
//!
//! # Type Categories
//!
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: protocol
//!   conformance types shared by the HTTP layer, the pipeline, and the
//!   upstream client.
//! - `cached` extension: every successful response carries a `cached` flag
//!   indicating whether it was served entirely from cache without triggering
//!   an upstream fetch. Waiters that rode a live coalesced fetch are part of
//!   that fetch and therefore report `cached: false`.
//!
//! # Performance Notes
//!
//! - `jsonrpc` uses `Cow<'static, str>` so responses constructed by the proxy
//!   never allocate for the version tag.
//! - `id` uses `Arc<serde_json::Value>` so the request ID can be echoed into
//!   responses (including error responses) without deep-copying JSON.

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, sync::Arc};

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version tag.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Standard JSON-RPC 2.0 error codes used by the proxy.
pub mod error_codes {
    /// Malformed JSON payload.
    pub const PARSE_ERROR: i32 = -32700;
    /// Request object fails JSON-RPC 2.0 shape validation.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Reserved; the proxy itself never returns this, upstream method errors
    /// surface as [`INTERNAL_ERROR`].
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Upstream failure, breaker rejection, or coalescer timeout.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC 2.0 request structure.
///
/// The `jsonrpc` field is deserialised permissively (any string) and checked
/// by [`JsonRpcRequest::validate`] so that a bad version yields a proper
/// `-32600` response rather than a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default = "default_id")]
    pub id: Arc<serde_json::Value>,
}

fn default_id() -> Arc<serde_json::Value> {
    Arc::new(serde_json::Value::Null)
}

impl JsonRpcRequest {
    /// Creates a new request with zero allocation for the version string.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id: Arc::new(id) }
    }

    /// Validates the JSON-RPC 2.0 envelope.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the violation; the caller maps
    /// it to error code `-32600`.
    pub fn validate(&self) -> Result<(), String> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported jsonrpc version: {:?}", self.jsonrpc));
        }
        if self.method.is_empty() {
            return Err("method must not be empty".to_string());
        }
        Ok(())
    }
}

/// JSON-RPC 2.0 response structure.
///
/// Contains either `result` or `error`, never both. The `cached` extension is
/// attached to successful responses only and is skipped during serialisation
/// when unset (e.g. on error responses).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Arc<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

impl JsonRpcResponse {
    /// Creates a successful response, tagging how it was served.
    #[must_use]
    pub fn success(result: serde_json::Value, id: Arc<serde_json::Value>, cached: bool) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: Some(result),
            error: None,
            id,
            cached: Some(cached),
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(code: i32, message: impl Into<String>, id: Arc<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
            cached: None,
        }
    }

    /// Creates an error response carrying additional `data`.
    #[must_use]
    pub fn error_with_data(
        code: i32,
        message: impl Into<String>,
        data: serde_json::Value,
        id: Arc<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: Some(data) }),
            id,
            cached: None,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
