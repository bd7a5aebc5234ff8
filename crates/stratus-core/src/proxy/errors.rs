//! Pipeline-level errors.
//!
//! The resolution pipeline itself never propagates errors to the HTTP layer;
//! every request resolves to a well-formed JSON-RPC response. This type
//! covers the management operations (flush, startup wiring) the server calls
//! outside the request path.

use crate::{cache::CacheError, upstream::UpstreamError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
