//! Shared parsing and formatting helpers.

pub mod block_param;
pub mod sanitize;

pub use block_param::{BlockParameter, BlockRef, BlockTag};
pub use sanitize::sanitize_url;
