//! Centralized block parameter parsing.
//!
//! Provides consistent parsing for block numbers and block tags across the
//! method policy, eliminating duplicate hex parsing logic. Parsing is
//! deliberately tolerant: decimal strings, `0x`-prefixed hex strings, and tag
//! strings are all accepted, matching what upstream nodes accept.

use thiserror::Error;

/// Error types for block parameter parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
}

/// Block reference types supported by Ethereum JSON-RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    /// Specific block number.
    Number(u64),
    /// Block tag (latest, earliest, etc.).
    Tag(BlockTag),
}

/// Standard Ethereum block tags.
///
/// `pending` is kept distinct from `latest` because the caching policy prices
/// them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// The most recent block in the canonical chain.
    Latest,
    /// The earliest/genesis block.
    Earliest,
    /// A block in the pending state.
    Pending,
    /// The most recent safe head block.
    Safe,
    /// The most recent finalized block.
    Finalized,
}

impl TryFrom<&str> for BlockRef {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        BlockParameter::parse(value)
    }
}

/// Centralized block parameter parsing.
pub struct BlockParameter;

impl BlockParameter {
    /// Parse a block parameter from a string (JSON-RPC request parameter).
    ///
    /// Handles hex strings with a `0x` prefix, decimal strings, and the
    /// standard tag strings.
    ///
    /// # Errors
    /// Returns `ParseError` if the input is not a valid block parameter.
    pub fn parse(param: &str) -> Result<BlockRef, ParseError> {
        match param {
            "latest" => Ok(BlockRef::Tag(BlockTag::Latest)),
            "pending" => Ok(BlockRef::Tag(BlockTag::Pending)),
            "earliest" => Ok(BlockRef::Tag(BlockTag::Earliest)),
            "safe" => Ok(BlockRef::Tag(BlockTag::Safe)),
            "finalized" => Ok(BlockRef::Tag(BlockTag::Finalized)),
            s => {
                if let Some(hex_str) = s.strip_prefix("0x") {
                    u64::from_str_radix(hex_str, 16)
                        .map(BlockRef::Number)
                        .map_err(|_| ParseError::InvalidHex(s.to_string()))
                } else {
                    s.parse::<u64>()
                        .map(BlockRef::Number)
                        .map_err(|_| ParseError::InvalidNumber(s.to_string()))
                }
            }
        }
    }

    /// Parse a block parameter and return only the block number if it is a
    /// specific number. Tags return `None`.
    #[must_use]
    pub fn parse_number(param: &str) -> Option<u64> {
        match Self::parse(param) {
            Ok(BlockRef::Number(n)) => Some(n),
            _ => None,
        }
    }

    /// Extract a block reference from a JSON value.
    ///
    /// Accepts strings (hex, decimal, tags) and plain JSON numbers.
    #[must_use]
    pub fn from_json_value(value: &serde_json::Value) -> Option<BlockRef> {
        match value {
            serde_json::Value::String(s) => Self::parse(s).ok(),
            serde_json::Value::Number(n) => n.as_u64().map(BlockRef::Number),
            _ => None,
        }
    }

    /// Returns `true` if the value looks like a 32-byte hash (`0x` + 64 hex
    /// digits). Hash-identified objects are immutable.
    #[must_use]
    pub fn is_hash(value: &serde_json::Value) -> bool {
        value.as_str().is_some_and(|s| {
            s.len() == 66 &&
                s.starts_with("0x") &&
                s[2..].bytes().all(|b| b.is_ascii_hexdigit())
        })
    }
}
