//! Per-method caching policy.
//!
//! Classifies Ethereum JSON-RPC methods into cache categories, computes the
//! TTL for a concrete `(method, params)` pair, and derives the request
//! fingerprint used as the cache, coalescing, and lock key.
//!
//! The whole module is a pure function of its inputs: `(method, params)` maps
//! deterministically to `(category, ttl, fingerprint)`. Tests rely on that.

use crate::{
    config::ProxyConfig,
    utils::block_param::{BlockParameter, BlockRef, BlockTag},
};
use serde_json::Value;
use std::time::Duration;

/// Cache categories for RPC methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    /// Hash-addressed chain history; immutable once confirmed.
    Immutable,
    /// Block-level queries keyed by number or tag.
    Blocks,
    /// Account balances, nonces, storage, and code.
    AccountState,
    /// Gas and fee oracles.
    Gas,
    /// Log queries with block ranges.
    Logs,
    /// Chain/network identity and status.
    Network,
    /// Contract execution against a state root.
    Call,
    /// Mining status methods.
    Mining,
    /// Merkle proofs.
    Proofs,
    /// Signing, sending, filter-management, submission, txpool.
    NeverCache,
    /// Anything unrecognised; cached briefly and permissively.
    Unknown,
}

/// Computed TTL for a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// Do not cache.
    Skip,
    /// Cache for a bounded number of seconds.
    Seconds(u64),
    /// Cache without expiry.
    Permanent,
}

impl CacheTtl {
    /// Whether the method's result may be stored at all.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, CacheTtl::Skip)
    }

    /// Store-layer expiry: `None` means permanent.
    ///
    /// Only meaningful when [`is_cacheable`](Self::is_cacheable) is true.
    #[must_use]
    pub fn as_expiry(&self) -> Option<Duration> {
        match self {
            CacheTtl::Seconds(secs) => Some(Duration::from_secs(*secs)),
            CacheTtl::Skip | CacheTtl::Permanent => None,
        }
    }
}

/// Computes the request fingerprint: `method + ":" + compact JSON params`.
///
/// Canonicalisation is byte-stable: array order is preserved, numbers and hex
/// strings are kept verbatim. The same stringification drives the cache, the
/// coalescer, and the distributed lock, so the layers agree exactly.
#[must_use]
pub fn fingerprint(method: &str, params: Option<&Value>) -> String {
    static EMPTY_PARAMS: Value = Value::Array(vec![]);
    let params = params.unwrap_or(&EMPTY_PARAMS);
    let rendered = serde_json::to_string(params).unwrap_or_else(|_| "[]".to_string());
    format!("{method}:{rendered}")
}

/// TTL policy parameterised by the operator's block-height and TTL settings.
#[derive(Debug, Clone)]
pub struct MethodPolicy {
    /// Block height at or below which chain data never changes.
    permanent_height: u64,
    /// TTL for `latest`-tagged data, seconds.
    latest_ttl: u64,
    /// TTL for recent (post-permanent) block data, seconds.
    recent_block_ttl: u64,
    /// TTL for `eth_call` against `latest`, seconds.
    eth_call_ttl: u64,
}

const PENDING_TTL: u64 = 1;
const EARLIEST_TTL: u64 = 3_600;
const ACCOUNT_STATE_TTL: u64 = 15;
const HISTORICAL_RECENT_TTL: u64 = 300;
const CODE_TTL: u64 = 300;
const GAS_TTL: u64 = 5;
const FEE_HISTORY_HISTORICAL_TTL: u64 = 3_600;
const LOGS_TTL: u64 = 10;
const CHAIN_IDENTITY_TTL: u64 = 3_600;
const SYNCING_TTL: u64 = 30;
const NETWORK_TTL: u64 = 300;
const ACCESS_LIST_TTL: u64 = 60;
const MINING_TTL: u64 = 10;
const PROOF_TTL: u64 = 60;
const UNKNOWN_TTL: u64 = 10;

impl MethodPolicy {
    /// Builds the policy from proxy configuration.
    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            permanent_height: config.permanent_cache_height,
            latest_ttl: config.latest_block_ttl,
            recent_block_ttl: config.recent_block_ttl,
            eth_call_ttl: config.eth_call_ttl,
        }
    }

    /// Classifies an RPC method name into its cache category.
    #[must_use]
    pub fn classify(method: &str) -> CacheCategory {
        if Self::is_never_cache(method) {
            return CacheCategory::NeverCache;
        }

        match method {
            "eth_getTransactionByHash" |
            "eth_getTransactionReceipt" |
            "eth_getBlockByHash" |
            "eth_getTransactionByBlockHashAndIndex" |
            "eth_getTransactionByBlockNumberAndIndex" |
            "eth_getUncleByBlockHashAndIndex" |
            "eth_getUncleByBlockNumberAndIndex" => CacheCategory::Immutable,

            "eth_blockNumber" |
            "eth_getBlockByNumber" |
            "eth_getBlockTransactionCountByNumber" |
            "eth_getBlockTransactionCountByHash" |
            "eth_getUncleCountByBlockNumber" |
            "eth_getUncleCountByBlockHash" => CacheCategory::Blocks,

            "eth_getBalance" | "eth_getTransactionCount" | "eth_getStorageAt" | "eth_getCode" => {
                CacheCategory::AccountState
            }

            "eth_gasPrice" | "eth_estimateGas" | "eth_maxPriorityFeePerGas" | "eth_feeHistory" => {
                CacheCategory::Gas
            }

            "eth_getLogs" | "eth_getFilterLogs" => CacheCategory::Logs,

            "eth_chainId" | "net_version" | "net_listening" | "net_peerCount" |
            "web3_clientVersion" | "eth_protocolVersion" | "eth_syncing" => CacheCategory::Network,

            "eth_call" | "eth_createAccessList" => CacheCategory::Call,

            "eth_mining" | "eth_hashrate" | "eth_getWork" => CacheCategory::Mining,

            "eth_getProof" => CacheCategory::Proofs,

            _ => CacheCategory::Unknown,
        }
    }

    /// Signing, sending, filter-management, submission, and txpool methods
    /// must never be cached.
    fn is_never_cache(method: &str) -> bool {
        if method.starts_with("eth_sign") ||
            method.starts_with("eth_send") ||
            method.starts_with("eth_submit") ||
            method.starts_with("personal_") ||
            method.starts_with("txpool_")
        {
            return true;
        }
        matches!(
            method,
            "eth_newFilter" |
                "eth_newBlockFilter" |
                "eth_newPendingTransactionFilter" |
                "eth_uninstallFilter" |
                "eth_getFilterChanges" |
                "eth_accounts" |
                "eth_coinbase"
        )
    }

    /// Computes the TTL for a `(method, params)` pair.
    #[must_use]
    pub fn ttl(&self, method: &str, params: Option<&Value>) -> CacheTtl {
        match Self::classify(method) {
            CacheCategory::NeverCache => CacheTtl::Skip,
            CacheCategory::Immutable => CacheTtl::Permanent,
            CacheCategory::Blocks => self.block_ttl(method, params),
            CacheCategory::AccountState => self.account_state_ttl(method, params),
            CacheCategory::Gas => Self::gas_ttl(method, params),
            CacheCategory::Logs => self.logs_ttl(params),
            CacheCategory::Network => Self::network_ttl(method),
            CacheCategory::Call => self.call_ttl(method, params),
            CacheCategory::Mining => CacheTtl::Seconds(MINING_TTL),
            CacheCategory::Proofs => self.proof_ttl(params),
            CacheCategory::Unknown => CacheTtl::Seconds(UNKNOWN_TTL),
        }
    }

    fn param_at(params: Option<&Value>, index: usize) -> Option<&Value> {
        params.and_then(Value::as_array).and_then(|arr| arr.get(index))
    }

    /// TTL for a block reference: permanent below the cut-off height,
    /// short-lived otherwise.
    fn block_ref_ttl(&self, block: BlockRef) -> CacheTtl {
        match block {
            BlockRef::Number(n) if n <= self.permanent_height => CacheTtl::Permanent,
            BlockRef::Number(_) => CacheTtl::Seconds(self.recent_block_ttl),
            BlockRef::Tag(BlockTag::Pending) => CacheTtl::Seconds(PENDING_TTL),
            BlockRef::Tag(BlockTag::Earliest) => CacheTtl::Seconds(EARLIEST_TTL),
            BlockRef::Tag(BlockTag::Latest | BlockTag::Safe | BlockTag::Finalized) => {
                CacheTtl::Seconds(self.latest_ttl)
            }
        }
    }

    fn block_ttl(&self, method: &str, params: Option<&Value>) -> CacheTtl {
        if method == "eth_blockNumber" {
            return CacheTtl::Seconds(self.latest_ttl);
        }

        let Some(param) = Self::param_at(params, 0) else {
            // Missing block parameter defaults to "latest" upstream.
            return CacheTtl::Seconds(self.latest_ttl);
        };

        // The *ByHash count methods identify an immutable block.
        if BlockParameter::is_hash(param) {
            return CacheTtl::Permanent;
        }

        match BlockParameter::from_json_value(param) {
            Some(block) => self.block_ref_ttl(block),
            None => CacheTtl::Seconds(self.latest_ttl),
        }
    }

    fn account_state_ttl(&self, method: &str, params: Option<&Value>) -> CacheTtl {
        if method == "eth_getCode" {
            return CacheTtl::Seconds(CODE_TTL);
        }

        let block_index = if method == "eth_getStorageAt" { 2 } else { 1 };
        match Self::param_at(params, block_index).and_then(BlockParameter::from_json_value) {
            Some(BlockRef::Number(n)) if n <= self.permanent_height => CacheTtl::Permanent,
            Some(BlockRef::Number(_)) => CacheTtl::Seconds(HISTORICAL_RECENT_TTL),
            _ => CacheTtl::Seconds(ACCOUNT_STATE_TTL),
        }
    }

    fn gas_ttl(method: &str, params: Option<&Value>) -> CacheTtl {
        if method == "eth_feeHistory" {
            // params: [blockCount, newestBlock, rewardPercentiles]
            if let Some(BlockRef::Number(_)) =
                Self::param_at(params, 1).and_then(BlockParameter::from_json_value)
            {
                return CacheTtl::Seconds(FEE_HISTORY_HISTORICAL_TTL);
            }
        }
        CacheTtl::Seconds(GAS_TTL)
    }

    fn logs_ttl(&self, params: Option<&Value>) -> CacheTtl {
        let filter = Self::param_at(params, 0).and_then(Value::as_object);
        let Some(filter) = filter else {
            return CacheTtl::Seconds(LOGS_TTL);
        };

        let from = filter.get("fromBlock").and_then(BlockParameter::from_json_value);
        let to = filter.get("toBlock").and_then(BlockParameter::from_json_value);

        match (from, to) {
            (Some(BlockRef::Number(_)), Some(BlockRef::Number(to))) => {
                if to <= self.permanent_height {
                    CacheTtl::Permanent
                } else {
                    CacheTtl::Seconds(HISTORICAL_RECENT_TTL)
                }
            }
            _ => CacheTtl::Seconds(LOGS_TTL),
        }
    }

    fn network_ttl(method: &str) -> CacheTtl {
        match method {
            "eth_chainId" | "net_version" => CacheTtl::Seconds(CHAIN_IDENTITY_TTL),
            "eth_syncing" => CacheTtl::Seconds(SYNCING_TTL),
            _ => CacheTtl::Seconds(NETWORK_TTL),
        }
    }

    fn call_ttl(&self, method: &str, params: Option<&Value>) -> CacheTtl {
        if method == "eth_createAccessList" {
            return CacheTtl::Seconds(ACCESS_LIST_TTL);
        }

        match Self::param_at(params, 1).and_then(BlockParameter::from_json_value) {
            Some(BlockRef::Number(n)) if n <= self.permanent_height => CacheTtl::Permanent,
            Some(BlockRef::Number(_)) => CacheTtl::Seconds(HISTORICAL_RECENT_TTL),
            _ => CacheTtl::Seconds(self.eth_call_ttl),
        }
    }

    fn proof_ttl(&self, params: Option<&Value>) -> CacheTtl {
        match Self::param_at(params, 2).and_then(BlockParameter::from_json_value) {
            Some(BlockRef::Number(n)) if n <= self.permanent_height => CacheTtl::Permanent,
            _ => CacheTtl::Seconds(PROOF_TTL),
        }
    }
}
