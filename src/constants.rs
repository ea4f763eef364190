//! Executor constants.

use std::time::Duration;

/// Default percentage applied to the latest base fee when computing `maxFeePerGas`.
///
/// `200` means the transaction tolerates the base fee doubling between estimation and inclusion.
pub const DEFAULT_BASE_FEE_MULTIPLIER_PERCENT: u64 = 200;

/// Default safety margin added on top of `eth_estimateGas`, in percent.
pub const DEFAULT_GAS_MARGIN_PERCENT: u64 = 20;

/// Minimum fee bump accepted by transaction pools for a same-nonce replacement, in percent.
///
/// Ref <https://github.com/paradigmxyz/reth/blob/b312799e081259a2fbdfa91fb6b43f384625bbe2/crates/transaction-pool/src/config.rs#L23-L24>
pub const MIN_BUMP_RATIO_PERCENT: u64 = 110;

/// Default number of fee bumps before giving up on a transaction.
pub const DEFAULT_MAX_BUMPS: u32 = 3;

/// Default interval between receipt polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default time a transaction is given to be included before its fees are bumped.
pub const DEFAULT_INCLUSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout of a single RPC request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for establishing a connection to an endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default backoff before the single retry of a failed estimation query.
pub const DEFAULT_ESTIMATION_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Number of consecutive [`ChainUnavailable`](crate::error::ExecutionError::ChainUnavailable)
/// failures after which a cached client is evicted.
pub const DEFAULT_UNAVAILABLE_FAILURE_BUDGET: u32 = 3;

/// Gas added to the sum of explicit per-call gas overrides to cover the wallet's `execute`
/// dispatch.
pub const DEFAULT_EXECUTION_OVERHEAD: u64 = 50_000;
