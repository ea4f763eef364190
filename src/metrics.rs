//! Executor metrics.
//!
//! Metrics are recorded through the [`metrics`] facade, no exporter is installed by the library.
use alloy::primitives::ChainId;
use metrics::{Counter, Histogram};
use metrics_derive::Metrics;

/// Metrics of transactions driven to completion on a single chain.
#[derive(Metrics, Clone)]
#[metrics(scope = "executor")]
pub struct ExecutorMetrics {
    /// Number of submitted transactions, replacements included.
    pub submitted: Counter,
    /// Number of included transactions that succeeded.
    pub included: Counter,
    /// Number of included transactions that reverted.
    pub reverted: Counter,
    /// Number of transactions whose nonce was taken by another transaction.
    pub dropped: Counter,
    /// Number of transactions rejected by the node.
    pub rejected: Counter,
    /// Number of transactions that were not included after all fee bumps.
    pub timeouts: Counter,
    /// Number of fee bumps.
    pub fee_bumps: Counter,
    /// Time from first submission to inclusion, in milliseconds.
    pub confirmation_time: Histogram,
}

impl ExecutorMetrics {
    /// Metrics labelled with the given chain.
    pub fn for_chain(chain_id: ChainId) -> Self {
        Self::new_with_labels(&[("chain_id", chain_id.to_string())])
    }
}

/// Metrics of the [`ClientCache`](crate::cache::ClientCache).
#[derive(Metrics, Clone)]
#[metrics(scope = "client_cache")]
pub struct ClientCacheMetrics {
    /// Number of clients constructed.
    pub constructed: Counter,
    /// Number of failed constructions.
    pub construction_failed: Counter,
    /// Number of evicted clients.
    pub invalidated: Counter,
}

/// Metrics of the transports of a single chain.
#[derive(Metrics, Clone)]
#[metrics(scope = "transport")]
pub struct TransportMetrics {
    /// Number of times the active endpoint changed.
    pub failovers: Counter,
    /// Number of requests that timed out.
    pub request_timeouts: Counter,
}

impl TransportMetrics {
    /// Metrics labelled with the given chain.
    pub fn for_chain(chain_id: ChainId) -> Self {
        Self::new_with_labels(&[("chain_id", chain_id.to_string())])
    }
}
