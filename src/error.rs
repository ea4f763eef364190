//! Executor error types.
//!
//! Every failure surfaced by the [`Executor`](crate::executor::Executor) is an
//! [`ExecutionError`]. Raw transport errors are mapped at the boundary of the component that
//! observed them so that callers can branch on the kind of failure without inspecting RPC
//! payloads.
use crate::{chains::TransactionType, transport::error::TransportErrExt};
use alloy::{
    primitives::{B256, Bytes, ChainId},
    transports::{RpcError, TransportError},
};
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Why a node refused a raw transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The nonce was already used by a mined transaction.
    NonceTooLow,
    /// The sender (or the wallet, for pre-flight checks) cannot pay for the transaction.
    InsufficientFunds,
    /// The fees are below what the pool accepts, or too low to replace a pending transaction.
    Underpriced,
    /// Any other rejection.
    Other,
}

impl RejectionReason {
    /// Classifies a rejection from the error message returned by the node.
    pub fn classify(err: &TransportError) -> Self {
        if err.is_nonce_too_low() {
            Self::NonceTooLow
        } else if err.is_insufficient_funds() {
            Self::InsufficientFunds
        } else if err.is_underpriced() {
            Self::Underpriced
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonceTooLow => f.write_str("nonce too low"),
            Self::InsufficientFunds => f.write_str("insufficient funds"),
            Self::Underpriced => f.write_str("underpriced"),
            Self::Other => f.write_str("rejected"),
        }
    }
}

/// The error taxonomy of the executor.
///
/// Cheap to clone: a single failed client construction is delivered to every caller that waited
/// on it.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The chain is not configured.
    #[error("unknown chain {0}")]
    UnknownChain(ChainId),
    /// None of the chain's endpoints could serve the request.
    #[error("chain {chain_id} unavailable: {source}")]
    ChainUnavailable {
        /// Chain the request was made against.
        chain_id: ChainId,
        /// The last transport error observed.
        source: Arc<TransportError>,
    },
    /// A read-only estimation query failed twice.
    #[error("estimation failed on chain {chain_id}: {source}")]
    EstimationFailed {
        /// Chain the estimation was made against.
        chain_id: ChainId,
        /// The error returned by the node on the final attempt.
        source: Arc<TransportError>,
    },
    /// The draft requires a transaction type the chain does not support.
    #[error("{tx_type} transactions are not supported on chain {chain_id}")]
    UnsupportedTransactionType {
        /// Chain the draft targets.
        chain_id: ChainId,
        /// The required type.
        tx_type: TransactionType,
    },
    /// The requested calls cannot be executed as given.
    #[error("invalid calls for chain {chain_id}: {reason}")]
    InvalidCalls {
        /// Chain the calls target.
        chain_id: ChainId,
        /// What is wrong with them.
        reason: String,
    },
    /// The owner key could not sign the transaction.
    #[error("signing failed on chain {chain_id}: {source}")]
    SigningFailed {
        /// Chain of the transaction being signed.
        chain_id: ChainId,
        /// The signer error.
        source: Arc<alloy::signers::Error>,
    },
    /// The transaction was refused before it reached the pool.
    #[error("submission rejected on chain {chain_id} ({reason}): {message}")]
    SubmissionRejected {
        /// Chain the transaction was submitted to.
        chain_id: ChainId,
        /// Hash of the rejected transaction, if it was signed.
        tx_hash: Option<B256>,
        /// Classified reason.
        reason: RejectionReason,
        /// Message returned by the node.
        message: String,
    },
    /// The transaction was included but reverted.
    #[error("transaction {tx_hash} reverted on chain {chain_id}: {}", .reason.as_deref().unwrap_or("no reason"))]
    ExecutionReverted {
        /// Chain the transaction was included on.
        chain_id: ChainId,
        /// Hash of the included transaction.
        tx_hash: B256,
        /// Decoded `Error(string)` reason, if any.
        reason: Option<String>,
        /// Raw revert data, if the replay returned any.
        data: Option<Bytes>,
    },
    /// The transaction was not included in time, even after bumping its fees.
    ///
    /// The transaction may still land: `tx_hash` is the last hash submitted.
    #[error("transaction {tx_hash} not included on chain {chain_id} after {bumps} fee bumps")]
    ConfirmationTimeout {
        /// Chain the transaction was submitted to.
        chain_id: ChainId,
        /// Last submitted hash.
        tx_hash: B256,
        /// Number of replacements submitted.
        bumps: u32,
    },
    /// The nonce was consumed by a transaction this process did not submit.
    #[error("transaction {tx_hash} on chain {chain_id} was dropped")]
    TransactionDropped {
        /// Chain the transaction was submitted to.
        chain_id: ChainId,
        /// Last submitted hash.
        tx_hash: B256,
    },
    /// The caller's deadline passed before anything was submitted.
    #[error("deadline exceeded on chain {chain_id}")]
    DeadlineExceeded {
        /// Chain the request targets.
        chain_id: ChainId,
    },
}

impl ExecutionError {
    /// Maps the failure of a read-only query.
    ///
    /// Transport failures mean the endpoints are unreachable, anything else is an estimation
    /// failure reported by a reachable node.
    pub fn from_query(chain_id: ChainId, err: TransportError) -> Self {
        match err {
            RpcError::Transport(_) => Self::unavailable(chain_id, err),
            err => Self::EstimationFailed { chain_id, source: Arc::new(err) },
        }
    }

    /// Creates a [`ExecutionError::ChainUnavailable`].
    pub fn unavailable(chain_id: ChainId, err: TransportError) -> Self {
        Self::ChainUnavailable { chain_id, source: Arc::new(err) }
    }

    /// Creates a [`ExecutionError::InvalidCalls`].
    pub fn invalid_calls(chain_id: ChainId, reason: impl Into<String>) -> Self {
        Self::InvalidCalls { chain_id, reason: reason.into() }
    }

    /// Returns the chain this error originated on.
    pub const fn chain_id(&self) -> ChainId {
        match self {
            Self::UnknownChain(chain_id) => *chain_id,
            Self::ChainUnavailable { chain_id, .. }
            | Self::EstimationFailed { chain_id, .. }
            | Self::UnsupportedTransactionType { chain_id, .. }
            | Self::InvalidCalls { chain_id, .. }
            | Self::SigningFailed { chain_id, .. }
            | Self::SubmissionRejected { chain_id, .. }
            | Self::ExecutionReverted { chain_id, .. }
            | Self::ConfirmationTimeout { chain_id, .. }
            | Self::TransactionDropped { chain_id, .. }
            | Self::DeadlineExceeded { chain_id } => *chain_id,
        }
    }

    /// Returns the hash of the transaction this error relates to, if any.
    pub const fn tx_hash(&self) -> Option<B256> {
        match self {
            Self::SubmissionRejected { tx_hash, .. } => *tx_hash,
            Self::ExecutionReverted { tx_hash, .. }
            | Self::ConfirmationTimeout { tx_hash, .. }
            | Self::TransactionDropped { tx_hash, .. } => Some(*tx_hash),
            _ => None,
        }
    }

    /// Whether the failure is transient and the caller may try again later.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChainUnavailable { .. }
                | Self::EstimationFailed { .. }
                | Self::ConfirmationTimeout { .. }
        )
    }

    /// Whether this is a [`ExecutionError::ChainUnavailable`].
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::ChainUnavailable { .. })
    }
}
