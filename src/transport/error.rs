//! Additional helpers for RPC error handling.

use alloy::transports::TransportError;

/// An extension trait for [`TransportError`] classifying node responses to
/// `eth_sendRawTransaction`.
///
/// Nodes only agree on the rough wording of these errors, so the checks match on lowercased
/// substrings of the error message.
pub trait TransportErrExt {
    /// Returns true if this is a "already known" error thrown when the transaction is already
    /// contained within the pool.
    ///
    /// This represents duplicate transaction submission.
    fn is_already_known(&self) -> bool;

    /// Returns true if the nonce of the transaction was already used by a mined transaction.
    fn is_nonce_too_low(&self) -> bool;

    /// Returns true if the sender cannot cover `gas * price + value`.
    fn is_insufficient_funds(&self) -> bool;

    /// Returns true if the fees are too low for the pool, or too low to replace a pending
    /// transaction with the same nonce.
    fn is_underpriced(&self) -> bool;
}

impl TransportErrExt for TransportError {
    fn is_already_known(&self) -> bool {
        // see also: op-geth: https://github.com/ethereum-optimism/op-geth/blob/e666543dc5500428ee7c940e54263fe4968c5efd/core/txpool/legacypool/legacypool.go#L991-L993
        // reth: https://github.com/paradigmxyz/reth/blob/a3b749676c6c748bf977983c189f9f4c4f9e9fbe/crates/rpc/rpc-eth-types/src/error/mod.rs#L663-L665
        message_contains(self, &["already known", "known transaction", "already imported"])
    }

    fn is_nonce_too_low(&self) -> bool {
        message_contains(self, &["nonce too low", "oldnonce", "nonce has already been used"])
    }

    fn is_insufficient_funds(&self) -> bool {
        message_contains(self, &["insufficient funds", "insufficient balance"])
    }

    fn is_underpriced(&self) -> bool {
        message_contains(
            self,
            &["underpriced", "fee too low", "max fee per gas less than block base fee"],
        )
    }
}

fn message_contains(err: &TransportError, patterns: &[&str]) -> bool {
    err.as_error_resp()
        .map(|resp| {
            let message = resp.message.to_lowercase();
            patterns.iter().any(|pattern| message.contains(pattern))
        })
        .unwrap_or_default()
}
