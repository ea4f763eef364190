//! Nonce management.
//!
//! Nonces are handed out per chain and account from a process-local counter, seeded from the
//! chain's pending transaction count the first time an account is seen. The local counter takes
//! precedence afterwards, so transactions sent faster than the node propagates its pending state
//! never collide.

use alloy::{
    primitives::{Address, ChainId},
    providers::Provider,
    transports::TransportResult,
};
use dashmap::DashMap;
use futures_util::lock::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Use `u64::MAX` as a sentinel value to indicate that the nonce has not been fetched yet.
const NONE: u64 = u64::MAX;

/// [`NonceManager`] hands out nonces for multiple chains and addresses.
///
/// Each entry holds the last nonce handed out.
#[derive(Clone, Debug, Default)]
pub struct NonceManager {
    #[allow(clippy::type_complexity)]
    nonces: Arc<DashMap<(ChainId, Address), Arc<Mutex<u64>>>>,
}

impl NonceManager {
    fn entry(&self, chain_id: ChainId, address: Address) -> Arc<Mutex<u64>> {
        // Locks dashmap internally for a short duration to clone the `Arc`.
        // We also don't want to hold the dashmap lock through the await points of callers.
        let rm = self
            .nonces
            .entry((chain_id, address))
            .or_insert_with(|| Arc::new(Mutex::new(NONE)));
        Arc::clone(rm.value())
    }

    /// Returns the next nonce of `address` on the chain.
    pub async fn next<P: Provider>(
        &self,
        provider: &P,
        chain_id: ChainId,
        address: Address,
    ) -> TransportResult<u64> {
        let nonce = self.entry(chain_id, address);
        let mut nonce = nonce.lock().await;

        let new_nonce = if *nonce == NONE {
            // Initialize the nonce if we haven't seen this account before.
            provider.get_transaction_count(address).pending().await?
        } else {
            *nonce + 1
        };
        *nonce = new_nonce;
        Ok(new_nonce)
    }

    /// Returns `nonce` to the pool if it is the last one handed out.
    ///
    /// Used when a transaction with `nonce` never reached the pool. Returns false if a later nonce
    /// was handed out in the meantime, in which case the gap has to be resolved on chain.
    pub async fn rollback(&self, chain_id: ChainId, address: Address, nonce: u64) -> bool {
        let entry = self.entry(chain_id, address);
        let mut lock = entry.lock().await;
        if *lock != nonce {
            return false;
        }

        *lock = nonce.checked_sub(1).unwrap_or(NONE);
        debug!(%chain_id, %address, nonce, "Rolled back nonce");
        true
    }

    /// Forgets the local counter, the next nonce is read from the chain again.
    pub async fn reset(&self, chain_id: ChainId, address: Address) {
        let entry = self.entry(chain_id, address);
        *entry.lock().await = NONE;
        debug!(%chain_id, %address, "Reset nonce");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockNode, provider};

    const ACCOUNT: Address = Address::repeat_byte(0x11);

    #[tokio::test]
    async fn seeds_from_pending_count_then_counts_locally() {
        let node = MockNode::new(1);
        node.consume_nonce(ACCOUNT);
        node.consume_nonce(ACCOUNT);
        let provider = provider(&node);
        let nonces = NonceManager::default();

        assert_eq!(nonces.next(&provider, 1, ACCOUNT).await.unwrap(), 2);
        assert_eq!(nonces.next(&provider, 1, ACCOUNT).await.unwrap(), 3);
        assert_eq!(node.calls("eth_getTransactionCount"), 1);

        // Other chains and accounts are independent.
        assert_eq!(nonces.next(&provider, 10, ACCOUNT).await.unwrap(), 2);
        assert_eq!(nonces.next(&provider, 1, Address::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rollback_only_returns_the_last_nonce() {
        let node = MockNode::new(1);
        let provider = provider(&node);
        let nonces = NonceManager::default();

        let first = nonces.next(&provider, 1, ACCOUNT).await.unwrap();
        let second = nonces.next(&provider, 1, ACCOUNT).await.unwrap();
        assert!(!nonces.rollback(1, ACCOUNT, first).await);
        assert!(nonces.rollback(1, ACCOUNT, second).await);
        assert_eq!(nonces.next(&provider, 1, ACCOUNT).await.unwrap(), second);

        // Rolling back the very first nonce re-reads the chain.
        assert!(nonces.rollback(1, ACCOUNT, second).await);
        assert!(nonces.rollback(1, ACCOUNT, first).await);
        assert_eq!(nonces.next(&provider, 1, ACCOUNT).await.unwrap(), 0);
        assert_eq!(node.calls("eth_getTransactionCount"), 2);
    }

    #[tokio::test]
    async fn reset_resynchronises() {
        let node = MockNode::new(1);
        let provider = provider(&node);
        let nonces = NonceManager::default();

        assert_eq!(nonces.next(&provider, 1, ACCOUNT).await.unwrap(), 0);
        for _ in 0..5 {
            node.consume_nonce(ACCOUNT);
        }
        nonces.reset(1, ACCOUNT).await;
        assert_eq!(nonces.next(&provider, 1, ACCOUNT).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn concurrent_callers_get_distinct_nonces() {
        let node = MockNode::new(1);
        let provider = provider(&node);
        let nonces = NonceManager::default();

        let handed_out = futures::future::join_all(
            (0..16).map(|_| nonces.next(&provider, 1, ACCOUNT)),
        )
        .await;
        let mut handed_out: Vec<_> = handed_out.into_iter().map(Result::unwrap).collect();
        handed_out.sort_unstable();
        assert_eq!(handed_out, (0..16).collect::<Vec<_>>());
    }
}
