//! Submission and confirmation of signed transactions.
//!
//! A transaction moves from signed to submitted, and from submitted to included, reverted or
//! dropped. While it waits, it may be replaced by a copy with the same nonce and higher fees a
//! bounded number of times. Submissions are never retried blindly: a rejected raw transaction is
//! surfaced as is.

use crate::{
    builder::{PreparedTransaction, SignedTransaction},
    config::{FeeConfig, TransactionServiceConfig},
    error::{ExecutionError, RejectionReason},
    metrics::ExecutorMetrics,
    transport::error::TransportErrExt,
};
use alloy::{
    consensus::Transaction as _,
    eips::BlockId,
    network::EthereumWallet,
    primitives::{Address, B256, Bytes, ChainId},
    providers::{DynProvider, Provider},
    rpc::types::TransactionReceipt,
    sol_types::{Revert, SolError, decode_revert_reason},
    transports::TransportResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Where a submitted transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    /// Accepted by the node, not yet included.
    Pending,
    /// Included and succeeded.
    Included,
    /// Included and reverted.
    Reverted,
    /// Not known to the node, or its nonce was taken by another transaction.
    Dropped,
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    /// Chain the transaction was sent to.
    pub chain_id: ChainId,
    /// Hash of the transaction, the last replacement if fees were bumped.
    pub tx_hash: B256,
    /// Status of the transaction.
    pub status: SubmissionStatus,
    /// Nonce of the transaction, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    /// Block the transaction was included in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Gas used by the transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    /// Number of fee bumps before inclusion.
    #[serde(default)]
    pub bumps: u32,
}

impl SubmissionResult {
    fn pending(signed: &SignedTransaction) -> Self {
        Self {
            chain_id: signed.prepared.chain_id,
            tx_hash: signed.hash(),
            status: SubmissionStatus::Pending,
            nonce: Some(signed.nonce()),
            block_number: None,
            gas_used: None,
            bumps: 0,
        }
    }

    fn from_receipt(chain_id: ChainId, receipt: &TransactionReceipt) -> Self {
        Self {
            chain_id,
            tx_hash: receipt.transaction_hash,
            status: if receipt.status() {
                SubmissionStatus::Included
            } else {
                SubmissionStatus::Reverted
            },
            nonce: None,
            block_number: receipt.block_number,
            gas_used: Some(receipt.gas_used),
            bumps: 0,
        }
    }
}

/// Drives signed transactions of one chain to inclusion.
#[derive(Debug, Clone)]
pub struct Driver {
    chain_id: ChainId,
    provider: DynProvider,
    wallet: EthereumWallet,
    config: TransactionServiceConfig,
    fees: FeeConfig,
    metrics: ExecutorMetrics,
}

impl Driver {
    /// Creates a new [`Driver`].
    pub fn new(
        chain_id: ChainId,
        provider: DynProvider,
        wallet: EthereumWallet,
        config: TransactionServiceConfig,
        fees: FeeConfig,
    ) -> Self {
        Self { chain_id, provider, wallet, config, fees, metrics: ExecutorMetrics::for_chain(chain_id) }
    }

    /// Sends a signed transaction to the node.
    ///
    /// A node that already knows the transaction counts as a success. Fails with
    /// [`ExecutionError::SubmissionRejected`] if the node refuses it and
    /// [`ExecutionError::ChainUnavailable`] if it could not be reached.
    #[instrument(skip_all, fields(chain_id = %self.chain_id, tx_hash = %signed.hash(), nonce = signed.nonce()))]
    pub async fn submit(&self, signed: &SignedTransaction) -> Result<SubmissionResult, ExecutionError> {
        match self.provider.send_raw_transaction(&signed.encoded()).await {
            Ok(_) => {}
            Err(err) if err.is_already_known() => {
                debug!("Transaction already known");
            }
            Err(err) => {
                let Some(resp) = err.as_error_resp() else {
                    return Err(ExecutionError::unavailable(self.chain_id, err));
                };

                self.metrics.rejected.increment(1);
                let reason = RejectionReason::classify(&err);
                warn!(%reason, message = %resp.message, "Transaction rejected");
                return Err(ExecutionError::SubmissionRejected {
                    chain_id: self.chain_id,
                    tx_hash: Some(signed.hash()),
                    reason,
                    message: resp.message.to_string(),
                });
            }
        }

        self.metrics.submitted.increment(1);
        debug!("Submitted transaction");
        Ok(SubmissionResult::pending(signed))
    }

    /// Waits for a submitted transaction to be included, bumping its fees on every inclusion
    /// timeout until `max_bumps` replacements were sent.
    ///
    /// Resolves with the receipt of whichever of the original and its replacements was included.
    /// A deadline, exhausted bumps or a replacement the node did not accept end the wait with
    /// [`ExecutionError::ConfirmationTimeout`] carrying the last accepted hash; that transaction
    /// stays submitted.
    #[instrument(skip_all, fields(chain_id = %self.chain_id, nonce = signed.nonce()))]
    pub async fn await_inclusion(
        &self,
        mut signed: SignedTransaction,
        deadline: Option<Instant>,
    ) -> Result<SubmissionResult, ExecutionError> {
        let submitted_at = Utc::now();
        let mut hashes = vec![signed.hash()];
        let mut bumps = 0;

        loop {
            let mut wait_until = Instant::now() + self.config.inclusion_timeout;
            if let Some(deadline) = deadline {
                wait_until = wait_until.min(deadline);
            }

            if let Some(receipt) = self.wait_for_receipt(&hashes, wait_until).await {
                return self.finish(&signed.prepared, &receipt, bumps, submitted_at).await;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(self.timeout(signed.hash(), bumps));
            }

            if self.nonce_consumed(signed.prepared.from, signed.nonce()).await {
                // The nonce may have been taken by one of our own transactions in the meantime.
                if let Some(receipt) = self.find_receipt(&hashes).await {
                    return self.finish(&signed.prepared, &receipt, bumps, submitted_at).await;
                }

                self.metrics.dropped.increment(1);
                warn!(tx_hash = %signed.hash(), "Transaction dropped, nonce consumed");
                return Err(ExecutionError::TransactionDropped {
                    chain_id: self.chain_id,
                    tx_hash: signed.hash(),
                });
            }

            if bumps >= self.config.max_bumps {
                return Err(self.timeout(signed.hash(), bumps));
            }

            let Some(fees) = signed
                .prepared
                .fees
                .bump(self.fees.bump_ratio_percent(), self.fees.max_fee_per_gas.map(u128::from))
            else {
                warn!(tx_hash = %signed.hash(), "Can't bump fees above the configured maximum");
                return Err(self.timeout(signed.hash(), bumps));
            };

            let replacement = match signed.prepared.with_fees(fees).sign(&self.wallet).await {
                Ok(replacement) => replacement,
                Err(err) => {
                    warn!(%err, tx_hash = %signed.hash(), "Failed to sign replacement");
                    return Err(self.timeout(signed.hash(), bumps));
                }
            };
            info!(
                bumps = bumps + 1,
                max_fee_per_gas = replacement.prepared.fees.max_fee_per_gas(),
                replaced = %signed.hash(),
                tx_hash = %replacement.hash(),
                "Bumping transaction fees"
            );

            match self.submit(&replacement).await {
                Ok(_) => {
                    bumps += 1;
                    self.metrics.fee_bumps.increment(1);
                    hashes.push(replacement.hash());
                    signed = replacement;
                }
                Err(ExecutionError::SubmissionRejected {
                    reason: RejectionReason::Underpriced, ..
                }) => {
                    // Keep bumping from the rejected fees, the pool still holds the previous
                    // transaction.
                    bumps += 1;
                    signed = SignedTransaction { envelope: signed.envelope, ..replacement };
                }
                Err(ExecutionError::SubmissionRejected {
                    reason: RejectionReason::NonceTooLow, ..
                }) => {
                    // Something was mined with our nonce, most likely a transaction sent above.
                    if let Some(receipt) = self.find_receipt(&hashes).await {
                        return self.finish(&signed.prepared, &receipt, bumps, submitted_at).await;
                    }
                    self.metrics.dropped.increment(1);
                    return Err(ExecutionError::TransactionDropped {
                        chain_id: self.chain_id,
                        tx_hash: signed.hash(),
                    });
                }
                Err(err) => {
                    // The last accepted transaction is still in the pool.
                    warn!(%err, tx_hash = %signed.hash(), "Replacement failed");
                    return Err(self.timeout(signed.hash(), bumps));
                }
            }
        }
    }

    /// Returns the status of a transaction.
    pub async fn status(&self, tx_hash: B256) -> Result<SubmissionResult, ExecutionError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|err| ExecutionError::unavailable(self.chain_id, err))?;
        if let Some(receipt) = receipt {
            return Ok(SubmissionResult::from_receipt(self.chain_id, &receipt));
        }

        let tx = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(|err| ExecutionError::unavailable(self.chain_id, err))?;

        Ok(SubmissionResult {
            chain_id: self.chain_id,
            tx_hash,
            status: if tx.is_some() { SubmissionStatus::Pending } else { SubmissionStatus::Dropped },
            nonce: tx.as_ref().map(|tx| tx.nonce()),
            block_number: None,
            gas_used: None,
            bumps: 0,
        })
    }

    fn timeout(&self, tx_hash: B256, bumps: u32) -> ExecutionError {
        self.metrics.timeouts.increment(1);
        warn!(%tx_hash, bumps, "Transaction not included in time");
        ExecutionError::ConfirmationTimeout { chain_id: self.chain_id, tx_hash, bumps }
    }

    /// Polls for a receipt of any of `hashes` until `until`.
    async fn wait_for_receipt(&self, hashes: &[B256], until: Instant) -> Option<TransactionReceipt> {
        loop {
            if let Some(receipt) = self.find_receipt(hashes).await {
                return Some(receipt);
            }

            let now = Instant::now();
            if now >= until {
                return None;
            }
            tokio::time::sleep(self.config.poll_interval.min(until - now)).await;
        }
    }

    /// Returns the receipt of any of `hashes`, newest first.
    async fn find_receipt(&self, hashes: &[B256]) -> Option<TransactionReceipt> {
        for hash in hashes.iter().rev() {
            match self.provider.get_transaction_receipt(*hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(err) => debug!(%hash, %err, "Failed to fetch receipt"),
            }
        }
        None
    }

    /// Whether the latest nonce of `from` moved past `nonce`.
    async fn nonce_consumed(&self, from: Address, nonce: u64) -> bool {
        match self.provider.get_transaction_count(from).latest().await {
            Ok(latest) => latest > nonce,
            Err(err) => {
                debug!(%err, "Failed to fetch nonce");
                false
            }
        }
    }

    async fn finish(
        &self,
        prepared: &PreparedTransaction,
        receipt: &TransactionReceipt,
        bumps: u32,
        submitted_at: DateTime<Utc>,
    ) -> Result<SubmissionResult, ExecutionError> {
        let result = SubmissionResult {
            nonce: Some(prepared.nonce),
            bumps,
            ..SubmissionResult::from_receipt(self.chain_id, receipt)
        };

        if receipt.status() {
            self.metrics.included.increment(1);
            self.metrics
                .confirmation_time
                .record(Utc::now().signed_duration_since(submitted_at).num_milliseconds() as f64);
            info!(tx_hash = %result.tx_hash, block_number = ?result.block_number, bumps, "Transaction included");
            return Ok(result);
        }

        self.metrics.reverted.increment(1);
        let data = self.revert_data(prepared, receipt.block_number).await;
        let reason = data.as_ref().and_then(|data| {
            Revert::abi_decode(data).map(|revert| revert.reason).ok().or_else(|| decode_revert_reason(data))
        });
        warn!(tx_hash = %result.tx_hash, ?reason, "Transaction reverted");

        Err(ExecutionError::ExecutionReverted {
            chain_id: self.chain_id,
            tx_hash: result.tx_hash,
            reason,
            data,
        })
    }

    /// Replays a reverted transaction on top of its parent block to recover the revert data.
    async fn revert_data(&self, prepared: &PreparedTransaction, block: Option<u64>) -> Option<Bytes> {
        let mut request = prepared.draft.request(prepared.from);
        request.gas = Some(prepared.gas_limit);

        let mut call = self.provider.call(request);
        if let Some(block) = block {
            call = call.block(BlockId::number(block.saturating_sub(1)));
        }

        let result: TransportResult<Bytes> = call.await;
        match result {
            Ok(_) => None,
            Err(err) => err.as_error_resp().and_then(|resp| resp.as_revert_data()),
        }
    }
}
