//! Fee and gas estimation.
//!
//! The transaction type is chosen once per draft from the chain's supported types, the fee
//! fields are then computed for that type. All arithmetic is on integers, fee fields round up.

use crate::{
    builder::TransactionDraft,
    chains::{ChainSpec, TransactionType},
    config::FeeConfig,
    error::ExecutionError,
};
use alloy::{
    eips::{
        BlockNumberOrTag, eip2930::AccessList, eip4844::BlobTransactionSidecar,
        eip7702::SignedAuthorization,
    },
    primitives::{Address, ChainId},
    providers::{DynProvider, Provider},
    transports::{RpcError, TransportResult},
};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Fee fields of a transaction, one variant per transaction type.
#[derive(Debug, Clone, PartialEq)]
pub enum FeeFields {
    /// Legacy gas price.
    Legacy {
        /// Gas price, in wei.
        gas_price: u128,
    },
    /// Legacy gas price with an access list.
    Eip2930 {
        /// Gas price, in wei.
        gas_price: u128,
        /// The access list.
        access_list: AccessList,
    },
    /// Base fee budget and tip.
    Eip1559 {
        /// Maximum total fee per gas, in wei.
        max_fee_per_gas: u128,
        /// Maximum tip per gas, in wei.
        max_priority_fee_per_gas: u128,
    },
    /// EIP-1559 fees plus a blob fee, carrying the blobs.
    Eip4844 {
        /// Maximum total fee per gas, in wei.
        max_fee_per_gas: u128,
        /// Maximum tip per gas, in wei.
        max_priority_fee_per_gas: u128,
        /// Maximum fee per blob gas, in wei.
        max_fee_per_blob_gas: u128,
        /// The blobs.
        sidecar: BlobTransactionSidecar,
    },
    /// EIP-1559 fees, carrying the authorization list.
    Eip7702 {
        /// Maximum total fee per gas, in wei.
        max_fee_per_gas: u128,
        /// Maximum tip per gas, in wei.
        max_priority_fee_per_gas: u128,
        /// The authorizations.
        authorization_list: Vec<SignedAuthorization>,
    },
}

impl FeeFields {
    /// The transaction type these fees are for.
    pub const fn tx_type(&self) -> TransactionType {
        match self {
            Self::Legacy { .. } => TransactionType::Legacy,
            Self::Eip2930 { .. } => TransactionType::Eip2930,
            Self::Eip1559 { .. } => TransactionType::Eip1559,
            Self::Eip4844 { .. } => TransactionType::Eip4844,
            Self::Eip7702 { .. } => TransactionType::Eip7702,
        }
    }

    /// Maximum fee per gas, the gas price for legacy fees.
    pub const fn max_fee_per_gas(&self) -> u128 {
        match self {
            Self::Legacy { gas_price } | Self::Eip2930 { gas_price, .. } => *gas_price,
            Self::Eip1559 { max_fee_per_gas, .. }
            | Self::Eip4844 { max_fee_per_gas, .. }
            | Self::Eip7702 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    /// Maximum tip per gas, the gas price for legacy fees.
    pub const fn max_priority_fee_per_gas(&self) -> u128 {
        match self {
            Self::Legacy { gas_price } | Self::Eip2930 { gas_price, .. } => *gas_price,
            Self::Eip1559 { max_priority_fee_per_gas, .. }
            | Self::Eip4844 { max_priority_fee_per_gas, .. }
            | Self::Eip7702 { max_priority_fee_per_gas, .. } => *max_priority_fee_per_gas,
        }
    }

    /// Fees for a same-nonce replacement.
    ///
    /// Every price is raised by `ratio_percent`, and by at least one wei. Returns `None` if the
    /// replacement would exceed `cap`.
    pub fn bump(&self, ratio_percent: u64, cap: Option<u128>) -> Option<Self> {
        let bump = |fee: u128| bump_fee(fee, ratio_percent);
        let within_cap = |fee: u128| cap.is_none_or(|cap| fee <= cap);

        let bumped = match self.clone() {
            Self::Legacy { gas_price } => Self::Legacy { gas_price: bump(gas_price) },
            Self::Eip2930 { gas_price, access_list } => {
                Self::Eip2930 { gas_price: bump(gas_price), access_list }
            }
            Self::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => {
                let max_fee_per_gas = bump(max_fee_per_gas);
                Self::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: bump(max_priority_fee_per_gas).min(max_fee_per_gas),
                }
            }
            Self::Eip4844 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                max_fee_per_blob_gas,
                sidecar,
            } => {
                let max_fee_per_gas = bump(max_fee_per_gas);
                Self::Eip4844 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: bump(max_priority_fee_per_gas).min(max_fee_per_gas),
                    max_fee_per_blob_gas: bump(max_fee_per_blob_gas),
                    sidecar,
                }
            }
            Self::Eip7702 { max_fee_per_gas, max_priority_fee_per_gas, authorization_list } => {
                let max_fee_per_gas = bump(max_fee_per_gas);
                Self::Eip7702 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: bump(max_priority_fee_per_gas).min(max_fee_per_gas),
                    authorization_list,
                }
            }
        };

        within_cap(bumped.max_fee_per_gas()).then_some(bumped)
    }
}

/// `fee * percent / 100`, rounded up.
fn scale_up(fee: u128, percent: u64) -> u128 {
    fee.saturating_mul(percent as u128).div_ceil(100)
}

fn bump_fee(fee: u128, ratio_percent: u64) -> u128 {
    scale_up(fee, ratio_percent).max(fee.saturating_add(1))
}

/// Computes EIP-1559 fees from the latest base fee and a tip suggestion.
///
/// The tip is the suggestion, raised to the configured minimum. The fee cap budgets
/// `base_fee_multiplier_percent` of the base fee on top of the tip, and is clamped to the
/// configured maximum without going below the tip.
pub fn eip1559_fees(base_fee: u128, suggested_priority_fee: u128, config: &FeeConfig) -> (u128, u128) {
    let max_priority_fee_per_gas = suggested_priority_fee.max(config.min_priority_fee as u128);
    let mut max_fee_per_gas = scale_up(base_fee, config.base_fee_multiplier_percent)
        .saturating_add(max_priority_fee_per_gas);

    if let Some(cap) = config.max_fee_per_gas {
        max_fee_per_gas = max_fee_per_gas.min(cap as u128).max(max_priority_fee_per_gas);
    }

    (max_fee_per_gas, max_priority_fee_per_gas)
}

/// Computes a legacy gas price from the node's suggestion.
pub fn legacy_gas_price(suggested_gas_price: u128, config: &FeeConfig) -> u128 {
    config.max_fee_per_gas.map_or(suggested_gas_price, |cap| suggested_gas_price.min(cap as u128))
}

/// Adds the safety margin to a gas estimate, rounding up.
pub fn apply_gas_margin(estimate: u64, margin_percent: u64) -> u64 {
    let gas = (estimate as u128 * (100 + margin_percent as u128)).div_ceil(100);
    gas.try_into().unwrap_or(u64::MAX)
}

/// Selects the transaction type of a draft on a chain.
///
/// Blobs and authorizations require their type and are never downgraded. Otherwise the richest
/// supported fee market wins. An access list is attached as EIP-2930 only on chains without
/// EIP-1559, and is dropped on chains that support neither.
pub fn select_tx_type(
    spec: &ChainSpec,
    draft: &TransactionDraft,
) -> Result<TransactionType, ExecutionError> {
    let unsupported =
        |tx_type| ExecutionError::UnsupportedTransactionType { chain_id: spec.chain_id, tx_type };

    if draft.authorization_list.is_some() {
        return spec
            .supports(TransactionType::Eip7702)
            .then_some(TransactionType::Eip7702)
            .ok_or_else(|| unsupported(TransactionType::Eip7702));
    }
    if draft.sidecar.is_some() {
        return spec
            .supports(TransactionType::Eip4844)
            .then_some(TransactionType::Eip4844)
            .ok_or_else(|| unsupported(TransactionType::Eip4844));
    }

    if spec.supports(TransactionType::Eip1559) {
        Ok(TransactionType::Eip1559)
    } else if spec.supports(TransactionType::Eip2930)
        && (draft.access_list.is_some() || !spec.supports(TransactionType::Legacy))
    {
        Ok(TransactionType::Eip2930)
    } else if spec.supports(TransactionType::Legacy) {
        if draft.access_list.is_some() {
            debug!(chain_id = %spec.chain_id, "Dropping access list, EIP-2930 is not supported");
        }
        Ok(TransactionType::Legacy)
    } else {
        Err(unsupported(TransactionType::Legacy))
    }
}

/// Estimates fees and gas for drafts on a single chain.
///
/// Queries are read-only: each is retried once after a backoff before failing with
/// [`ExecutionError::EstimationFailed`], or [`ExecutionError::ChainUnavailable`] if the chain
/// could not be reached.
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    chain_id: ChainId,
    provider: DynProvider,
    retry_backoff: Duration,
}

impl FeeEstimator {
    /// Creates a new [`FeeEstimator`].
    pub fn new(chain_id: ChainId, provider: DynProvider, retry_backoff: Duration) -> Self {
        Self { chain_id, provider, retry_backoff }
    }

    async fn query<T, F, Fut>(&self, method: &'static str, query: F) -> Result<T, ExecutionError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        match query().await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(chain_id = %self.chain_id, method, %err, "Estimation query failed, retrying");
                tokio::time::sleep(self.retry_backoff).await;
                query().await.map_err(|err| {
                    warn!(chain_id = %self.chain_id, method, %err, "Estimation query failed");
                    ExecutionError::from_query(self.chain_id, err)
                })
            }
        }
    }

    /// Returns the base fee of the latest block.
    pub async fn base_fee(&self) -> Result<u128, ExecutionError> {
        self.query("eth_feeHistory", || async {
            self.provider
                .get_fee_history(1, BlockNumberOrTag::Latest, &[])
                .await?
                .latest_block_base_fee()
                .ok_or(RpcError::NullResp)
        })
        .await
    }

    /// Estimates the fee fields of `draft` on the chain described by `spec`.
    #[instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn estimate_fees(
        &self,
        spec: &ChainSpec,
        draft: &TransactionDraft,
        from: Address,
    ) -> Result<FeeFields, ExecutionError> {
        let tx_type = select_tx_type(spec, draft)?;
        let config = &spec.fees;

        let fees = match tx_type {
            TransactionType::Legacy => {
                let gas_price =
                    self.query("eth_gasPrice", || async { self.provider.get_gas_price().await }).await?;
                FeeFields::Legacy { gas_price: legacy_gas_price(gas_price, config) }
            }
            TransactionType::Eip2930 => {
                let gas_price =
                    self.query("eth_gasPrice", || async { self.provider.get_gas_price().await }).await?;
                let access_list = match &draft.access_list {
                    Some(access_list) => access_list.clone(),
                    None => {
                        let request = draft.request(from);
                        self.query("eth_createAccessList", || async {
                            Ok(self.provider.create_access_list(&request).await?.access_list)
                        })
                        .await?
                    }
                };
                FeeFields::Eip2930 { gas_price: legacy_gas_price(gas_price, config), access_list }
            }
            TransactionType::Eip1559 | TransactionType::Eip4844 | TransactionType::Eip7702 => {
                let base_fee = self.base_fee().await?;
                let priority_fee = self
                    .query("eth_maxPriorityFeePerGas", || async {
                        self.provider.get_max_priority_fee_per_gas().await
                    })
                    .await?;
                let (max_fee_per_gas, max_priority_fee_per_gas) =
                    eip1559_fees(base_fee, priority_fee, config);

                match tx_type {
                    TransactionType::Eip4844 => {
                        let blob_base_fee = self
                            .query("eth_blobBaseFee", || async {
                                self.provider.get_blob_base_fee().await
                            })
                            .await?;
                        FeeFields::Eip4844 {
                            max_fee_per_gas,
                            max_priority_fee_per_gas,
                            max_fee_per_blob_gas: scale_up(
                                blob_base_fee,
                                config.base_fee_multiplier_percent,
                            )
                            .max(1),
                            sidecar: draft.sidecar.clone().unwrap_or_default(),
                        }
                    }
                    TransactionType::Eip7702 => FeeFields::Eip7702 {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                        authorization_list: draft.authorization_list.clone().unwrap_or_default(),
                    },
                    _ => FeeFields::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas },
                }
            }
        };

        debug!(
            tx_type = %fees.tx_type(),
            max_fee_per_gas = fees.max_fee_per_gas(),
            max_priority_fee_per_gas = fees.max_priority_fee_per_gas(),
            "Estimated fees"
        );
        Ok(fees)
    }

    /// Returns the gas limit of `draft`: its explicit gas, or the node's estimate plus the
    /// configured margin.
    #[instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn estimate_gas(
        &self,
        draft: &TransactionDraft,
        from: Address,
        config: &FeeConfig,
    ) -> Result<u64, ExecutionError> {
        if let Some(gas) = draft.gas {
            return Ok(gas);
        }

        let request = draft.request(from);
        let estimate = self
            .query("eth_estimateGas", || async {
                self.provider.estimate_gas(request.clone()).await
            })
            .await?;
        Ok(apply_gas_margin(estimate, config.gas_margin_percent))
    }
}
