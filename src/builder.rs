//! Transaction drafts, building and signing.
//!
//! A [`TransactionDraft`] is what the executor wants to send, before fees and nonce are known.
//! Once estimated it becomes a [`PreparedTransaction`], which is turned into the typed
//! transaction matching its [`FeeFields`] and signed by the owner.

use crate::{
    error::ExecutionError,
    fees::FeeFields,
    wallet::{CallIntent, encode_execute},
};
use alloy::{
    consensus::{
        TxEip1559, TxEip2930, TxEip4844, TxEip4844Variant, TxEip4844WithSidecar, TxEip7702,
        TxEnvelope, TxLegacy, TypedTransaction,
    },
    eips::{
        Encodable2718, eip2930::AccessList, eip4844::BlobTransactionSidecar,
        eip7702::SignedAuthorization,
    },
    network::{Ethereum, EthereumWallet, NetworkWallet},
    primitives::{Address, B256, Bytes, ChainId, U256},
    rpc::types::TransactionRequest,
};
use std::sync::Arc;

/// How calls reach their targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallRoute {
    /// Through the smart wallet's `execute`, the wallet being `msg.sender`.
    #[default]
    Wallet,
    /// A single call sent straight from the owner account.
    Direct,
}

/// A transaction before fees, gas and nonce are filled in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionDraft {
    /// Recipient of the outer transaction.
    pub to: Address,
    /// Value of the outer transaction.
    pub value: U256,
    /// Calldata of the outer transaction.
    pub input: Bytes,
    /// Gas limit, if it is known without estimating.
    pub gas: Option<u64>,
    /// Access list to attach, if any.
    pub access_list: Option<AccessList>,
    /// Blobs to carry. Requires EIP-4844.
    pub sidecar: Option<BlobTransactionSidecar>,
    /// Authorizations to carry. Requires EIP-7702.
    pub authorization_list: Option<Vec<SignedAuthorization>>,
}

impl TransactionDraft {
    /// Drafts the transaction executing `calls` for `wallet`.
    ///
    /// Wallet-routed calls are encoded as the wallet's `execute` payload with a zero outer value,
    /// call values being paid by the wallet. If every call carries a gas override, the gas limit
    /// is their sum plus `execution_overhead`.
    pub fn for_calls(
        chain_id: ChainId,
        wallet: Address,
        calls: &[CallIntent],
        route: CallRoute,
        execution_overhead: u64,
    ) -> Result<Self, ExecutionError> {
        match route {
            CallRoute::Wallet => {
                let input = encode_execute(calls)
                    .ok_or_else(|| ExecutionError::invalid_calls(chain_id, "no calls"))?;
                let gas = calls
                    .iter()
                    .map(|call| call.gas)
                    .sum::<Option<u64>>()
                    .map(|gas| gas.saturating_add(execution_overhead));
                Ok(Self { to: wallet, input, gas, ..Default::default() })
            }
            CallRoute::Direct => match calls {
                [call] => Ok(Self {
                    to: call.to,
                    value: call.value,
                    input: call.data.clone(),
                    gas: call.gas,
                    ..Default::default()
                }),
                [] => Err(ExecutionError::invalid_calls(chain_id, "no calls")),
                _ => Err(ExecutionError::invalid_calls(
                    chain_id,
                    "direct calls must be sent one at a time",
                )),
            },
        }
    }

    /// Attaches an access list.
    pub fn with_access_list(mut self, access_list: AccessList) -> Self {
        self.access_list = Some(access_list);
        self
    }

    /// Attaches blobs.
    pub fn with_sidecar(mut self, sidecar: BlobTransactionSidecar) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    /// Attaches EIP-7702 authorizations.
    pub fn with_authorization_list(mut self, authorization_list: Vec<SignedAuthorization>) -> Self {
        self.authorization_list = Some(authorization_list);
        self
    }

    /// The draft as a request for `eth_estimateGas` and `eth_call`.
    pub fn request(&self, from: Address) -> TransactionRequest {
        let mut request = TransactionRequest::default()
            .from(from)
            .to(self.to)
            .value(self.value)
            .input(self.input.clone().into());
        request.access_list = self.access_list.clone();
        request.authorization_list = self.authorization_list.clone();
        request
    }
}

/// A transaction with every field resolved, ready to be signed.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTransaction {
    /// Chain the transaction is bound to.
    pub chain_id: ChainId,
    /// The owner account sending it.
    pub from: Address,
    /// Nonce of the owner account.
    pub nonce: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Fees, selecting the transaction type.
    pub fees: FeeFields,
    /// What the transaction does.
    pub draft: TransactionDraft,
}

impl PreparedTransaction {
    /// Returns a replacement with the same nonce and the given fees.
    pub fn with_fees(&self, fees: FeeFields) -> Self {
        Self { fees, ..self.clone() }
    }

    /// Builds the typed transaction. The chain id is always set.
    pub fn build(&self) -> TypedTransaction {
        let (chain_id, nonce, gas_limit, draft) =
            (self.chain_id, self.nonce, self.gas_limit, &self.draft);
        let access_list = draft.access_list.clone().unwrap_or_default();

        match &self.fees {
            FeeFields::Legacy { gas_price } => TxLegacy {
                chain_id: Some(chain_id),
                nonce,
                gas_price: *gas_price,
                gas_limit,
                to: draft.to.into(),
                value: draft.value,
                input: draft.input.clone(),
            }
            .into(),
            FeeFields::Eip2930 { gas_price, access_list } => TxEip2930 {
                chain_id,
                nonce,
                gas_price: *gas_price,
                gas_limit,
                to: draft.to.into(),
                value: draft.value,
                access_list: access_list.clone(),
                input: draft.input.clone(),
            }
            .into(),
            FeeFields::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => TxEip1559 {
                chain_id,
                nonce,
                gas_limit,
                max_fee_per_gas: *max_fee_per_gas,
                max_priority_fee_per_gas: *max_priority_fee_per_gas,
                to: draft.to.into(),
                value: draft.value,
                access_list,
                input: draft.input.clone(),
            }
            .into(),
            FeeFields::Eip4844 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                max_fee_per_blob_gas,
                sidecar,
            } => TypedTransaction::Eip4844(TxEip4844Variant::TxEip4844WithSidecar(
                TxEip4844WithSidecar {
                    tx: TxEip4844 {
                        chain_id,
                        nonce,
                        gas_limit,
                        max_fee_per_gas: *max_fee_per_gas,
                        max_priority_fee_per_gas: *max_priority_fee_per_gas,
                        to: draft.to,
                        value: draft.value,
                        access_list,
                        blob_versioned_hashes: sidecar.versioned_hashes().collect(),
                        max_fee_per_blob_gas: *max_fee_per_blob_gas,
                        input: draft.input.clone(),
                    },
                    sidecar: alloy::consensus::BlobTransactionSidecarVariant::Eip4844(sidecar.clone()),
                },
            )),
            FeeFields::Eip7702 { max_fee_per_gas, max_priority_fee_per_gas, authorization_list } => {
                TxEip7702 {
                    chain_id,
                    nonce,
                    gas_limit,
                    max_fee_per_gas: *max_fee_per_gas,
                    max_priority_fee_per_gas: *max_priority_fee_per_gas,
                    to: draft.to,
                    value: draft.value,
                    access_list,
                    authorization_list: authorization_list.clone(),
                    input: draft.input.clone(),
                }
                .into()
            }
        }
    }

    /// Signs the transaction with the owner's wallet.
    pub async fn sign(self, wallet: &EthereumWallet) -> Result<SignedTransaction, ExecutionError> {
        let envelope =
            NetworkWallet::<Ethereum>::sign_transaction_from(wallet, self.from, self.build())
                .await
                .map_err(|err| ExecutionError::SigningFailed {
                    chain_id: self.chain_id,
                    source: Arc::new(err),
                })?;

        Ok(SignedTransaction { prepared: self, envelope })
    }
}

/// A signed [`PreparedTransaction`].
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// The transaction that was signed.
    pub prepared: PreparedTransaction,
    /// The signed envelope.
    pub envelope: TxEnvelope,
}

impl SignedTransaction {
    /// Hash of the signed transaction.
    pub fn hash(&self) -> B256 {
        *self.envelope.tx_hash()
    }

    /// Nonce of the transaction.
    pub fn nonce(&self) -> u64 {
        self.prepared.nonce
    }

    /// EIP-2718 encoding, as sent with `eth_sendRawTransaction`.
    pub fn encoded(&self) -> Vec<u8> {
        self.envelope.encoded_2718()
    }
}
