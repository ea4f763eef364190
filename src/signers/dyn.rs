//! Owner signer abstraction.
//!
//! The owner key is either a local private key or a handle to an AWS KMS key. Both are used
//! through the same opaque capability, the raw key never leaves this module.
use alloy::{
    network::{EthereumWallet, FullSigner, TxSigner},
    primitives::{Address, Signature},
    signers::{aws::AwsSigner, local::PrivateKeySigner},
};
use aws_config::BehaviorVersion;
use eyre::WrapErr;
use std::{fmt, ops::Deref, str::FromStr, sync::Arc};
use tracing::debug;

/// Abstraction over a local or remote signer.
#[derive(Clone)]
pub struct DynSigner(pub Arc<dyn FullSigner<Signature> + Send + Sync>);

impl fmt::Debug for DynSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnerSigner").field(&self.address()).finish()
    }
}

impl DynSigner {
    /// Loads a hex private key, or an AWS KMS key if `key` is not hex encoded.
    ///
    /// A malformed hex key is an error, it is never sent to KMS as a key id.
    pub async fn load(key: &str) -> eyre::Result<Self> {
        if is_hex_key(key) {
            return Self::from_signing_key(key).wrap_err("invalid owner private key");
        }

        debug!("Owner key is not hex encoded, loading it from AWS KMS");
        Self::from_kms(key, None).await
    }

    /// Load a private key.
    pub fn from_signing_key(key: &str) -> eyre::Result<Self> {
        Ok(Self(Arc::new(PrivateKeySigner::from_str(key)?)))
    }

    /// Load a signer from AWS KMS.
    pub async fn from_kms(key_id: &str, chain_id: Option<u64>) -> eyre::Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let client = aws_sdk_kms::Client::new(&config);
        Ok(Self(Arc::new(AwsSigner::new(client, key_id.to_string(), chain_id).await?)))
    }

    /// Returns the signer's Ethereum Address.
    pub fn address(&self) -> Address {
        TxSigner::address(&self.0)
    }

    /// Returns an [`EthereumWallet`] signing with this signer.
    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::new(self.0.clone())
    }
}

/// Whether `key` is meant as a hex private key rather than a KMS key id or alias.
fn is_hex_key(key: &str) -> bool {
    let key = key.trim();
    key.starts_with("0x") || (!key.is_empty() && key.chars().all(|c| c.is_ascii_hexdigit()))
}

impl Deref for DynSigner {
    type Target = dyn FullSigner<Signature> + Send + Sync;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}
