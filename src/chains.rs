//! Chain metadata and its resolver.

use crate::{config::FeeConfig, error::ExecutionError};
use alloy::primitives::{Address, B256, ChainId, map::HashMap};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::info;
use url::Url;

/// A transaction type a chain may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Pre-EIP-2718 transactions.
    Legacy,
    /// EIP-2930 access list transactions.
    Eip2930,
    /// EIP-1559 dynamic fee transactions.
    Eip1559,
    /// EIP-4844 blob transactions.
    Eip4844,
    /// EIP-7702 set code transactions.
    Eip7702,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Eip2930 => f.write_str("EIP-2930"),
            Self::Eip1559 => f.write_str("EIP-1559"),
            Self::Eip4844 => f.write_str("EIP-4844"),
            Self::Eip7702 => f.write_str("EIP-7702"),
        }
    }
}

fn default_tx_types() -> BTreeSet<TransactionType> {
    BTreeSet::from([TransactionType::Legacy, TransactionType::Eip1559])
}

const fn default_native_decimals() -> u8 {
    18
}

/// Immutable metadata of a configured chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    /// The chain ID. Taken from the key of the chain in the configuration.
    #[serde(skip)]
    pub chain_id: ChainId,
    /// The symbol of the native asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_symbol: Option<String>,
    /// Decimals of the native asset.
    #[serde(default = "default_native_decimals")]
    pub native_decimals: u8,
    /// Supported transaction types.
    #[serde(default = "default_tx_types")]
    pub tx_types: BTreeSet<TransactionType>,
    /// RPC endpoints, in failover order.
    pub endpoints: Vec<Url>,
    /// The smart wallet factory.
    #[serde(default)]
    pub factory: Address,
    /// The wallet implementation cloned by the factory.
    #[serde(default)]
    pub implementation: Address,
    /// Block explorer base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer: Option<Url>,
    /// Fee settings for this chain.
    #[serde(default)]
    pub fees: FeeConfig,
}

impl ChainSpec {
    /// Creates a spec with the default transaction types and fee settings.
    pub fn new(chain_id: ChainId, endpoints: Vec<Url>) -> Self {
        Self {
            chain_id,
            native_symbol: None,
            native_decimals: default_native_decimals(),
            tx_types: default_tx_types(),
            endpoints,
            factory: Address::ZERO,
            implementation: Address::ZERO,
            explorer: None,
            fees: FeeConfig::default(),
        }
    }

    /// Sets the supported transaction types.
    pub fn with_tx_types(mut self, tx_types: impl IntoIterator<Item = TransactionType>) -> Self {
        self.tx_types = tx_types.into_iter().collect();
        self
    }

    /// Sets the wallet factory and the implementation it clones.
    pub fn with_factory(mut self, factory: Address, implementation: Address) -> Self {
        self.factory = factory;
        self.implementation = implementation;
        self
    }

    /// Sets the fee settings.
    pub fn with_fees(mut self, fees: FeeConfig) -> Self {
        self.fees = fees;
        self
    }

    /// Sets the block explorer.
    pub fn with_explorer(mut self, explorer: Url) -> Self {
        self.explorer = Some(explorer);
        self
    }

    /// Whether the chain accepts transactions of the given type.
    pub fn supports(&self, tx_type: TransactionType) -> bool {
        self.tx_types.contains(&tx_type)
    }

    /// Human readable chain name.
    pub fn name(&self) -> String {
        alloy_chains::Chain::from_id(self.chain_id).to_string()
    }

    /// Symbol of the native asset, falling back to the well-known symbol of the chain.
    pub fn native_symbol(&self) -> &str {
        self.native_symbol
            .as_deref()
            .or_else(|| {
                alloy_chains::Chain::from_id(self.chain_id)
                    .named()
                    .and_then(|chain| chain.native_currency_symbol())
            })
            .unwrap_or("ETH")
    }

    /// Link to a transaction on the block explorer, if one is configured.
    pub fn explorer_tx_url(&self, tx_hash: B256) -> Option<Url> {
        self.explorer.as_ref().and_then(|base| base.join(&format!("tx/{tx_hash}")).ok())
    }
}

type Snapshot = Arc<HashMap<ChainId, Arc<ChainSpec>>>;

/// Resolves chain ids to their [`ChainSpec`].
///
/// Updates replace the whole set at once: a reader observes either the old or the new set,
/// never a mix of both.
#[derive(Debug, Clone)]
pub struct ChainSpecs {
    current: Arc<watch::Sender<Snapshot>>,
}

impl ChainSpecs {
    /// Creates a new resolver from the given specs.
    pub fn new(specs: impl IntoIterator<Item = ChainSpec>) -> Self {
        let (current, _) = watch::channel(Self::snapshot_of(specs));
        Self { current: Arc::new(current) }
    }

    fn snapshot_of(specs: impl IntoIterator<Item = ChainSpec>) -> Snapshot {
        Arc::new(specs.into_iter().map(|spec| (spec.chain_id, Arc::new(spec))).collect())
    }

    /// Returns the spec of the chain.
    pub fn resolve(&self, chain_id: ChainId) -> Result<Arc<ChainSpec>, ExecutionError> {
        self.current.borrow().get(&chain_id).cloned().ok_or(ExecutionError::UnknownChain(chain_id))
    }

    /// Returns the configured chain ids.
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<_> = self.current.borrow().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Replaces all specs, returning the ids of chains that were added, removed or changed.
    pub fn replace(&self, specs: impl IntoIterator<Item = ChainSpec>) -> Vec<ChainId> {
        let next = Self::snapshot_of(specs);
        let previous = self.current.send_replace(next.clone());

        let mut changed: Vec<_> = previous
            .iter()
            .filter(|(id, spec)| next.get(*id) != Some(*spec))
            .map(|(id, _)| *id)
            .chain(next.keys().filter(|id| !previous.contains_key(*id)).copied())
            .collect();
        changed.sort_unstable();

        info!(chains = next.len(), ?changed, "Replaced chain specs");
        changed
    }

    /// Subscribes to spec updates.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.current.subscribe()
    }

    /// Applies every update yielded by `updates` until the stream ends.
    pub fn follow<S>(&self, updates: S) -> JoinHandle<()>
    where
        S: Stream<Item = Vec<ChainSpec>> + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let mut updates = std::pin::pin!(updates);
            while let Some(specs) = updates.next().await {
                this.replace(specs);
            }
        })
    }
}
