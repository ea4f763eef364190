//! Lazily constructed per-chain execution clients.
//!
//! A client is built the first time a chain is used and then shared by every caller. Concurrent
//! first uses of the same chain wait on a single construction; a failed construction is handed
//! to all of them and leaves nothing cached.

use crate::{
    chains::{ChainSpec, ChainSpecs},
    config::{TransactionServiceConfig, WalletConfig},
    driver::Driver,
    error::ExecutionError,
    fees::FeeEstimator,
    metrics::ClientCacheMetrics,
    signers::DynSigner,
    transport::TransportPool,
    wallet::{derive_address, is_deployed},
};
use alloy::{
    network::EthereumWallet,
    primitives::{Address, B256, ChainId},
    providers::DynProvider,
};
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};
use tracing::{debug, info, instrument, warn};

/// Everything needed to execute on a single chain.
#[derive(Debug)]
pub struct ExecutionClient {
    chain_id: ChainId,
    spec: Arc<ChainSpec>,
    provider: DynProvider,
    owner: Address,
    wallet_address: Address,
    salt: B256,
    signer: EthereumWallet,
    estimator: FeeEstimator,
    driver: Driver,
    deployed: AtomicBool,
    failures: AtomicU32,
}

impl ExecutionClient {
    /// The chain of this client.
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// The chain spec the client was built from.
    pub fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    /// The chain's provider.
    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    /// The owner account.
    pub fn owner(&self) -> Address {
        self.owner
    }

    /// The smart wallet of the owner on this chain.
    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    /// The salt the wallet address was derived with.
    pub fn salt(&self) -> B256 {
        self.salt
    }

    /// The owner's signing wallet.
    pub fn signer(&self) -> &EthereumWallet {
        &self.signer
    }

    /// Fee and gas estimation for this chain.
    pub fn estimator(&self) -> &FeeEstimator {
        &self.estimator
    }

    /// Submission and confirmation for this chain.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Whether the smart wallet has code.
    ///
    /// Once observed deployed, the chain is not asked again.
    pub async fn is_deployed(&self) -> Result<bool, ExecutionError> {
        if self.deployed.load(Ordering::Acquire) {
            return Ok(true);
        }

        let deployed = is_deployed(&self.provider, self.wallet_address)
            .await
            .map_err(|err| ExecutionError::unavailable(self.chain_id, err))?;
        if deployed {
            self.mark_deployed();
        }
        Ok(deployed)
    }

    /// Records that the smart wallet was deployed.
    pub fn mark_deployed(&self) {
        self.deployed.store(true, Ordering::Release);
    }
}

type Construction = Shared<BoxFuture<'static, Result<Arc<ExecutionClient>, ExecutionError>>>;

#[derive(Clone)]
enum Slot {
    Ready(Arc<ExecutionClient>),
    Constructing(Construction),
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(client) => f.debug_tuple("Ready").field(&client.chain_id).finish(),
            Self::Constructing(_) => f.write_str("Constructing"),
        }
    }
}

/// Caches one [`ExecutionClient`] per chain.
#[derive(Debug, Clone)]
pub struct ClientCache {
    specs: ChainSpecs,
    pool: TransportPool,
    signer: DynSigner,
    wallet: WalletConfig,
    config: TransactionServiceConfig,
    entries: Arc<DashMap<ChainId, Slot>>,
    metrics: ClientCacheMetrics,
}

impl ClientCache {
    /// Creates an empty [`ClientCache`].
    pub fn new(
        specs: ChainSpecs,
        pool: TransportPool,
        signer: DynSigner,
        wallet: WalletConfig,
        config: TransactionServiceConfig,
    ) -> Self {
        Self {
            specs,
            pool,
            signer,
            wallet,
            config,
            entries: Default::default(),
            metrics: ClientCacheMetrics::default(),
        }
    }

    /// Returns the client of the chain, constructing it if needed.
    ///
    /// Callers racing on a chain share the same construction.
    pub async fn get_or_create(
        &self,
        chain_id: ChainId,
    ) -> Result<Arc<ExecutionClient>, ExecutionError> {
        let construction = match self.entries.entry(chain_id) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(client) => return Ok(client.clone()),
                Slot::Constructing(construction) => construction.clone(),
            },
            Entry::Vacant(entry) => {
                let construction = self.clone().construct(chain_id).boxed().shared();
                entry.insert(Slot::Constructing(construction.clone()));
                construction
            }
        };

        // The map shard is unlocked here, construction runs without holding it.
        let result = construction.clone().await;
        self.settle(chain_id, &construction, &result);
        result
    }

    /// Replaces the slot of an ongoing construction with its outcome.
    ///
    /// Only the construction that produced `result` is touched, a newer one started after an
    /// invalidation stays.
    fn settle(
        &self,
        chain_id: ChainId,
        construction: &Construction,
        result: &Result<Arc<ExecutionClient>, ExecutionError>,
    ) {
        if let Entry::Occupied(mut entry) = self.entries.entry(chain_id)
            && let Slot::Constructing(current) = entry.get()
            && current.ptr_eq(construction)
        {
            match result {
                Ok(client) => {
                    entry.insert(Slot::Ready(client.clone()));
                }
                Err(_) => {
                    entry.remove();
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn construct(self, chain_id: ChainId) -> Result<Arc<ExecutionClient>, ExecutionError> {
        let result = self.try_construct(chain_id).await;
        match &result {
            Ok(client) => {
                self.metrics.constructed.increment(1);
                info!(
                    %chain_id,
                    chain = %client.spec.name(),
                    wallet = %client.wallet_address,
                    "Constructed execution client"
                );
            }
            Err(err) => {
                self.metrics.construction_failed.increment(1);
                warn!(%chain_id, %err, "Failed to construct execution client");
            }
        }
        result
    }

    async fn try_construct(&self, chain_id: ChainId) -> Result<Arc<ExecutionClient>, ExecutionError> {
        let spec = self.specs.resolve(chain_id)?;
        let provider = self.pool.connection(chain_id).await?;
        let owner = self.signer.address();
        let signer = self.signer.wallet();
        let wallet_address = derive_address(owner, &spec, self.wallet.salt);

        let deployed = is_deployed(&provider, wallet_address)
            .await
            .map_err(|err| ExecutionError::unavailable(chain_id, err))?;
        debug!(%chain_id, %wallet_address, deployed, "Resolved smart wallet");

        Ok(Arc::new(ExecutionClient {
            chain_id,
            estimator: FeeEstimator::new(
                chain_id,
                provider.clone(),
                self.config.estimation_retry_backoff,
            ),
            driver: Driver::new(
                chain_id,
                provider.clone(),
                signer.clone(),
                self.config.clone(),
                spec.fees.clone(),
            ),
            spec,
            provider,
            owner,
            wallet_address,
            salt: self.wallet.salt,
            signer,
            deployed: AtomicBool::new(deployed),
            failures: AtomicU32::new(0),
        }))
    }

    /// Records an unavailability failure of `client`.
    ///
    /// Once the chain's failure budget is spent the client and its transport are dropped, the next
    /// use rebuilds them.
    pub fn report_unavailable(&self, client: &Arc<ExecutionClient>) {
        let failures = client.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.config.unavailable_failure_budget {
            debug!(chain_id = %client.chain_id, failures, "Chain unavailable");
            return;
        }

        let removed = self
            .entries
            .remove_if(&client.chain_id, |_, slot| {
                matches!(slot, Slot::Ready(cached) if Arc::ptr_eq(cached, client))
            })
            .is_some();
        if removed {
            self.pool.evict(client.chain_id);
            self.metrics.invalidated.increment(1);
            warn!(chain_id = %client.chain_id, failures, "Evicted unavailable execution client");
        }
    }

    /// Resets the failure count of `client`.
    pub fn report_success(&self, client: &ExecutionClient) {
        client.failures.store(0, Ordering::Release);
    }

    /// Drops the cached client and transport of the chain.
    ///
    /// Returns true if a client was cached. Callers holding the old client keep using it.
    pub fn invalidate(&self, chain_id: ChainId) -> bool {
        let removed = self.entries.remove(&chain_id).is_some();
        self.pool.evict(chain_id);
        if removed {
            self.metrics.invalidated.increment(1);
            info!(%chain_id, "Invalidated execution client");
        }
        removed
    }

    /// Chains with a constructed client.
    pub fn cached_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .map(|entry| *entry.key())
            .collect();
        chains.sort_unstable();
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{MockConnector, MockNode, OWNER_KEY, chain_spec},
    };
    use std::time::Duration;

    fn cache(chains: &[ChainId], connector: &MockConnector) -> ClientCache {
        let specs = ChainSpecs::new(chains.iter().map(|chain_id| chain_spec(*chain_id)));
        let config = TransactionServiceConfig {
            unavailable_failure_budget: 2,
            ..Default::default()
        };
        let pool = TransportPool::new(specs.clone(), Arc::new(connector.clone()), &config);
        ClientCache::new(
            specs,
            pool,
            DynSigner::from_signing_key(OWNER_KEY).unwrap(),
            WalletConfig::default(),
            config,
        )
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_construction() {
        let node = MockNode::new(1);
        node.set_latency(Duration::from_millis(20));
        let connector = MockConnector::new(node);
        let cache = cache(&[1], &connector);

        let clients =
            futures::future::join_all((0..32).map(|_| cache.get_or_create(1))).await;
        let clients: Vec<_> = clients.into_iter().map(Result::unwrap).collect();

        assert_eq!(connector.connections(), 1);
        assert!(clients.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(cache.cached_chains(), vec![1]);
    }

    #[tokio::test]
    async fn derives_the_wallet_address() {
        let connector = MockConnector::new(MockNode::new(1));
        let cache = cache(&[1], &connector);

        let client = cache.get_or_create(1).await.unwrap();
        let owner = DynSigner::from_signing_key(OWNER_KEY).unwrap().address();
        assert_eq!(client.owner(), owner);
        assert_eq!(client.wallet_address(), derive_address(owner, &chain_spec(1), B256::ZERO));
        assert!(!client.is_deployed().await.unwrap());
    }

    #[tokio::test]
    async fn failed_construction_is_not_cached() {
        let connector = MockConnector::new(MockNode::new(1));
        connector.refuse("node-1.test");
        let cache = cache(&[1], &connector);

        let (first, second) = tokio::join!(cache.get_or_create(1), cache.get_or_create(1));
        assert!(first.unwrap_err().is_unavailable());
        assert!(second.unwrap_err().is_unavailable());
        assert!(cache.cached_chains().is_empty());

        // A later call retries from scratch.
        connector.accept("node-1.test");
        assert!(cache.get_or_create(1).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_chain() {
        let connector = MockConnector::new(MockNode::new(1));
        let cache = cache(&[1], &connector);
        assert!(matches!(cache.get_or_create(5).await, Err(ExecutionError::UnknownChain(5))));
        assert_eq!(connector.connections(), 0);
    }

    #[tokio::test]
    async fn evicts_after_failure_budget() {
        let connector = MockConnector::new(MockNode::new(1));
        let cache = cache(&[1], &connector);
        let client = cache.get_or_create(1).await.unwrap();

        cache.report_unavailable(&client);
        assert!(Arc::ptr_eq(&client, &cache.get_or_create(1).await.unwrap()));

        cache.report_unavailable(&client);
        assert!(cache.cached_chains().is_empty());

        let rebuilt = cache.get_or_create(1).await.unwrap();
        assert!(!Arc::ptr_eq(&client, &rebuilt));
        assert_eq!(connector.connections(), 2);
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let connector = MockConnector::new(MockNode::new(1));
        let cache = cache(&[1], &connector);
        let client = cache.get_or_create(1).await.unwrap();

        cache.report_unavailable(&client);
        cache.report_success(&client);
        cache.report_unavailable(&client);
        assert_eq!(cache.cached_chains(), vec![1]);
    }

    #[tokio::test]
    async fn invalidate_rebuilds() {
        let connector = MockConnector::new(MockNode::new(1));
        let cache = cache(&[1], &connector);
        let client = cache.get_or_create(1).await.unwrap();

        assert!(cache.invalidate(1));
        assert!(!cache.invalidate(1));
        let rebuilt = cache.get_or_create(1).await.unwrap();
        assert!(!Arc::ptr_eq(&client, &rebuilt));
    }
}
