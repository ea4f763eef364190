//! The execution façade.
//!
//! [`Executor`] is the entry point of the crate. It resolves the per-chain
//! [`ExecutionClient`], deploys the owner's smart wallet on first use and drives each call batch
//! through estimation, signing, submission and confirmation.

use crate::{
    builder::{CallRoute, PreparedTransaction, TransactionDraft},
    cache::{ClientCache, ExecutionClient},
    chains::{ChainSpec, ChainSpecs},
    config::{ExecutorConfig, WalletConfig},
    driver::SubmissionResult,
    error::{ExecutionError, RejectionReason},
    nonce::NonceManager,
    signers::DynSigner,
    transport::{Connector, RpcConnector, TransportPool},
    wallet::{CallIntent, deployment_call},
};
use alloy::{
    primitives::{Address, B256, ChainId, U256},
    providers::Provider,
};
use async_trait::async_trait;
use dashmap::DashMap;
use eyre::WrapErr;
use futures_util::{Stream, StreamExt};
use std::{collections::HashSet, fmt, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{info, instrument, warn};

/// Source of balances for pre-flight solvency checks.
#[async_trait]
pub trait BalanceSource: fmt::Debug + Send + Sync {
    /// Returns the balance of `address` in `token` on the chain, `None` being the native currency.
    async fn get_balance(
        &self,
        chain_id: ChainId,
        token: Option<Address>,
        address: Address,
    ) -> eyre::Result<U256>;
}

/// How a list of calls is turned into transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// All calls in one transaction.
    #[default]
    Batched,
    /// One transaction per call, in order, stopping at the first failure.
    Independent,
}

/// Options of [`Executor::execute_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// How calls are grouped into transactions.
    pub mode: ExecutionMode,
    /// Point in time after which nothing new is submitted and waiting for inclusion stops.
    pub deadline: Option<Instant>,
    /// How calls reach their targets.
    pub route: CallRoute,
}

impl ExecuteOptions {
    /// Sends one transaction per call.
    pub fn independent(mut self) -> Self {
        self.mode = ExecutionMode::Independent;
        self
    }

    /// Sends calls straight from the owner account.
    pub fn direct(mut self) -> Self {
        self.route = CallRoute::Direct;
        self
    }

    /// Sets the deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// Executes calls through the owner's smart wallet on any configured chain.
#[derive(Debug, Clone)]
pub struct Executor {
    specs: ChainSpecs,
    cache: ClientCache,
    nonces: NonceManager,
    locks: Arc<DashMap<(ChainId, Address), Arc<Mutex<()>>>>,
    balances: Option<Arc<dyn BalanceSource>>,
    owner: Address,
    wallet: WalletConfig,
}

impl Executor {
    /// Creates an executor connecting to the configured endpoints, with the owner key loaded
    /// from the configuration secrets.
    pub async fn new(config: ExecutorConfig) -> eyre::Result<Self> {
        let signer = DynSigner::load(&config.secrets.owner_key)
            .await
            .wrap_err("failed to load owner key")?;
        Ok(Self::with_connector(&config, signer, Arc::new(RpcConnector)))
    }

    /// Creates an executor using `connector` to reach chain endpoints.
    pub fn with_connector(
        config: &ExecutorConfig,
        signer: DynSigner,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let specs = ChainSpecs::new(config.chain_specs());
        let pool = TransportPool::new(specs.clone(), connector, &config.transactions);
        let owner = signer.address();
        let cache = ClientCache::new(
            specs.clone(),
            pool,
            signer,
            config.wallet.clone(),
            config.transactions.clone(),
        );

        Self {
            specs,
            cache,
            nonces: NonceManager::default(),
            locks: Default::default(),
            balances: None,
            owner,
            wallet: config.wallet.clone(),
        }
    }

    /// Checks wallet balances with `balances` before executing.
    pub fn with_balance_source(mut self, balances: Arc<dyn BalanceSource>) -> Self {
        self.balances = Some(balances);
        self
    }

    /// The chain spec resolver.
    pub fn chain_specs(&self) -> &ChainSpecs {
        &self.specs
    }

    /// The owner account.
    pub fn owner(&self) -> Address {
        self.owner
    }

    /// Returns the execution client of the chain.
    pub async fn get_client(&self, chain_id: ChainId) -> Result<Arc<ExecutionClient>, ExecutionError> {
        self.cache.get_or_create(chain_id).await
    }

    /// Returns the owner's smart wallet address on the chain.
    pub async fn get_wallet_address(&self, chain_id: ChainId) -> Result<Address, ExecutionError> {
        Ok(self.get_client(chain_id).await?.wallet_address())
    }

    /// Executes `calls` through the smart wallet in a single transaction, returning the hash of
    /// the included transaction.
    pub async fn execute(
        &self,
        chain_id: ChainId,
        calls: Vec<CallIntent>,
    ) -> Result<B256, ExecutionError> {
        let results = self.execute_with(chain_id, calls, ExecuteOptions::default()).await?;
        results
            .last()
            .map(|result| result.tx_hash)
            .ok_or_else(|| ExecutionError::invalid_calls(chain_id, "no calls"))
    }

    /// Executes `calls`, returning the result of every transaction sent, the wallet deployment
    /// included.
    #[instrument(skip_all, fields(%chain_id, calls = calls.len(), mode = ?options.mode))]
    pub async fn execute_with(
        &self,
        chain_id: ChainId,
        calls: Vec<CallIntent>,
        options: ExecuteOptions,
    ) -> Result<Vec<SubmissionResult>, ExecutionError> {
        if calls.is_empty() {
            return Err(ExecutionError::invalid_calls(chain_id, "no calls"));
        }
        check_deadline(chain_id, options.deadline)?;

        let client = self.get_client(chain_id).await?;

        let lock = self
            .locks
            .entry((chain_id, client.wallet_address()))
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let result = self.run(&client, &calls, &options).await;
        self.report(&client, &result);
        result
    }

    async fn run(
        &self,
        client: &ExecutionClient,
        calls: &[CallIntent],
        options: &ExecuteOptions,
    ) -> Result<Vec<SubmissionResult>, ExecutionError> {
        self.validate_targets(client, calls).await?;

        let mut results = Vec::with_capacity(calls.len() + 1);
        if options.route == CallRoute::Wallet {
            self.check_solvency(client, calls).await?;

            if !client.is_deployed().await? {
                info!(
                    chain_id = %client.chain_id(),
                    wallet = %client.wallet_address(),
                    "Deploying smart wallet"
                );
                let deployment = deployment_call(client.owner(), client.spec(), client.salt());
                let result = self
                    .send(client, std::slice::from_ref(&deployment), CallRoute::Direct, options.deadline)
                    .await?;
                client.mark_deployed();
                results.push(result);
            }
        }

        match options.mode {
            ExecutionMode::Batched => {
                results.push(self.send(client, calls, options.route, options.deadline).await?);
            }
            ExecutionMode::Independent => {
                for call in calls {
                    results.push(
                        self.send(client, std::slice::from_ref(call), options.route, options.deadline)
                            .await?,
                    );
                }
            }
        }

        Ok(results)
    }

    /// Estimates, signs and submits a single transaction, then waits for it.
    #[instrument(skip_all, fields(chain_id = %client.chain_id(), calls = calls.len(), ?route))]
    async fn send(
        &self,
        client: &ExecutionClient,
        calls: &[CallIntent],
        route: CallRoute,
        deadline: Option<Instant>,
    ) -> Result<SubmissionResult, ExecutionError> {
        let chain_id = client.chain_id();
        let owner = client.owner();
        check_deadline(chain_id, deadline)?;

        let draft = TransactionDraft::for_calls(
            chain_id,
            client.wallet_address(),
            calls,
            route,
            self.wallet.execution_overhead,
        )?;
        let fees = client.estimator().estimate_fees(client.spec(), &draft, owner).await?;
        let gas_limit = client.estimator().estimate_gas(&draft, owner, &client.spec().fees).await?;
        check_deadline(chain_id, deadline)?;

        let nonce = self
            .nonces
            .next(client.provider(), chain_id, owner)
            .await
            .map_err(|err| ExecutionError::from_query(chain_id, err))?;

        let prepared = PreparedTransaction { chain_id, from: owner, nonce, gas_limit, fees, draft };
        let signed = match prepared.sign(client.signer()).await {
            Ok(signed) => signed,
            Err(err) => {
                self.nonces.rollback(chain_id, owner, nonce).await;
                return Err(err);
            }
        };

        if let Err(err) = client.driver().submit(&signed).await {
            match &err {
                ExecutionError::SubmissionRejected { reason: RejectionReason::NonceTooLow, .. }
                | ExecutionError::ChainUnavailable { .. } => {
                    self.nonces.reset(chain_id, owner).await;
                }
                _ => {
                    self.nonces.rollback(chain_id, owner, nonce).await;
                }
            }
            return Err(err);
        }

        let result = client.driver().await_inclusion(signed, deadline).await;
        if let Err(ExecutionError::TransactionDropped { .. }) = &result {
            self.nonces.reset(chain_id, owner).await;
        }
        result
    }

    /// Rejects calls carrying data to addresses without code.
    async fn validate_targets(
        &self,
        client: &ExecutionClient,
        calls: &[CallIntent],
    ) -> Result<(), ExecutionError> {
        let chain_id = client.chain_id();
        let exempt = [client.spec().factory, client.wallet_address()];

        let mut checked = HashSet::new();
        for call in calls {
            if call.data.is_empty() || exempt.contains(&call.to) || !checked.insert(call.to) {
                continue;
            }

            let code = client
                .provider()
                .get_code_at(call.to)
                .await
                .map_err(|err| ExecutionError::from_query(chain_id, err))?;
            if code.is_empty() {
                return Err(ExecutionError::invalid_calls(
                    chain_id,
                    format!("call to {} carries data but the target has no code", call.to),
                ));
            }
        }
        Ok(())
    }

    /// Rejects calls the wallet cannot pay for, if a balance source is configured.
    async fn check_solvency(
        &self,
        client: &ExecutionClient,
        calls: &[CallIntent],
    ) -> Result<(), ExecutionError> {
        let Some(balances) = &self.balances else { return Ok(()) };

        let required = calls.iter().fold(U256::ZERO, |sum, call| sum.saturating_add(call.value));
        if required.is_zero() {
            return Ok(());
        }

        let chain_id = client.chain_id();
        let wallet = client.wallet_address();
        match balances.get_balance(chain_id, None, wallet).await {
            Ok(balance) if balance < required => Err(ExecutionError::SubmissionRejected {
                chain_id,
                tx_hash: None,
                reason: RejectionReason::InsufficientFunds,
                message: format!("wallet {wallet} holds {balance}, calls need {required}"),
            }),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(%chain_id, %wallet, %err, "Failed to fetch wallet balance, skipping check");
                Ok(())
            }
        }
    }

    fn report<T>(&self, client: &Arc<ExecutionClient>, result: &Result<T, ExecutionError>) {
        match result {
            Err(err) if err.is_unavailable() => self.cache.report_unavailable(client),
            Err(_) => {}
            Ok(_) => self.cache.report_success(client),
        }
    }

    /// Returns the status of a transaction, typically one that timed out.
    pub async fn transaction_status(
        &self,
        chain_id: ChainId,
        tx_hash: B256,
    ) -> Result<SubmissionResult, ExecutionError> {
        let client = self.get_client(chain_id).await?;
        let result = client.driver().status(tx_hash).await;
        self.report(&client, &result);
        result
    }

    /// Returns the native balance of `address` on the chain.
    pub async fn native_balance(
        &self,
        chain_id: ChainId,
        address: Address,
    ) -> Result<U256, ExecutionError> {
        let client = self.get_client(chain_id).await?;
        let result = client
            .provider()
            .get_balance(address)
            .await
            .map_err(|err| ExecutionError::from_query(chain_id, err));
        self.report(&client, &result);
        result
    }

    /// Replaces the chain specs, evicting the clients of chains whose spec changed.
    ///
    /// Returns the ids of the added, removed and changed chains.
    pub fn reload_chains(&self, specs: Vec<ChainSpec>) -> Vec<ChainId> {
        let changed = self.specs.replace(specs);
        for chain_id in &changed {
            self.cache.invalidate(*chain_id);
        }
        changed
    }

    /// Applies every chain spec update yielded by `updates` until the stream ends.
    pub fn follow_chains<S>(&self, updates: S) -> JoinHandle<()>
    where
        S: Stream<Item = Vec<ChainSpec>> + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let mut updates = std::pin::pin!(updates);
            while let Some(specs) = updates.next().await {
                this.reload_chains(specs);
            }
        })
    }
}

fn check_deadline(chain_id: ChainId, deadline: Option<Instant>) -> Result<(), ExecutionError> {
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(ExecutionError::DeadlineExceeded { chain_id });
    }
    Ok(())
}
