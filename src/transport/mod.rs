//! Per-chain JSON-RPC transports with sticky failover.
//!
//! The [`TransportPool`] owns one provider per chain. Each provider talks to a
//! [`FailoverService`] spanning the chain's configured endpoints, every endpoint being bounded by
//! a [`TimeoutLayer`].

use crate::{chains::ChainSpecs, config::TransactionServiceConfig, error::ExecutionError};
use alloy::{
    primitives::ChainId,
    providers::{DynProvider, Provider, ProviderBuilder, WsConnect},
    pubsub::PubSubConnect,
    rpc::client::{BuiltInConnectionString, ClientBuilder},
    transports::{
        BoxTransport, Transport, TransportConnect, TransportErrorKind, TransportResult,
        layers::RetryBackoffLayer,
    },
};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tower::Layer;
use tracing::{debug, info, warn};
use url::Url;

pub mod error;

mod failover;
pub use failover::FailoverService;

mod timeout;
pub use timeout::{TimeoutLayer, TimeoutService};

/// [`RetryBackoffLayer`] used for chain providers.
///
/// We are allowing max 10 retries with a backoff of 800ms. The CU/s is set to max value to avoid
/// any throttling.
pub const RETRY_LAYER: RetryBackoffLayer = RetryBackoffLayer::new(10, 800, u64::MAX);

/// Creates a [`BoxTransport`] from a [`Url`].
///
/// Returns the transport and a boolean indicating if the transport is local.
pub async fn create_transport(url: &Url) -> TransportResult<(BoxTransport, bool)> {
    let url = BuiltInConnectionString::from_str(url.as_str())?;
    let is_local = url.is_local();

    let transport = match url {
        BuiltInConnectionString::Ws(url, auth) => WsConnect::new(url.as_str())
            .with_auth_opt(auth)
            // Configure max number of retries to prevent provider from becoming useless
            .with_max_retries(u32::MAX)
            .into_service()
            .await?
            .boxed(),
        _ => url.connect_boxed().await?,
    };

    Ok((transport, is_local))
}

/// Opens a transport to a single endpoint.
#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync {
    /// Connects to `url`, returning the transport and whether the endpoint is local.
    async fn connect(&self, url: &Url) -> TransportResult<(BoxTransport, bool)>;
}

/// Connects to HTTP(S), WS(S) and IPC endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcConnector;

#[async_trait]
impl Connector for RpcConnector {
    async fn connect(&self, url: &Url) -> TransportResult<(BoxTransport, bool)> {
        create_transport(url).await
    }
}

/// A provider and the endpoints it was connected to.
#[derive(Debug, Clone)]
struct Connection {
    endpoints: Vec<Url>,
    provider: DynProvider,
}

/// Owns one connected provider per chain.
#[derive(Debug, Clone)]
pub struct TransportPool {
    specs: ChainSpecs,
    connector: Arc<dyn Connector>,
    providers: Arc<DashMap<ChainId, Connection>>,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl TransportPool {
    /// Creates a new [`TransportPool`].
    pub fn new(
        specs: ChainSpecs,
        connector: Arc<dyn Connector>,
        config: &TransactionServiceConfig,
    ) -> Self {
        Self {
            specs,
            connector,
            providers: Default::default(),
            request_timeout: config.request_timeout,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Returns the provider of the chain, connecting to its endpoints on first use.
    ///
    /// Fails with [`ExecutionError::ChainUnavailable`] if no endpoint can be reached or the
    /// endpoints serve a different chain.
    ///
    /// A provider is only reused while the chain's endpoints are unchanged, and one connected to
    /// endpoints that were replaced in the meantime is returned without being cached.
    pub async fn connection(&self, chain_id: ChainId) -> Result<DynProvider, ExecutionError> {
        let spec = self.specs.resolve(chain_id)?;
        if let Some(cached) = self.providers.get(&chain_id)
            && cached.endpoints == spec.endpoints
        {
            return Ok(cached.provider.clone());
        }

        let mut transports = Vec::with_capacity(spec.endpoints.len());
        let mut all_local = true;
        let mut last_error = None;
        for endpoint in &spec.endpoints {
            let connected =
                tokio::time::timeout(self.connect_timeout, self.connector.connect(endpoint))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportErrorKind::custom_str(&format!(
                            "connection timeout: {endpoint}"
                        )))
                    });

            match connected {
                Ok((transport, is_local)) => {
                    all_local &= is_local;
                    let timeout =
                        TimeoutLayer::new(self.request_timeout, chain_id, endpoint.clone());
                    transports.push(BoxTransport::new(timeout.layer(transport)));
                }
                Err(err) => {
                    warn!(%chain_id, endpoint = endpoint.host_str().unwrap_or_default(), %err, "Failed to connect to endpoint");
                    last_error = Some(err);
                }
            }
        }

        if transports.is_empty() {
            let err = last_error.unwrap_or_else(|| {
                TransportErrorKind::custom_str(&format!("no endpoints configured for chain {chain_id}"))
            });
            return Err(ExecutionError::unavailable(chain_id, err));
        }

        let client = ClientBuilder::default()
            .layer(RETRY_LAYER)
            .transport(FailoverService::new(chain_id, transports), all_local);
        let provider = ProviderBuilder::new().connect_client(client).erased();

        let reported = provider
            .get_chain_id()
            .await
            .map_err(|err| ExecutionError::unavailable(chain_id, err))?;
        if reported != chain_id {
            return Err(ExecutionError::unavailable(
                chain_id,
                TransportErrorKind::custom_str(&format!(
                    "endpoints of chain {chain_id} serve chain {reported}"
                )),
            ));
        }

        info!(%chain_id, endpoints = spec.endpoints.len(), "Connected to chain");

        let current = self.specs.resolve(chain_id).ok();
        if current.is_none_or(|current| current.endpoints != spec.endpoints) {
            debug!(%chain_id, "Endpoints changed while connecting, not caching the transport");
            return Ok(provider);
        }

        match self.providers.entry(chain_id) {
            Entry::Occupied(entry) if entry.get().endpoints == spec.endpoints => {
                Ok(entry.get().provider.clone())
            }
            entry => {
                entry.insert(Connection { endpoints: spec.endpoints.clone(), provider: provider.clone() });
                Ok(provider)
            }
        }
    }

    /// Drops the provider of the chain, the next [`TransportPool::connection`] reconnects.
    pub fn evict(&self, chain_id: ChainId) -> bool {
        let evicted = self.providers.remove(&chain_id).is_some();
        if evicted {
            debug!(%chain_id, "Evicted chain transport");
        }
        evicted
    }
}
