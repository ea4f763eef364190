//! In-memory chain nodes for tests.
//!
//! [`MockNode`] answers the JSON-RPC methods the executor uses, the way a node would: raw
//! transactions are decoded and checked for chain id, nonce and replacement fees, and their
//! outcome can be scripted per submission. [`MockConnector`] hands nodes to a
//! [`TransportPool`](crate::transport::TransportPool) in place of real endpoints.

use crate::{
    chains::ChainSpec,
    transport::Connector,
    wallet::{IWalletFactory, create2_salt, proxy_init_code},
};
use alloy::{
    consensus::{
        Transaction, TxEnvelope,
        transaction::{Recovered, SignerRecoverable},
    },
    eips::{Decodable2718, Typed2718},
    primitives::{Address, B256, Bloom, Bytes, ChainId, U64, U128, U256, address, keccak256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::{
        client::ClientBuilder,
        json_rpc::{
            ErrorPayload, Id, RequestPacket, Response, ResponsePacket, ResponsePayload,
            SerializedRequest,
        },
        types::{Transaction as RpcTransaction, TransactionRequest},
    },
    sol_types::SolCall,
    transports::{BoxTransport, TransportError, TransportErrorKind, TransportFut, TransportResult},
};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json, value::to_raw_value};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use tower::Service;
use url::Url;

/// Private key of the first well-known development account.
pub const OWNER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Wallet factory used by [`chain_spec`].
pub const FACTORY: Address = address!("0x00000000000000000000000000000000000fac70");

/// Wallet implementation used by [`chain_spec`].
pub const IMPLEMENTATION: Address = address!("0x000000000000000000000000000000000000a11c");

/// One gwei.
pub const GWEI: u128 = 1_000_000_000;

/// A chain spec with one endpoint, `http://node-{chain_id}.test`, and the test factory.
pub fn chain_spec(chain_id: ChainId) -> ChainSpec {
    ChainSpec::new(chain_id, vec![endpoint(chain_id)]).with_factory(FACTORY, IMPLEMENTATION)
}

/// The endpoint URL [`chain_spec`] uses for a chain.
pub fn endpoint(chain_id: ChainId) -> Url {
    format!("http://node-{chain_id}.test").parse().expect("valid url")
}

/// A provider talking to `node` directly.
pub fn provider(node: &MockNode) -> DynProvider {
    ProviderBuilder::new().connect_client(ClientBuilder::default().transport(node.clone(), true)).erased()
}

/// A transport calling a closure for every request.
pub struct RequestFn<F> {
    f: Arc<F>,
}

impl<F> Clone for RequestFn<F> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<F> fmt::Debug for RequestFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFn").finish_non_exhaustive()
    }
}

/// Creates a [`RequestFn`] transport.
pub fn request_fn<F>(f: F) -> RequestFn<F>
where
    F: Fn(RequestPacket) -> TransportFut<'static> + Send + Sync + 'static,
{
    RequestFn { f: Arc::new(f) }
}

impl<F> Service<RequestPacket> for RequestFn<F>
where
    F: Fn(RequestPacket) -> TransportFut<'static> + Send + Sync + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = TransportFut<'static>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        (self.f)(req)
    }
}

/// A successful response to a single request.
pub fn success_response<T: Serialize>(req: &RequestPacket, value: &T) -> ResponsePacket {
    let id = req.as_single().map(|req| req.id().clone()).unwrap_or(Id::None);
    ResponsePacket::Single(Response {
        id,
        payload: ResponsePayload::Success(to_raw_value(value).expect("serializable")),
    })
}

/// What happens to the next raw transaction a [`MockNode`] accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Mined successfully in a new block.
    Include,
    /// Mined in a new block with a failed status. Replaying the call returns the revert data.
    Revert(Bytes),
    /// Refused with the given error message.
    Reject(String),
    /// Accepted into the pool but never mined.
    Ignore,
}

#[derive(Debug, Clone)]
struct MinedTransaction {
    tx: TxEnvelope,
    from: Address,
    block_number: Option<u64>,
    receipt: Option<Value>,
}

#[derive(Debug)]
struct NodeState {
    block_number: u64,
    base_fee: u128,
    priority_fee: u128,
    gas_price: u128,
    blob_base_fee: u128,
    gas_estimate: u64,
    estimate_failures: usize,
    latency: Option<Duration>,
    unavailable: bool,
    balances: HashMap<Address, U256>,
    code: HashMap<Address, Bytes>,
    latest_nonces: HashMap<Address, u64>,
    pending_nonces: HashMap<Address, u64>,
    pool: HashMap<(Address, u64), B256>,
    transactions: HashMap<B256, MinedTransaction>,
    submitted: Vec<TxEnvelope>,
    outcomes: VecDeque<SubmitOutcome>,
    reverts: HashMap<Bytes, Bytes>,
    factories: HashMap<Address, Address>,
    calls: HashMap<String, usize>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            block_number: 1,
            base_fee: 10 * GWEI,
            priority_fee: 2 * GWEI,
            gas_price: 12 * GWEI,
            blob_base_fee: 1,
            gas_estimate: 100_000,
            estimate_failures: 0,
            latency: None,
            unavailable: false,
            balances: Default::default(),
            code: Default::default(),
            latest_nonces: Default::default(),
            pending_nonces: Default::default(),
            pool: Default::default(),
            transactions: Default::default(),
            submitted: Default::default(),
            outcomes: Default::default(),
            reverts: Default::default(),
            factories: Default::default(),
            calls: Default::default(),
        }
    }
}

/// An in-memory JSON-RPC node.
///
/// Clones share state, so a test keeps a clone to script and inspect the node a provider talks
/// to. Defaults: base fee 10 gwei, priority fee 2 gwei, gas price 12 gwei, gas estimate 100k,
/// every raw transaction included.
#[derive(Debug, Clone)]
pub struct MockNode {
    chain_id: ChainId,
    state: Arc<Mutex<NodeState>>,
}

impl MockNode {
    /// Creates a node serving `chain_id`.
    pub fn new(chain_id: ChainId) -> Self {
        Self { chain_id, state: Default::default() }
    }

    /// Creates a node that deploys wallets through the factory of `spec`.
    pub fn for_spec(spec: &ChainSpec) -> Self {
        let node = Self::new(spec.chain_id);
        node.state().factories.insert(spec.factory, spec.implementation);
        node
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The chain id this node reports.
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Sets the base fee of the latest block.
    pub fn set_base_fee(&self, base_fee: u128) {
        self.state().base_fee = base_fee;
    }

    /// Sets the `eth_maxPriorityFeePerGas` suggestion.
    pub fn set_priority_fee(&self, priority_fee: u128) {
        self.state().priority_fee = priority_fee;
    }

    /// Sets the `eth_gasPrice` suggestion.
    pub fn set_gas_price(&self, gas_price: u128) {
        self.state().gas_price = gas_price;
    }

    /// Sets the `eth_estimateGas` answer.
    pub fn set_gas_estimate(&self, gas: u64) {
        self.state().gas_estimate = gas;
    }

    /// Fails the next `count` gas estimates.
    pub fn fail_estimates(&self, count: usize) {
        self.state().estimate_failures = count;
    }

    /// Delays every answer.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Makes every request fail at the transport level.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Sets the native balance of an account.
    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    /// Sets the code of an account.
    pub fn set_code(&self, address: Address, code: impl Into<Bytes>) {
        self.state().code.insert(address, code.into());
    }

    /// Scripts the outcomes of the next raw transactions, in order. Once exhausted, transactions
    /// are included.
    pub fn script(&self, outcomes: impl IntoIterator<Item = SubmitOutcome>) {
        self.state().outcomes.extend(outcomes);
    }

    /// Simulates a transaction from `address` sent elsewhere, consuming its next nonce.
    pub fn consume_nonce(&self, address: Address) {
        let mut state = self.state();
        let next = state.latest_nonces.get(&address).copied().unwrap_or_default() + 1;
        state.latest_nonces.insert(address, next);
        let pending = state.pending_nonces.entry(address).or_default();
        *pending = (*pending).max(next);
        state.block_number += 1;
    }

    /// Number of times `method` was called.
    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or_default()
    }

    /// Raw transactions accepted by the node, in order.
    pub fn submitted(&self) -> Vec<TxEnvelope> {
        self.state().submitted.clone()
    }

    /// Whether the node has code at `address`.
    pub fn has_code(&self, address: Address) -> bool {
        self.state().code.get(&address).is_some_and(|code| !code.is_empty())
    }

    fn respond(&self, req: &SerializedRequest) -> Response {
        let params: Vec<Value> = req
            .params()
            .and_then(|params| serde_json::from_str(params.get()).ok())
            .unwrap_or_default();

        let payload = match self.dispatch(req.method(), &params) {
            Ok(value) => ResponsePayload::Success(to_raw_value(&value).expect("serializable")),
            Err(err) => ResponsePayload::Failure(err),
        };

        Response { id: req.id().clone(), payload }
    }

    fn dispatch(&self, method: &str, params: &[Value]) -> Result<Value, ErrorPayload> {
        let mut state = self.state();
        *state.calls.entry(method.to_string()).or_default() += 1;

        match method {
            "eth_chainId" => Ok(json!(U64::from(self.chain_id))),
            "eth_blockNumber" => Ok(json!(U64::from(state.block_number))),
            "eth_getTransactionCount" => {
                let address: Address = param(params, 0)?;
                let tag: String = param(params, 1).unwrap_or_else(|_| "latest".into());
                let latest = state.latest_nonces.get(&address).copied().unwrap_or_default();
                let nonce = if tag == "pending" {
                    state.pending_nonces.get(&address).copied().unwrap_or_default().max(latest)
                } else {
                    latest
                };
                Ok(json!(U64::from(nonce)))
            }
            "eth_feeHistory" => Ok(json!({
                "oldestBlock": U64::from(state.block_number),
                "baseFeePerGas": [U128::from(state.base_fee), U128::from(state.base_fee)],
                "gasUsedRatio": [0.5],
            })),
            "eth_maxPriorityFeePerGas" => Ok(json!(U128::from(state.priority_fee))),
            "eth_gasPrice" => Ok(json!(U128::from(state.gas_price))),
            "eth_blobBaseFee" => Ok(json!(U128::from(state.blob_base_fee))),
            "eth_estimateGas" => {
                if state.estimate_failures > 0 {
                    state.estimate_failures -= 1;
                    return Err(error(-32000, "execution aborted (timeout = 5s)"));
                }
                Ok(json!(U64::from(state.gas_estimate)))
            }
            "eth_createAccessList" => Ok(json!({
                "accessList": [],
                "gasUsed": U64::from(state.gas_estimate),
            })),
            "eth_getCode" => {
                let address: Address = param(params, 0)?;
                Ok(json!(state.code.get(&address).cloned().unwrap_or_default()))
            }
            "eth_getBalance" => {
                let address: Address = param(params, 0)?;
                Ok(json!(state.balances.get(&address).copied().unwrap_or_default()))
            }
            "eth_call" => {
                let request: TransactionRequest = param(params, 0)?;
                let input = request.input.input().cloned().unwrap_or_default();
                match state.reverts.get(&input) {
                    Some(data) => Err(ErrorPayload {
                        code: 3,
                        message: "execution reverted".into(),
                        data: Some(to_raw_value(data).expect("serializable")),
                    }),
                    None => Ok(json!(Bytes::new())),
                }
            }
            "eth_sendRawTransaction" => {
                let raw: Bytes = param(params, 0)?;
                self.submit(&mut state, raw).map(|hash| json!(hash))
            }
            "eth_getTransactionReceipt" => {
                let hash: B256 = param(params, 0)?;
                Ok(state.transactions.get(&hash).and_then(|tx| tx.receipt.clone()).unwrap_or(Value::Null))
            }
            "eth_getTransactionByHash" => {
                let hash: B256 = param(params, 0)?;
                Ok(state
                    .transactions
                    .get(&hash)
                    .map(|mined| {
                        let tx = RpcTransaction {
                            inner: Recovered::new_unchecked(mined.tx.clone(), mined.from),
                            block_hash: mined.block_number.map(|number| B256::from(U256::from(number))),
                            block_number: mined.block_number,
                            transaction_index: mined.block_number.map(|_| 0),
                            effective_gas_price: None,
                        };
                        serde_json::to_value(tx).expect("serializable transaction")
                    })
                    .unwrap_or(Value::Null))
            }
            _ => Err(error(-32601, format!("the method {method} does not exist"))),
        }
    }

    fn submit(&self, state: &mut NodeState, raw: Bytes) -> Result<B256, ErrorPayload> {
        let tx = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|err| error(-32602, format!("rlp: {err}")))?;
        let from = tx.recover_signer().map_err(|err| error(-32000, err.to_string()))?;
        let hash = *tx.tx_hash();
        let nonce = tx.nonce();

        if state.transactions.contains_key(&hash) {
            return Err(error(-32000, "already known"));
        }
        if tx.chain_id() != Some(self.chain_id) {
            return Err(error(-32000, "invalid chain id"));
        }
        if nonce < state.latest_nonces.get(&from).copied().unwrap_or_default() {
            return Err(error(-32000, "nonce too low"));
        }
        if let Some(replaced) = state.pool.get(&(from, nonce)).and_then(|hash| state.transactions.get(hash))
        {
            let replaced = &replaced.tx;
            let priority = |tx: &TxEnvelope| tx.max_priority_fee_per_gas().unwrap_or(tx.max_fee_per_gas());
            if tx.max_fee_per_gas() < replaced.max_fee_per_gas() * 110 / 100
                || priority(&tx) < priority(replaced) * 110 / 100
            {
                return Err(error(-32000, "replacement transaction underpriced"));
            }
        }

        let outcome = state.outcomes.pop_front().unwrap_or(SubmitOutcome::Include);
        if let SubmitOutcome::Reject(message) = outcome {
            return Err(error(-32000, message));
        }

        state.submitted.push(tx.clone());
        let pending = state.pending_nonces.entry(from).or_default();
        *pending = (*pending).max(nonce + 1);

        match outcome {
            SubmitOutcome::Ignore => {
                state.pool.insert((from, nonce), hash);
                state.transactions
                    .insert(hash, MinedTransaction { tx, from, block_number: None, receipt: None });
            }
            SubmitOutcome::Include => self.mine(state, tx, from, true),
            SubmitOutcome::Revert(data) => {
                state.reverts.insert(tx.input().clone(), data);
                self.mine(state, tx, from, false)
            }
            SubmitOutcome::Reject(_) => unreachable!("rejections return early"),
        }

        Ok(hash)
    }

    fn mine(&self, state: &mut NodeState, tx: TxEnvelope, from: Address, success: bool) {
        state.block_number += 1;
        let block_number = state.block_number;
        let hash = *tx.tx_hash();
        let nonce = tx.nonce();

        state.pool.remove(&(from, nonce));
        state.latest_nonces.insert(from, nonce + 1);

        if success
            && let Some(to) = tx.to()
            && let Some(implementation) = state.factories.get(&to).copied()
            && let Ok(call) = IWalletFactory::createAccountCall::abi_decode(tx.input())
        {
            let wallet = to.create2(
                create2_salt(call.owner, call.salt),
                keccak256(proxy_init_code(implementation)),
            );
            state.code.insert(wallet, proxy_init_code(implementation));
        }

        let gas_used = tx.gas_limit().min(state.gas_estimate);
        let receipt = json!({
            "type": format!("{:#x}", tx.ty()),
            "status": if success { "0x1" } else { "0x0" },
            "cumulativeGasUsed": U64::from(gas_used),
            "logs": [],
            "logsBloom": Bloom::ZERO,
            "transactionHash": hash,
            "transactionIndex": "0x0",
            "blockHash": B256::from(U256::from(block_number)),
            "blockNumber": U64::from(block_number),
            "gasUsed": U64::from(gas_used),
            "effectiveGasPrice": U128::from(tx.effective_gas_price(Some(state.base_fee as u64))),
            "from": from,
            "to": tx.to(),
            "contractAddress": null,
        });

        state.transactions.insert(
            hash,
            MinedTransaction { tx, from, block_number: Some(block_number), receipt: Some(receipt) },
        );
    }
}

fn param<T: DeserializeOwned>(params: &[Value], index: usize) -> Result<T, ErrorPayload> {
    params
        .get(index)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or_else(|| error(-32602, format!("invalid params: missing argument {index}")))
}

fn error(code: i64, message: impl Into<String>) -> ErrorPayload {
    ErrorPayload { code, message: message.into().into(), data: None }
}

impl Service<RequestPacket> for MockNode {
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = TransportFut<'static>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let (latency, unavailable) = {
                let state = this.state();
                (state.latency, state.unavailable)
            };
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if unavailable {
                return Err(TransportErrorKind::custom_str("connection refused"));
            }

            Ok(match req {
                RequestPacket::Single(req) => ResponsePacket::Single(this.respond(&req)),
                RequestPacket::Batch(reqs) => {
                    ResponsePacket::Batch(reqs.iter().map(|req| this.respond(req)).collect())
                }
            })
        })
    }
}

/// Connects endpoints to [`MockNode`]s and counts connections.
#[derive(Debug, Clone)]
pub struct MockConnector {
    default: MockNode,
    routes: Arc<Mutex<HashMap<String, MockNode>>>,
    refused: Arc<Mutex<HashSet<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Serves every endpoint with `node`.
    pub fn new(node: MockNode) -> Self {
        Self {
            default: node,
            routes: Default::default(),
            refused: Default::default(),
            connections: Default::default(),
        }
    }

    /// Serves the endpoint with the given host with `node`.
    pub fn route(&self, host: &str, node: MockNode) {
        self.routes.lock().unwrap_or_else(|p| p.into_inner()).insert(host.to_string(), node);
    }

    /// Refuses connections to the endpoint with the given host.
    pub fn refuse(&self, host: &str) {
        self.refused.lock().unwrap_or_else(|p| p.into_inner()).insert(host.to_string());
    }

    /// Accepts connections to a previously refused host again.
    pub fn accept(&self, host: &str) {
        self.refused.lock().unwrap_or_else(|p| p.into_inner()).remove(host);
    }

    /// Number of connection attempts so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> TransportResult<(BoxTransport, bool)> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let host = url.host_str().unwrap_or_default();

        if self.refused.lock().unwrap_or_else(|p| p.into_inner()).contains(host) {
            return Err(TransportErrorKind::custom_str(&format!("connection refused: {url}")));
        }

        let node = self
            .routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(host)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        Ok((BoxTransport::new(node), true))
    }
}
