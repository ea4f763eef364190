//! End-to-end execution against in-memory chains.

use alloy::{
    consensus::{Transaction, TxType, Typed2718},
    primitives::{Address, B256, Bytes, ChainId, U256},
    sol_types::{Revert, SolError},
};
use chain_executor::{
    ExecuteOptions, Executor,
    chains::{ChainSpec, TransactionType},
    config::{ExecutorConfig, TransactionServiceConfig},
    driver::SubmissionStatus,
    error::{ExecutionError, RejectionReason},
    signers::DynSigner,
    test_utils::{GWEI, MockConnector, MockNode, OWNER_KEY, SubmitOutcome, chain_spec},
    wallet::{CallIntent, derive_address},
};
use std::{sync::Arc, time::Duration};

const TARGET: Address = Address::repeat_byte(0x42);

struct Setup {
    executor: Executor,
    connector: MockConnector,
    nodes: Vec<MockNode>,
}

impl Setup {
    fn new(specs: Vec<ChainSpec>) -> Self {
        Self::with_config(specs, transactions())
    }

    fn with_config(specs: Vec<ChainSpec>, transactions: TransactionServiceConfig) -> Self {
        let nodes: Vec<_> = specs.iter().map(MockNode::for_spec).collect();
        let connector = MockConnector::new(nodes[0].clone());
        for node in &nodes {
            connector.route(&format!("node-{}.test", node.chain_id()), node.clone());
        }

        let config = specs
            .into_iter()
            .fold(ExecutorConfig::default(), ExecutorConfig::with_chain)
            .with_transactions(transactions);
        let executor = Executor::with_connector(
            &config,
            DynSigner::from_signing_key(OWNER_KEY).unwrap(),
            Arc::new(connector.clone()),
        );

        Self { executor, connector, nodes }
    }

    fn node(&self, chain_id: ChainId) -> &MockNode {
        self.nodes.iter().find(|node| node.chain_id() == chain_id).unwrap()
    }

    fn wallet(&self, chain_id: ChainId) -> Address {
        derive_address(self.executor.owner(), &chain_spec(chain_id), B256::ZERO)
    }

    /// Marks the wallet of the chain as deployed.
    fn deploy(&self, chain_id: ChainId) {
        self.node(chain_id).set_code(self.wallet(chain_id), Bytes::from_static(&[0xfe]));
    }
}

fn transactions() -> TransactionServiceConfig {
    TransactionServiceConfig {
        poll_interval: Duration::from_millis(100),
        inclusion_timeout: Duration::from_secs(2),
        max_bumps: 3,
        estimation_retry_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn call() -> CallIntent {
    CallIntent::transfer(TARGET, U256::from(1))
}

#[tokio::test]
async fn fills_eip1559_fees() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.deploy(1);

    let tx_hash = setup.executor.execute(1, vec![call()]).await.unwrap();

    let submitted = setup.node(1).submitted();
    assert_eq!(submitted.len(), 1);
    let tx = &submitted[0];
    assert_eq!(*tx.tx_hash(), tx_hash);
    assert_eq!(tx.ty(), u8::from(TxType::Eip1559));
    assert_eq!(tx.max_fee_per_gas(), 22 * GWEI);
    assert_eq!(tx.max_priority_fee_per_gas(), Some(2 * GWEI));
    assert_eq!(tx.chain_id(), Some(1));
    // 100k estimate plus the 20% margin.
    assert_eq!(tx.gas_limit(), 120_000);
    assert_eq!(tx.to(), Some(setup.wallet(1)));
    assert!(tx.value().is_zero());
}

#[tokio::test]
async fn legacy_chains_get_a_gas_price() {
    let setup = Setup::new(vec![chain_spec(56).with_tx_types([TransactionType::Legacy])]);
    setup.deploy(56);

    setup.executor.execute(56, vec![call()]).await.unwrap();

    let tx = &setup.node(56).submitted()[0];
    assert_eq!(tx.ty(), u8::from(TxType::Legacy));
    assert_eq!(tx.gas_price(), Some(12 * GWEI));
    assert_eq!(tx.chain_id(), Some(56));
}

#[tokio::test]
async fn access_list_chains_use_eip2930() {
    let setup = Setup::new(vec![chain_spec(7).with_tx_types([TransactionType::Eip2930])]);
    setup.deploy(7);

    setup.executor.execute(7, vec![call()]).await.unwrap();

    let tx = &setup.node(7).submitted()[0];
    assert_eq!(tx.ty(), u8::from(TxType::Eip2930));
    assert_eq!(setup.node(7).calls("eth_createAccessList"), 1);
}

#[tokio::test]
async fn concurrent_first_use_connects_once() {
    let setup = Setup::new(vec![chain_spec(10)]);

    let (first, second) = tokio::join!(
        setup.executor.execute(10, vec![call()]),
        setup.executor.execute(10, vec![call()]),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(setup.connector.connections(), 1);
    // The deployment runs once, both batches follow it.
    let nonces: Vec<_> = setup.node(10).submitted().iter().map(|tx| tx.nonce()).collect();
    assert_eq!(nonces, vec![0, 1, 2]);
}

#[tokio::test]
async fn clients_are_shared() {
    let setup = Setup::new(vec![chain_spec(1), chain_spec(10)]);

    let clients = futures::future::join_all((0..16).map(|i| {
        let executor = setup.executor.clone();
        async move { executor.get_client(if i % 2 == 0 { 1 } else { 10 }).await.unwrap() }
    }))
    .await;

    for client in &clients {
        let first = clients.iter().find(|other| other.chain_id() == client.chain_id()).unwrap();
        assert!(Arc::ptr_eq(client, first));
    }
    assert_eq!(setup.connector.connections(), 2);
}

#[tokio::test]
async fn nonce_too_low_is_not_retried() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.deploy(1);
    setup.node(1).script([SubmitOutcome::Reject("nonce too low".into())]);

    let err = setup.executor.execute(1, vec![call()]).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::SubmissionRejected { chain_id: 1, reason: RejectionReason::NonceTooLow, .. }
    ));
    assert!(err.tx_hash().is_some());
    assert!(!err.is_retryable());
    assert_eq!(setup.node(1).calls("eth_sendRawTransaction"), 1);
    assert!(setup.node(1).submitted().is_empty());

    // The counter resynchronises from the chain.
    setup.executor.execute(1, vec![call()]).await.unwrap();
    assert_eq!(setup.node(1).submitted()[0].nonce(), 0);
}

#[tokio::test(start_paused = true)]
async fn bumps_fees_until_exhausted() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.deploy(1);
    setup.node(1).script([const { SubmitOutcome::Ignore }; 4]);

    let err = setup.executor.execute(1, vec![call()]).await.unwrap_err();
    let ExecutionError::ConfirmationTimeout { chain_id, tx_hash, bumps } = err else {
        panic!("expected timeout, got {err:?}")
    };
    assert_eq!(chain_id, 1);
    assert_eq!(bumps, 3);

    let submitted = setup.node(1).submitted();
    assert_eq!(submitted.len(), 4);
    assert_eq!(*submitted[3].tx_hash(), tx_hash);
    for pair in submitted.windows(2) {
        assert_eq!(pair[0].nonce(), pair[1].nonce());
        assert!(pair[1].max_fee_per_gas() * 10 >= pair[0].max_fee_per_gas() * 11);
    }

    // The last replacement is still pending and can be looked up.
    let status = setup.executor.transaction_status(1, tx_hash).await.unwrap();
    assert_eq!(status.status, SubmissionStatus::Pending);
}

#[tokio::test]
async fn deploys_the_wallet_first() {
    let setup = Setup::new(vec![chain_spec(1)]);
    let wallet = setup.wallet(1);
    assert_eq!(setup.executor.get_wallet_address(1).await.unwrap(), wallet);
    assert!(!setup.node(1).has_code(wallet));

    let results = setup
        .executor
        .execute_with(1, vec![call()], ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.status == SubmissionStatus::Included));
    assert_eq!(results[0].nonce, Some(0));
    assert_eq!(results[1].nonce, Some(1));

    let submitted = setup.node(1).submitted();
    assert_eq!(submitted[0].to(), Some(chain_spec(1).factory));
    assert_eq!(submitted[1].to(), Some(wallet));

    assert!(setup.node(1).has_code(wallet));
    let client = setup.executor.get_client(1).await.unwrap();
    assert!(client.is_deployed().await.unwrap());

    // Later calls go straight to the wallet.
    setup.executor.execute(1, vec![call()]).await.unwrap();
    assert_eq!(setup.node(1).submitted().len(), 3);
}

#[tokio::test]
async fn reverts_are_decoded_and_final() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.deploy(1);
    let data = Bytes::from(Revert { reason: "insufficient allowance".into() }.abi_encode());
    setup.node(1).script([SubmitOutcome::Revert(data.clone())]);

    let err = setup.executor.execute(1, vec![call()]).await.unwrap_err();
    let ExecutionError::ExecutionReverted { reason, data: revert_data, .. } = &err else {
        panic!("expected revert, got {err:?}")
    };
    assert_eq!(reason.as_deref(), Some("insufficient allowance"));
    assert_eq!(revert_data.as_ref(), Some(&data));
    assert_eq!(setup.node(1).submitted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn detects_dropped_transactions() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.deploy(1);
    let node = setup.node(1).clone();
    node.script([SubmitOutcome::Ignore]);

    let executor = setup.executor.clone();
    let execution = tokio::spawn(async move { executor.execute(1, vec![call()]).await });

    // Another sender takes the nonce while the transaction waits.
    while node.submitted().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    node.consume_nonce(setup.executor.owner());

    let err = execution.await.unwrap().unwrap_err();
    assert!(matches!(err, ExecutionError::TransactionDropped { chain_id: 1, .. }));

    // The next execution starts from the chain's nonce.
    setup.executor.execute(1, vec![call()]).await.unwrap();
    assert_eq!(node.submitted().last().unwrap().nonce(), 1);
}

#[tokio::test]
async fn independent_calls_get_consecutive_nonces() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.deploy(1);

    let results = setup
        .executor
        .execute_with(1, vec![call(), call(), call()], ExecuteOptions::default().independent())
        .await
        .unwrap();
    assert_eq!(results.iter().map(|result| result.nonce).collect::<Vec<_>>(), [
        Some(0),
        Some(1),
        Some(2)
    ]);

    let next = setup.executor.execute(1, vec![call(), call()]).await.unwrap();
    let submitted = setup.node(1).submitted();
    assert_eq!(submitted.len(), 4);
    assert_eq!(*submitted[3].tx_hash(), next);
    assert_eq!(submitted[3].nonce(), 3);
}

#[tokio::test]
async fn estimation_is_retried_once() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.deploy(1);

    setup.node(1).fail_estimates(1);
    setup.executor.execute(1, vec![call()]).await.unwrap();

    setup.node(1).fail_estimates(2);
    let err = setup.executor.execute(1, vec![call()]).await.unwrap_err();
    assert!(matches!(err, ExecutionError::EstimationFailed { chain_id: 1, .. }));
    assert!(err.is_retryable());
    assert_eq!(setup.node(1).submitted().len(), 1);
}

#[tokio::test]
async fn unknown_chains_are_rejected() {
    let setup = Setup::new(vec![chain_spec(1)]);
    let err = setup.executor.execute(5, vec![call()]).await.unwrap_err();
    assert!(matches!(err, ExecutionError::UnknownChain(5)));
    assert_eq!(setup.connector.connections(), 0);
}

#[tokio::test]
async fn unreachable_chains_are_rebuilt_after_the_budget() {
    let setup = Setup::with_config(
        vec![chain_spec(1)],
        TransactionServiceConfig { unavailable_failure_budget: 2, ..transactions() },
    );
    setup.deploy(1);
    let client = setup.executor.get_client(1).await.unwrap();

    setup.node(1).set_unavailable(true);
    for _ in 0..2 {
        let err = setup.executor.native_balance(1, TARGET).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    setup.node(1).set_unavailable(false);
    let rebuilt = setup.executor.get_client(1).await.unwrap();
    assert!(!Arc::ptr_eq(&client, &rebuilt));
    assert_eq!(setup.connector.connections(), 2);
}

#[tokio::test]
async fn reload_evicts_changed_chains() {
    let setup = Setup::new(vec![chain_spec(1), chain_spec(10)]);
    let mainnet = setup.executor.get_client(1).await.unwrap();
    let optimism = setup.executor.get_client(10).await.unwrap();

    let changed = setup
        .executor
        .reload_chains(vec![chain_spec(1), chain_spec(10).with_tx_types([TransactionType::Legacy])]);
    assert_eq!(changed, vec![10]);

    assert!(Arc::ptr_eq(&mainnet, &setup.executor.get_client(1).await.unwrap()));
    let reloaded = setup.executor.get_client(10).await.unwrap();
    assert!(!Arc::ptr_eq(&optimism, &reloaded));
    assert!(!reloaded.spec().supports(TransactionType::Eip1559));

    setup.executor.reload_chains(vec![chain_spec(1)]);
    assert!(matches!(
        setup.executor.get_client(10).await,
        Err(ExecutionError::UnknownChain(10))
    ));
}

#[tokio::test(start_paused = true)]
async fn reload_during_construction_uses_the_new_endpoints() {
    let setup = Setup::new(vec![chain_spec(1)]);
    setup.node(1).set_latency(Duration::from_millis(50));
    let moved_node = MockNode::new(1);
    setup.connector.route("node-moved.test", moved_node.clone());

    let constructing = tokio::spawn({
        let executor = setup.executor.clone();
        async move { executor.get_client(1).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut moved = chain_spec(1);
    moved.endpoints = vec!["http://node-moved.test".parse().unwrap()];
    assert_eq!(setup.executor.reload_chains(vec![moved.clone()]), vec![1]);
    constructing.await.unwrap().unwrap();

    let client = setup.executor.get_client(1).await.unwrap();
    assert_eq!(client.spec().endpoints, moved.endpoints);

    let (old, new) = (setup.node(1).calls("eth_getBalance"), moved_node.calls("eth_getBalance"));
    setup.executor.native_balance(1, TARGET).await.unwrap();
    assert_eq!(setup.node(1).calls("eth_getBalance"), old);
    assert_eq!(moved_node.calls("eth_getBalance"), new + 1);
}

#[tokio::test]
async fn wallet_addresses_follow_the_factory() {
    let other = chain_spec(10).with_factory(Address::repeat_byte(0xfa), chain_spec(10).implementation);
    let setup = Setup::new(vec![chain_spec(1), chain_spec(8453), other]);

    let mainnet = setup.executor.get_wallet_address(1).await.unwrap();
    assert_eq!(setup.executor.get_wallet_address(8453).await.unwrap(), mainnet);
    assert_ne!(setup.executor.get_wallet_address(10).await.unwrap(), mainnet);
}
