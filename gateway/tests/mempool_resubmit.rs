//! Mempool checker integration tests against the mock peer.

mod common;

use common::{harness, harness_with, FailBeforeCommit};
use mapi_gateway::chain::RawTx;
use mapi_gateway::config::GatewayConfig;
use mapi_gateway::crypto::Hash256;
use mapi_gateway::faults::FaultPoint;
use mapi_gateway::mempool::MempoolChecker;
use mapi_gateway::rpc::SubmitOutcome;
use mapi_gateway::storage::{OutPoint, TxStatus, TxStore};
use std::sync::Arc;

fn spend(tag: u32) -> RawTx {
    RawTx::spending(&[OutPoint::new(Hash256([0xf0; 32]), tag)], tag)
}

#[tokio::test]
async fn mined_transactions_are_not_resubmitted() {
    let h = harness();
    let mined = spend(1);
    let lost = spend(2);
    h.track(&mined);
    h.track(&lost);
    let b1 = h.mine(Hash256::ZERO, 1, 1, vec![mined]);
    h.parser.process_block(&b1).await.unwrap();

    assert!(h.checker().check_mempool_and_resubmit_txs(100).await);
    assert_eq!(*h.peer.submitted.lock(), vec![lost.txid()]);
}

#[tokio::test]
async fn missing_inputs_exhaust_after_configured_retries() {
    let h = harness();
    let tx = spend(1);
    let id = h.track(&tx);
    *h.peer.verdict.lock() = Some(SubmitOutcome::MissingInputs);
    let checker = h.checker();
    let retries = h.config.mempool_checker.missing_inputs_retries;

    for _ in 0..retries {
        assert!(checker.check_mempool_and_resubmit_txs(100).await);
        assert_eq!(h.db.get_tx(id).unwrap().unwrap().status, TxStatus::Accepted);
    }
    assert!(checker.check_mempool_and_resubmit_txs(100).await);
    assert_eq!(
        h.db.get_tx(id).unwrap().unwrap().status,
        TxStatus::MissingInputsMaxRetriesReached
    );

    let attempts = h.peer.submitted.lock().len();
    assert_eq!(attempts, retries as usize + 1);
    assert!(checker.check_mempool_and_resubmit_txs(100).await);
    assert_eq!(h.peer.submitted.lock().len(), attempts);
}

#[tokio::test]
async fn fault_before_commit_keeps_transaction_missing() {
    let h = harness_with(GatewayConfig::default(), None);
    let tx = spend(1);
    let id = h.track(&tx);
    let before = h.db.get_tx(id).unwrap().unwrap().submitted_at;
    let checker = MempoolChecker::new(
        Arc::new(h.db.clone()),
        h.peer.clone(),
        h.status.clone(),
        &h.config,
    )
    .with_faults(FailBeforeCommit::new(FaultPoint::MempoolResubmit, 1));

    // The peer accepted it but the bookkeeping write never happened.
    assert!(checker.check_mempool_and_resubmit_txs(100).await);
    assert_eq!(h.db.get_tx(id).unwrap().unwrap().submitted_at, before);

    // Next pass resubmits and records it; the pass after finds it fresh.
    assert!(checker.check_mempool_and_resubmit_txs(100).await);
    assert!(h.db.get_tx(id).unwrap().unwrap().submitted_at > before);
    assert!(checker.check_mempool_and_resubmit_txs(100).await);
    assert_eq!(h.peer.submitted.lock().len(), 2);
}

#[tokio::test]
async fn transactions_in_peer_mempool_are_left_alone() {
    let h = harness();
    let tx = spend(1);
    h.track(&tx);
    h.peer.mempool.lock().insert(tx.txid());

    assert!(h.checker().check_mempool_and_resubmit_txs(100).await);
    assert!(h.peer.submitted.lock().is_empty());
}
