//! Discovery events and where they go.
//!
//! Peers announce new blocks and refused transactions through some
//! subscription transport. Whatever the transport, it produces
//! [`DiscoveryEvent`]s on an mpsc channel; the [`EventRouter`] forwards
//! block hashes to the block parser queue and invalid transactions to the
//! mempool checker. [`BestBlockPoller`] is a transport that needs nothing
//! but [`PeerRpc`]: it polls the best block hash and announces changes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::chain::BlockParser;
use crate::crypto::Hash256;
use crate::mempool::{InvalidTx, MempoolChecker};
use crate::rpc::{with_timeout, PeerRpc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    BlockHashDiscovered(Hash256),
    InvalidTxDetected(InvalidTx),
}

pub struct EventRouter {
    parser: Arc<BlockParser>,
    checker: Arc<MempoolChecker>,
}

impl EventRouter {
    pub fn new(parser: Arc<BlockParser>, checker: Arc<MempoolChecker>) -> Self {
        Self { parser, checker }
    }

    pub fn route(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::BlockHashDiscovered(hash) => {
                debug!(hash = %hash, "block announced");
                self.parser.enqueue(hash);
            }
            DiscoveryEvent::InvalidTxDetected(invalid) => {
                if let Err(e) = self.checker.process_invalid_tx(&invalid) {
                    warn!(tx = %invalid.tx_hash, error = %e, "could not record invalid transaction");
                }
            }
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<DiscoveryEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("discovery router stopped");
    }
}

/// Polls the peers' best block hash and announces every change.
pub struct BestBlockPoller {
    rpc: Arc<dyn PeerRpc>,
    interval: Duration,
    request_timeout: Duration,
    last: Option<Hash256>,
}

impl BestBlockPoller {
    pub fn new(rpc: Arc<dyn PeerRpc>, interval: Duration, request_timeout: Duration) -> Self {
        Self {
            rpc,
            interval,
            request_timeout,
            last: None,
        }
    }

    /// One poll. Returns the hash when it differs from the previous one.
    pub async fn poll(&mut self) -> Option<Hash256> {
        match with_timeout(self.request_timeout, self.rpc.get_best_block_hash()).await {
            Ok(hash) if self.last != Some(hash) => {
                self.last = Some(hash);
                Some(hash)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "best block poll failed");
                None
            }
        }
    }

    pub async fn run(mut self, events: mpsc::Sender<DiscoveryEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(hash) = self.poll().await {
                        if events.send(DiscoveryEvent::BlockHashDiscovered(hash)).await.is_err() {
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("best block poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{BlockHeaderInfo, BlockStream, RawTxSubmission, RpcError, RpcResult, SubmitOutcome};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    struct Tip(Mutex<Option<Hash256>>);

    #[async_trait]
    impl PeerRpc for Tip {
        async fn get_block_as_stream(&self, _hash: &Hash256) -> RpcResult<BlockStream> {
            Err(RpcError::NoNodes)
        }
        async fn get_block_header(&self, _hash: &Hash256) -> RpcResult<BlockHeaderInfo> {
            Err(RpcError::NoNodes)
        }
        async fn get_raw_mempool(&self) -> RpcResult<HashSet<Hash256>> {
            Ok(HashSet::new())
        }
        async fn send_raw_transactions(&self, _txs: &[RawTxSubmission]) -> RpcResult<Vec<SubmitOutcome>> {
            Ok(Vec::new())
        }
        async fn get_best_block_hash(&self) -> RpcResult<Hash256> {
            self.0.lock().ok_or(RpcError::Disconnected("no tip".into()))
        }
    }

    #[tokio::test]
    async fn poller_reports_only_changes() {
        let tip = Arc::new(Tip(Mutex::new(None)));
        let mut poller = BestBlockPoller::new(tip.clone(), Duration::from_secs(1), Duration::from_secs(1));

        assert_eq!(poller.poll().await, None);
        *tip.0.lock() = Some(Hash256([1; 32]));
        assert_eq!(poller.poll().await, Some(Hash256([1; 32])));
        assert_eq!(poller.poll().await, None);
        *tip.0.lock() = Some(Hash256([2; 32]));
        assert_eq!(poller.poll().await, Some(Hash256([2; 32])));
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let tip = Arc::new(Tip(Mutex::new(Some(Hash256([1; 32])))));
        let poller = BestBlockPoller::new(tip, Duration::from_millis(10), Duration::from_secs(1));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(poller.run(events_tx, stop_rx));
        assert_eq!(
            events_rx.recv().await,
            Some(DiscoveryEvent::BlockHashDiscovered(Hash256([1; 32])))
        );
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
