//! [`PeerRpc`] over every registered node.
//!
//! Each call is bounded by the configured request timeout. Single-answer
//! calls (block, header, best hash) fail over node by node; the mempool is
//! the union of every node that answered; submissions go to all nodes and
//! the per-transaction verdicts are merged. A call only fails when no node
//! produced an answer.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::nodes::{Node, NodeRepository};
use super::{
    with_timeout, BlockHeaderInfo, BlockStream, PeerRpc, RawTxSubmission, RpcError, RpcResult,
    SubmitOutcome,
};
use crate::crypto::Hash256;

/// Builds a client for one node.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Arc<dyn PeerRpc>;
}

pub struct RpcMultiClient {
    nodes: Arc<NodeRepository>,
    connector: Arc<dyn PeerConnector>,
    request_timeout: Duration,
}

impl RpcMultiClient {
    pub fn new(
        nodes: Arc<NodeRepository>,
        connector: Arc<dyn PeerConnector>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            nodes,
            connector,
            request_timeout,
        }
    }

    fn peers(&self) -> RpcResult<Vec<(String, Arc<dyn PeerRpc>)>> {
        let nodes = self.nodes.list();
        if nodes.is_empty() {
            return Err(RpcError::NoNodes);
        }
        Ok(nodes
            .iter()
            .map(|node| (node.id(), self.connector.connect(node)))
            .collect())
    }

    /// Run one peer call under the timeout and remember failures.
    async fn bounded<T, Fut>(&self, node_id: &str, fut: Fut) -> RpcResult<T>
    where
        Fut: Future<Output = RpcResult<T>>,
    {
        let result = with_timeout(self.request_timeout, fut).await;
        if let Err(e) = &result {
            warn!(node = node_id, error = %e, "peer call failed");
            if let Err(store_err) = self.nodes.record_error(node_id, &e.to_string()) {
                debug!(node = node_id, error = %store_err, "could not record node error");
            }
        }
        result
    }
}

#[async_trait]
impl PeerRpc for RpcMultiClient {
    async fn get_block_as_stream(&self, hash: &Hash256) -> RpcResult<BlockStream> {
        let mut last_err = RpcError::NoNodes;
        for (id, peer) in self.peers()? {
            match self.bounded(&id, peer.get_block_as_stream(hash)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn get_block_header(&self, hash: &Hash256) -> RpcResult<BlockHeaderInfo> {
        let mut last_err = RpcError::NoNodes;
        for (id, peer) in self.peers()? {
            match self.bounded(&id, peer.get_block_header(hash)).await {
                Ok(header) => return Ok(header),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn get_raw_mempool(&self) -> RpcResult<HashSet<Hash256>> {
        let peers = self.peers()?;
        let results = join_all(
            peers
                .iter()
                .map(|(id, peer)| self.bounded(id, peer.get_raw_mempool())),
        )
        .await;

        let mut union = HashSet::new();
        let mut answered = false;
        let mut last_err = RpcError::NoNodes;
        for result in results {
            match result {
                Ok(ids) => {
                    answered = true;
                    union.extend(ids);
                }
                Err(e) => last_err = e,
            }
        }
        if answered {
            Ok(union)
        } else {
            Err(last_err)
        }
    }

    async fn send_raw_transactions(&self, txs: &[RawTxSubmission]) -> RpcResult<Vec<SubmitOutcome>> {
        let peers = self.peers()?;
        let results = join_all(
            peers
                .iter()
                .map(|(id, peer)| self.bounded(id, peer.send_raw_transactions(txs))),
        )
        .await;

        let mut merged: Option<Vec<SubmitOutcome>> = None;
        let mut last_err = RpcError::NoNodes;
        for result in results {
            let outcomes = match result {
                Ok(o) if o.len() == txs.len() => o,
                Ok(o) => {
                    last_err = RpcError::Malformed(format!(
                        "expected {} outcomes, got {}",
                        txs.len(),
                        o.len()
                    ));
                    continue;
                }
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            merged = Some(match merged {
                None => outcomes,
                Some(prev) => prev
                    .into_iter()
                    .zip(outcomes)
                    .map(|(a, b)| a.merge(b))
                    .collect(),
            });
        }
        merged.ok_or(last_err)
    }

    async fn get_best_block_hash(&self) -> RpcResult<Hash256> {
        let mut last_err = RpcError::NoNodes;
        for (id, peer) in self.peers()? {
            match self.bounded(&id, peer.get_best_block_hash()).await {
                Ok(hash) => return Ok(hash),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GatewayDb;
    use std::collections::HashMap;

    /// A peer with a fixed mempool and fixed submit verdict, or one that
    /// never answers.
    struct FixedPeer {
        mempool: Vec<u8>,
        verdict: SubmitOutcome,
        hang: bool,
    }

    #[async_trait]
    impl PeerRpc for FixedPeer {
        async fn get_block_as_stream(&self, _hash: &Hash256) -> RpcResult<BlockStream> {
            Err(RpcError::Disconnected("no blocks here".into()))
        }

        async fn get_block_header(&self, hash: &Hash256) -> RpcResult<BlockHeaderInfo> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(BlockHeaderInfo {
                hash: *hash,
                prev_hash: Hash256::ZERO,
                height: 1,
                time: 0,
            })
        }

        async fn get_raw_mempool(&self) -> RpcResult<HashSet<Hash256>> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(self.mempool.iter().map(|n| Hash256([*n; 32])).collect())
        }

        async fn send_raw_transactions(&self, txs: &[RawTxSubmission]) -> RpcResult<Vec<SubmitOutcome>> {
            Ok(vec![self.verdict.clone(); txs.len()])
        }

        async fn get_best_block_hash(&self) -> RpcResult<Hash256> {
            Ok(Hash256::ZERO)
        }
    }

    struct Fixed(HashMap<String, Arc<FixedPeer>>);

    impl PeerConnector for Fixed {
        fn connect(&self, node: &Node) -> Arc<dyn PeerRpc> {
            self.0[&node.id()].clone()
        }
    }

    fn client(peers: Vec<(&str, FixedPeer)>) -> (RpcMultiClient, Arc<NodeRepository>, GatewayDb) {
        let db = GatewayDb::open_temporary().unwrap();
        let nodes = Arc::new(NodeRepository::open(db.open_tree("nodes").unwrap()).unwrap());
        let mut map = HashMap::new();
        for (host, peer) in peers {
            let node = Node::new(host, 8332);
            map.insert(node.id(), Arc::new(peer));
            nodes.add(node).unwrap();
        }
        let multi = RpcMultiClient::new(nodes.clone(), Arc::new(Fixed(map)), Duration::from_millis(50));
        (multi, nodes, db)
    }

    fn peer(mempool: Vec<u8>, verdict: SubmitOutcome, hang: bool) -> FixedPeer {
        FixedPeer { mempool, verdict, hang }
    }

    #[tokio::test]
    async fn no_nodes_is_an_error() {
        let (multi, _, _db) = client(vec![]);
        assert_eq!(multi.get_raw_mempool().await.unwrap_err(), RpcError::NoNodes);
    }

    #[tokio::test]
    async fn mempool_is_union_of_answering_peers() {
        let (multi, nodes, _db) = client(vec![
            ("a", peer(vec![1, 2], SubmitOutcome::Accepted, false)),
            ("b", peer(vec![2, 3], SubmitOutcome::Accepted, false)),
            ("c", peer(vec![9], SubmitOutcome::Accepted, true)),
        ]);
        let mempool = multi.get_raw_mempool().await.unwrap();
        assert_eq!(mempool.len(), 3);
        assert!(!mempool.contains(&Hash256([9; 32])));
        assert!(nodes.get("c:8332").unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn timeout_on_every_peer_fails_the_call() {
        let (multi, _, _db) = client(vec![("a", peer(vec![1], SubmitOutcome::Accepted, true))]);
        assert!(matches!(multi.get_raw_mempool().await, Err(RpcError::Timeout(_))));
        assert!(matches!(multi.get_block_header(&Hash256::ZERO).await, Err(RpcError::Timeout(_))));
    }

    #[tokio::test]
    async fn submissions_are_merged_across_peers() {
        let (multi, _, _db) = client(vec![
            ("a", peer(vec![], SubmitOutcome::MissingInputs, false)),
            ("b", peer(vec![], SubmitOutcome::AlreadyKnown, false)),
        ]);
        let txs = vec![RawTxSubmission {
            hash: Hash256([1; 32]),
            payload: vec![1],
        }];
        let outcomes = multi.send_raw_transactions(&txs).await.unwrap();
        assert_eq!(outcomes, vec![SubmitOutcome::AlreadyKnown]);
    }
}
