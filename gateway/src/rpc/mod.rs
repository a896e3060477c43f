//! # Peer RPC
//!
//! The gateway talks to its trusted peer nodes only through [`PeerRpc`].
//! The node binary provides the JSON-RPC implementation for a single peer;
//! [`RpcMultiClient`] fans the same contract out over every registered node.
//!
//! ```text
//! nodes.rs: NodeRepository: the registered peers, persisted in sled
//! multi.rs: RpcMultiClient: timeouts, fail-over and mempool union
//! ```

pub mod multi;
pub mod nodes;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::crypto::Hash256;

pub use multi::{PeerConnector, RpcMultiClient};
pub use nodes::{Node, NodeError, NodeRepository};

/// Errors raised by a peer call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer disconnected: {0}")]
    Disconnected(String),

    #[error("node returned error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no nodes are registered")]
    NoNodes,
}

pub type RpcResult<T> = Result<T, RpcError>;

/// A streamed block body.
pub type BlockStream = Box<dyn AsyncRead + Send + Unpin>;

/// Header fields the chain tracker needs when walking ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderInfo {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
    /// Block time, seconds since the epoch.
    pub time: u32,
}

/// A transaction to (re)submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTxSubmission {
    pub hash: Hash256,
    pub payload: Vec<u8>,
}

/// A mempool transaction a rejected submission collided with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollidedTx {
    pub hash: Hash256,
    pub payload: Option<Vec<u8>>,
}

/// Peer verdict on one submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    AlreadyKnown,
    MissingInputs,
    Rejected {
        reason: String,
        collided_with: Vec<CollidedTx>,
    },
}

impl SubmitOutcome {
    /// Preference when merging verdicts from several peers: the most
    /// favourable one wins.
    fn rank(&self) -> u8 {
        match self {
            SubmitOutcome::Accepted => 3,
            SubmitOutcome::AlreadyKnown => 2,
            SubmitOutcome::Rejected { .. } => 1,
            SubmitOutcome::MissingInputs => 0,
        }
    }

    /// Combine two verdicts for the same transaction.
    pub fn merge(self, other: SubmitOutcome) -> SubmitOutcome {
        match (self, other) {
            (
                SubmitOutcome::Rejected {
                    reason,
                    mut collided_with,
                },
                SubmitOutcome::Rejected {
                    collided_with: more,
                    ..
                },
            ) => {
                for tx in more {
                    if !collided_with.iter().any(|c| c.hash == tx.hash) {
                        collided_with.push(tx);
                    }
                }
                SubmitOutcome::Rejected {
                    reason,
                    collided_with,
                }
            }
            (a, b) => {
                if b.rank() > a.rank() {
                    b
                } else {
                    a
                }
            }
        }
    }
}

/// Bound a peer call by `limit`; an elapsed timer becomes
/// [`RpcError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> RpcResult<T>
where
    F: Future<Output = RpcResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(limit)),
    }
}

#[async_trait]
pub trait PeerRpc: Send + Sync {
    /// Stream the serialized block body.
    async fn get_block_as_stream(&self, hash: &Hash256) -> RpcResult<BlockStream>;

    async fn get_block_header(&self, hash: &Hash256) -> RpcResult<BlockHeaderInfo>;

    async fn get_raw_mempool(&self) -> RpcResult<HashSet<Hash256>>;

    /// Submit a batch. Outcomes are aligned with `txs`.
    async fn send_raw_transactions(&self, txs: &[RawTxSubmission]) -> RpcResult<Vec<SubmitOutcome>>;

    async fn get_best_block_hash(&self) -> RpcResult<Hash256>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(hashes: &[u8]) -> SubmitOutcome {
        SubmitOutcome::Rejected {
            reason: "txn-mempool-conflict".into(),
            collided_with: hashes
                .iter()
                .map(|n| CollidedTx {
                    hash: Hash256([*n; 32]),
                    payload: None,
                })
                .collect(),
        }
    }

    #[test]
    fn merge_prefers_acceptance() {
        assert_eq!(
            SubmitOutcome::MissingInputs.merge(SubmitOutcome::Accepted),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            SubmitOutcome::AlreadyKnown.merge(SubmitOutcome::MissingInputs),
            SubmitOutcome::AlreadyKnown
        );
        assert_eq!(rejected(&[1]).merge(SubmitOutcome::AlreadyKnown), SubmitOutcome::AlreadyKnown);
    }

    #[test]
    fn merge_unions_collisions() {
        match rejected(&[1, 2]).merge(rejected(&[2, 3])) {
            SubmitOutcome::Rejected { collided_with, .. } => assert_eq!(collided_with.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
