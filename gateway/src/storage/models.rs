//! Row types persisted by the gateway store.
//!
//! These are the records the pipeline reads and writes through
//! [`TxStore`](super::TxStore). Internal ids (`BlockId`, `TxId`) are assigned
//! by the store on insert and never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{Hash256, MerkleBranch};

/// Store-assigned block id.
pub type BlockId = u64;

/// Store-assigned transaction id.
pub type TxId = u64;

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// A block the gateway has observed, parsed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
    pub on_active_chain: bool,
    pub block_time: DateTime<Utc>,
    pub parsed_for_merkle_at: Option<DateTime<Utc>>,
    pub parsed_for_ds_at: Option<DateTime<Utc>>,
}

impl Block {
    /// Both the merkle-proof and the double-spend pass have completed.
    pub fn is_fully_parsed(&self) -> bool {
        self.parsed_for_merkle_at.is_some() && self.parsed_for_ds_at.is_some()
    }
}

/// Header data for `insert_or_update_block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlock {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
    pub on_active_chain: bool,
    pub block_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Lifecycle of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    NotPresentInDb,
    NodeRejected,
    SentToNode,
    UnknownOldTx,
    Accepted,
    MissingInputsMaxRetriesReached,
}

impl TxStatus {
    /// Statuses under which a peer mempool is expected to hold the tx.
    pub fn expects_mempool_presence(self) -> bool {
        matches!(self, TxStatus::Accepted | TxStatus::SentToNode)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::NotPresentInDb => "NotPresentInDb",
            TxStatus::NodeRejected => "NodeRejected",
            TxStatus::SentToNode => "SentToNode",
            TxStatus::UnknownOldTx => "UnknownOldTx",
            TxStatus::Accepted => "Accepted",
            TxStatus::MissingInputsMaxRetriesReached => "MissingInputsMaxRetriesReached",
        };
        f.write_str(s)
    }
}

/// Where callbacks for a transaction are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackTarget {
    pub url: String,
    /// Sent as the `Authorization` header when present.
    pub token: Option<String>,
    /// Encryption scheme requested by the subscriber, passed through as-is.
    pub encryption: Option<String>,
}

impl CallbackTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            encryption: None,
        }
    }
}

/// A previous output: `(prev tx hash, prev n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: Hash256,
    pub n: u32,
}

impl OutPoint {
    pub fn new(tx_hash: Hash256, n: u32) -> Self {
        Self { tx_hash, n }
    }

    /// The coinbase input's null outpoint.
    pub fn is_null(&self) -> bool {
        self.tx_hash == Hash256::ZERO && self.n == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.n)
    }
}

/// One input of a tracked transaction: an edge of the spend graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub n: u32,
    pub prev: OutPoint,
}

/// A tracked transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub id: TxId,
    pub hash: Hash256,
    /// Raw serialized transaction. Dropped once no longer needed.
    pub payload: Option<Vec<u8>>,
    pub status: TxStatus,
    pub received_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub merkle_proof: bool,
    pub ds_check: bool,
    pub unconfirmed_ancestor: bool,
    pub callback: Option<CallbackTarget>,
    pub policy_quote_id: Option<u64>,
    pub missing_inputs_retries: u32,
}

/// Input to `insert_or_update_txs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTx {
    pub hash: Hash256,
    pub payload: Option<Vec<u8>>,
    pub status: TxStatus,
    pub received_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub merkle_proof: bool,
    pub ds_check: bool,
    pub callback: Option<CallbackTarget>,
    pub policy_quote_id: Option<u64>,
    pub inputs: Vec<TxInput>,
}

impl NewTx {
    /// A freshly submitted transaction with no callbacks requested.
    pub fn submitted(hash: Hash256, payload: Vec<u8>, at: DateTime<Utc>) -> Self {
        Self {
            hash,
            payload: Some(payload),
            status: TxStatus::Accepted,
            received_at: at,
            submitted_at: at,
            merkle_proof: false,
            ds_check: false,
            callback: None,
            policy_quote_id: None,
            inputs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notification rows
// ---------------------------------------------------------------------------

/// A transaction's inclusion in one specific block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBlock {
    pub tx_id: TxId,
    pub block_id: BlockId,
    pub merkle_branch: Option<MerkleBranch>,
    pub sent_merkle_proof_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// A tracked transaction double-spent by a transaction mined in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBlockDoubleSpend {
    pub tx_id: TxId,
    pub block_id: BlockId,
    pub ds_tx_hash: Hash256,
    pub ds_tx_payload: Option<Vec<u8>>,
    pub sent_ds_notification_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// A tracked transaction conflicting with another transaction in a mempool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMempoolDoubleSpendAttempt {
    pub tx_id: TxId,
    pub ds_tx_hash: Hash256,
    pub ds_tx_payload: Option<Vec<u8>>,
    pub sent_ds_notification_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// What a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    MerkleProof,
    DoubleSpend,
    DoubleSpendAttempt,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::MerkleProof => "merkleProof",
            NotificationKind::DoubleSpend => "doubleSpend",
            NotificationKind::DoubleSpendAttempt => "doubleSpendAttempt",
        };
        f.write_str(s)
    }
}

/// Identity of one notification row. `block_id` is `None` for mempool rows;
/// `ds_tx_hash` is `None` for merkle proofs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub kind: NotificationKind,
    pub tx_id: TxId,
    pub block_id: Option<BlockId>,
    pub ds_tx_hash: Option<Hash256>,
}

/// Everything needed to build and deliver one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationData {
    pub kind: NotificationKind,
    pub tx_id: TxId,
    pub tx_hash: Hash256,
    pub block_id: Option<BlockId>,
    pub block_hash: Option<Hash256>,
    pub block_height: Option<u64>,
    pub ds_tx_hash: Option<Hash256>,
    pub ds_tx_payload: Option<Vec<u8>>,
    pub merkle_branch: Option<MerkleBranch>,
    pub callback: CallbackTarget,
    pub error_count: u32,
}

impl NotificationData {
    pub fn key(&self) -> NotificationKey {
        NotificationKey {
            kind: self.kind,
            tx_id: self.tx_id,
            block_id: self.block_id,
            ds_tx_hash: self.ds_tx_hash,
        }
    }
}

/// Rows removed by one clean-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanUpStats {
    pub blocks: usize,
    pub txs: usize,
}
