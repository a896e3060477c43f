//! The store contract the pipeline is written against.
//!
//! Every component holds an `Arc<dyn TxStore>`. [`GatewayDb`](super::GatewayDb)
//! is the embedded implementation; a SQL-backed store only has to honour the
//! same contract.
//!
//! ## Contract
//!
//! - Inserts that would duplicate an existing row return `false` (or the
//!   existing id) rather than an error.
//! - `submitted_at` never moves backwards.
//! - Read-modify-write sequences on one row are serialized by the store.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use super::models::{
    Block, BlockId, CleanUpStats, NewBlock, NewTx, NotificationData, NotificationKey, OutPoint,
    Tx, TxBlock, TxBlockDoubleSpend, TxId, TxInput, TxMempoolDoubleSpendAttempt, TxStatus,
};
use crate::crypto::{Hash256, MerkleBranch};

/// Errors surfaced by a store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record in {tree}: {reason}")]
    Corrupt { tree: &'static str, reason: String },

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage for blocks, transactions and notification rows.
pub trait TxStore: Send + Sync {
    // -- Blocks -------------------------------------------------------------

    fn get_block(&self, hash: &Hash256) -> StoreResult<Option<Block>>;

    fn get_block_by_id(&self, id: BlockId) -> StoreResult<Option<Block>>;

    /// Insert a block, or refresh the header fields of an existing row with
    /// the same hash. Chain membership and parse timestamps of an existing
    /// row are left alone. Returns the row's id.
    fn insert_or_update_block(&self, block: &NewBlock) -> StoreResult<BlockId>;

    /// Mark `hash` active at `height` and every other block at that height
    /// inactive. Returns `false` when no block with `hash` exists.
    fn set_on_active_chain(&self, height: u64, hash: &Hash256) -> StoreResult<bool>;

    /// The highest active block.
    fn get_best_block(&self) -> StoreResult<Option<Block>>;

    /// Blocks missing either parse pass, lowest height first.
    fn get_unparsed_blocks(&self) -> StoreResult<Vec<Block>>;

    fn set_block_parsed_for_merkle(&self, id: BlockId, at: DateTime<Utc>) -> StoreResult<()>;

    fn set_block_parsed_for_ds(&self, id: BlockId, at: DateTime<Utc>) -> StoreResult<()>;

    // -- Transactions -------------------------------------------------------

    /// Insert transactions or update the existing rows with the same hash.
    ///
    /// With `unconfirmed_ancestor` set, rows are inserted as ancestor
    /// placeholders and existing rows are left untouched. With
    /// `insert_inputs` set, inputs not yet recorded are added to the spend
    /// graph. Returns ids aligned with `txs`.
    fn insert_or_update_txs(
        &self,
        txs: &[NewTx],
        unconfirmed_ancestor: bool,
        insert_inputs: bool,
    ) -> StoreResult<Vec<TxId>>;

    fn get_tx(&self, id: TxId) -> StoreResult<Option<Tx>>;

    fn get_tx_by_hash(&self, hash: &Hash256) -> StoreResult<Option<Tx>>;

    /// Tracked transactions among `hashes`. Unknown hashes are skipped.
    fn get_txs_by_hashes(&self, hashes: &[Hash256]) -> StoreResult<Vec<Tx>>;

    fn get_tx_inputs(&self, id: TxId) -> StoreResult<Vec<TxInput>>;

    /// Tracked transactions spending `outpoint`.
    fn get_spenders(&self, outpoint: &OutPoint) -> StoreResult<Vec<TxId>>;

    /// Tracked transactions spending any output of `tx_hash`.
    fn get_child_txs(&self, tx_hash: &Hash256) -> StoreResult<Vec<TxId>>;

    fn set_tx_status(&self, id: TxId, status: TxStatus) -> StoreResult<()>;

    /// Record a successful (re)submission: advance `submitted_at` to `at`
    /// if later and reset the missing-inputs counter.
    fn mark_tx_resubmitted(&self, id: TxId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Count one missing-inputs failure. Once the counter exceeds
    /// `max_retries` the tx moves to `MissingInputsMaxRetriesReached`.
    /// Returns the resulting status.
    fn record_missing_inputs(&self, id: TxId, max_retries: u32) -> StoreResult<TxStatus>;

    /// Transactions expected in a peer mempool but absent from `mempool`,
    /// submitted no later than `cutoff`, ascending by id.
    fn get_missing_transactions(
        &self,
        mempool: &HashSet<Hash256>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Tx>>;

    // -- Notification rows --------------------------------------------------

    /// Returns `false` when the (tx, block) row already exists.
    fn insert_tx_block(
        &self,
        tx_id: TxId,
        block_id: BlockId,
        merkle_branch: Option<MerkleBranch>,
    ) -> StoreResult<bool>;

    fn get_tx_blocks(&self, tx_id: TxId) -> StoreResult<Vec<TxBlock>>;

    /// Returns `false` when the (tx, block, ds tx) row already exists.
    fn insert_block_double_spend(
        &self,
        tx_id: TxId,
        block_id: BlockId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<Vec<u8>>,
    ) -> StoreResult<bool>;

    fn get_block_double_spends(&self, tx_id: TxId) -> StoreResult<Vec<TxBlockDoubleSpend>>;

    /// Returns `false` when the (tx, ds tx) row already exists.
    fn insert_mempool_double_spend(
        &self,
        tx_id: TxId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<Vec<u8>>,
    ) -> StoreResult<bool>;

    fn get_mempool_double_spends(&self, tx_id: TxId)
        -> StoreResult<Vec<TxMempoolDoubleSpendAttempt>>;

    /// Unsent merkle proofs on active blocks for txs that asked for them.
    fn get_txs_to_send_merkle_proof_notifications(
        &self,
        skip: usize,
        fetch: usize,
    ) -> StoreResult<Vec<NotificationData>>;

    /// Unsent block double-spend rows on active blocks.
    fn get_txs_to_send_block_ds_notifications(&self) -> StoreResult<Vec<NotificationData>>;

    fn get_txs_to_send_mempool_ds_notifications(&self) -> StoreResult<Vec<NotificationData>>;

    /// Unsent merkle-proof and double-spend rows attached to one block.
    fn get_pending_notifications_for_block(
        &self,
        block_id: BlockId,
    ) -> StoreResult<Vec<NotificationData>>;

    /// Returns `false` when the row no longer exists.
    fn set_notification_send_date(
        &self,
        key: &NotificationKey,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    fn set_notification_error(
        &self,
        key: &NotificationKey,
        message: &str,
        error_count: u32,
    ) -> StoreResult<bool>;

    // -- Maintenance --------------------------------------------------------

    /// Delete blocks older than `before` with the transactions mined in
    /// them, and never-mined transactions received before `mempool_expiry`.
    fn clean_up_tx(
        &self,
        before: DateTime<Utc>,
        mempool_expiry: DateTime<Utc>,
    ) -> StoreResult<CleanUpStats>;
}
