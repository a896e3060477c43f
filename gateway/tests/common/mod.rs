//! Shared fixtures for the integration tests: an in-process peer that
//! serves hand-built blocks, and a harness wiring the pipeline over a
//! temporary database.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use mapi_gateway::chain::{BlockParser, BlockParserStatus, RawBlock, RawTx};
use mapi_gateway::config::GatewayConfig;
use mapi_gateway::crypto::{Hash256, MerkleBranch};
use mapi_gateway::faults::{FaultInjection, FaultPoint, InjectedFault};
use mapi_gateway::mempool::MempoolChecker;
use mapi_gateway::notification::{HostLatencyTracker, NotificationScheduler};
use mapi_gateway::rpc::{
    BlockHeaderInfo, BlockStream, PeerRpc, RawTxSubmission, RpcError, RpcResult, SubmitOutcome,
};
use mapi_gateway::storage::{
    Block, BlockId, CallbackTarget, CleanUpStats, GatewayDb, NewBlock, NewTx, NotificationData,
    NotificationKey, OutPoint, StoreError, StoreResult, Tx, TxBlock, TxBlockDoubleSpend, TxId,
    TxInput, TxMempoolDoubleSpendAttempt, TxStatus, TxStore,
};

// ---------------------------------------------------------------------------
// Mock peer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockPeer {
    blocks: Mutex<HashMap<Hash256, (Vec<u8>, BlockHeaderInfo)>>,
    broken: Mutex<HashSet<Hash256>>,
    pub mempool: Mutex<HashSet<Hash256>>,
    pub verdict: Mutex<Option<SubmitOutcome>>,
    pub submitted: Mutex<Vec<Hash256>>,
    pub best: Mutex<Option<Hash256>>,
}

impl MockPeer {
    /// Serve `block` at `height`. Returns its hash.
    pub fn add_block(&self, block: &RawBlock, height: u64) -> Hash256 {
        let hash = block.hash();
        let info = BlockHeaderInfo {
            hash,
            prev_hash: block.header.prev_hash,
            height,
            time: block.header.time,
        };
        self.blocks.lock().insert(hash, (block.serialize(), info));
        *self.best.lock() = Some(hash);
        hash
    }

    /// Serve a truncated body for `hash` until repaired.
    pub fn break_block(&self, hash: Hash256) {
        self.broken.lock().insert(hash);
    }

    pub fn repair_block(&self, hash: Hash256) {
        self.broken.lock().remove(&hash);
    }
}

#[async_trait]
impl PeerRpc for MockPeer {
    async fn get_block_as_stream(&self, hash: &Hash256) -> RpcResult<BlockStream> {
        let mut bytes = match self.blocks.lock().get(hash) {
            Some((bytes, _)) => bytes.clone(),
            None => return Err(RpcError::Node { code: -5, message: "Block not found".into() }),
        };
        if self.broken.lock().contains(hash) {
            bytes.truncate(bytes.len() / 2);
        }
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn get_block_header(&self, hash: &Hash256) -> RpcResult<BlockHeaderInfo> {
        self.blocks
            .lock()
            .get(hash)
            .map(|(_, info)| *info)
            .ok_or(RpcError::Node { code: -5, message: "Block not found".into() })
    }

    async fn get_raw_mempool(&self) -> RpcResult<HashSet<Hash256>> {
        Ok(self.mempool.lock().clone())
    }

    async fn send_raw_transactions(&self, txs: &[RawTxSubmission]) -> RpcResult<Vec<SubmitOutcome>> {
        self.submitted.lock().extend(txs.iter().map(|t| t.hash));
        let verdict = self.verdict.lock().clone().unwrap_or(SubmitOutcome::Accepted);
        Ok(vec![verdict; txs.len()])
    }

    async fn get_best_block_hash(&self) -> RpcResult<Hash256> {
        self.best
            .lock()
            .ok_or(RpcError::Disconnected("no blocks yet".into()))
    }
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Fails `before_commit` at `point` the first `times` times.
pub struct FailBeforeCommit {
    pub point: FaultPoint,
    pub remaining: Mutex<u32>,
}

impl FailBeforeCommit {
    pub fn new(point: FaultPoint, times: u32) -> Arc<Self> {
        Arc::new(Self {
            point,
            remaining: Mutex::new(times),
        })
    }
}

impl FaultInjection for FailBeforeCommit {
    fn before_commit(&self, point: FaultPoint) -> Result<(), InjectedFault> {
        let mut remaining = self.remaining.lock();
        if point == self.point && *remaining > 0 {
            *remaining -= 1;
            return Err(InjectedFault::before(point));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Flaky store
// ---------------------------------------------------------------------------

/// A [`GatewayDb`] whose `set_on_active_chain` fails the next
/// `activation_failures` times, as an I/O error part-way through a commit
/// would.
pub struct FlakyStore {
    pub db: GatewayDb,
    pub activation_failures: Mutex<u32>,
}

impl FlakyStore {
    pub fn new(db: GatewayDb, activation_failures: u32) -> Arc<Self> {
        Arc::new(Self {
            db,
            activation_failures: Mutex::new(activation_failures),
        })
    }
}

impl TxStore for FlakyStore {
    fn get_block(&self, hash: &Hash256) -> StoreResult<Option<Block>> {
        self.db.get_block(hash)
    }

    fn get_block_by_id(&self, id: BlockId) -> StoreResult<Option<Block>> {
        self.db.get_block_by_id(id)
    }

    fn insert_or_update_block(&self, block: &NewBlock) -> StoreResult<BlockId> {
        self.db.insert_or_update_block(block)
    }

    fn set_on_active_chain(&self, height: u64, hash: &Hash256) -> StoreResult<bool> {
        let mut remaining = self.activation_failures.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(StoreError::NotFound("injected io error".into()));
        }
        drop(remaining);
        self.db.set_on_active_chain(height, hash)
    }

    fn get_best_block(&self) -> StoreResult<Option<Block>> {
        self.db.get_best_block()
    }

    fn get_unparsed_blocks(&self) -> StoreResult<Vec<Block>> {
        self.db.get_unparsed_blocks()
    }

    fn set_block_parsed_for_merkle(&self, id: BlockId, at: DateTime<Utc>) -> StoreResult<()> {
        self.db.set_block_parsed_for_merkle(id, at)
    }

    fn set_block_parsed_for_ds(&self, id: BlockId, at: DateTime<Utc>) -> StoreResult<()> {
        self.db.set_block_parsed_for_ds(id, at)
    }

    fn insert_or_update_txs(
        &self,
        txs: &[NewTx],
        unconfirmed_ancestor: bool,
        insert_inputs: bool,
    ) -> StoreResult<Vec<TxId>> {
        self.db.insert_or_update_txs(txs, unconfirmed_ancestor, insert_inputs)
    }

    fn get_tx(&self, id: TxId) -> StoreResult<Option<Tx>> {
        self.db.get_tx(id)
    }

    fn get_tx_by_hash(&self, hash: &Hash256) -> StoreResult<Option<Tx>> {
        self.db.get_tx_by_hash(hash)
    }

    fn get_txs_by_hashes(&self, hashes: &[Hash256]) -> StoreResult<Vec<Tx>> {
        self.db.get_txs_by_hashes(hashes)
    }

    fn get_tx_inputs(&self, id: TxId) -> StoreResult<Vec<TxInput>> {
        self.db.get_tx_inputs(id)
    }

    fn get_spenders(&self, outpoint: &OutPoint) -> StoreResult<Vec<TxId>> {
        self.db.get_spenders(outpoint)
    }

    fn get_child_txs(&self, tx_hash: &Hash256) -> StoreResult<Vec<TxId>> {
        self.db.get_child_txs(tx_hash)
    }

    fn set_tx_status(&self, id: TxId, status: TxStatus) -> StoreResult<()> {
        self.db.set_tx_status(id, status)
    }

    fn mark_tx_resubmitted(&self, id: TxId, at: DateTime<Utc>) -> StoreResult<()> {
        self.db.mark_tx_resubmitted(id, at)
    }

    fn record_missing_inputs(&self, id: TxId, max_retries: u32) -> StoreResult<TxStatus> {
        self.db.record_missing_inputs(id, max_retries)
    }

    fn get_missing_transactions(
        &self,
        mempool: &HashSet<Hash256>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Tx>> {
        self.db.get_missing_transactions(mempool, cutoff)
    }

    fn insert_tx_block(
        &self,
        tx_id: TxId,
        block_id: BlockId,
        merkle_branch: Option<MerkleBranch>,
    ) -> StoreResult<bool> {
        self.db.insert_tx_block(tx_id, block_id, merkle_branch)
    }

    fn get_tx_blocks(&self, tx_id: TxId) -> StoreResult<Vec<TxBlock>> {
        self.db.get_tx_blocks(tx_id)
    }

    fn insert_block_double_spend(
        &self,
        tx_id: TxId,
        block_id: BlockId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<Vec<u8>>,
    ) -> StoreResult<bool> {
        self.db
            .insert_block_double_spend(tx_id, block_id, ds_tx_hash, ds_tx_payload)
    }

    fn get_block_double_spends(&self, tx_id: TxId) -> StoreResult<Vec<TxBlockDoubleSpend>> {
        self.db.get_block_double_spends(tx_id)
    }

    fn insert_mempool_double_spend(
        &self,
        tx_id: TxId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<Vec<u8>>,
    ) -> StoreResult<bool> {
        self.db.insert_mempool_double_spend(tx_id, ds_tx_hash, ds_tx_payload)
    }

    fn get_mempool_double_spends(&self, tx_id: TxId) -> StoreResult<Vec<TxMempoolDoubleSpendAttempt>> {
        self.db.get_mempool_double_spends(tx_id)
    }

    fn get_txs_to_send_merkle_proof_notifications(
        &self,
        skip: usize,
        fetch: usize,
    ) -> StoreResult<Vec<NotificationData>> {
        self.db.get_txs_to_send_merkle_proof_notifications(skip, fetch)
    }

    fn get_txs_to_send_block_ds_notifications(&self) -> StoreResult<Vec<NotificationData>> {
        self.db.get_txs_to_send_block_ds_notifications()
    }

    fn get_txs_to_send_mempool_ds_notifications(&self) -> StoreResult<Vec<NotificationData>> {
        self.db.get_txs_to_send_mempool_ds_notifications()
    }

    fn get_pending_notifications_for_block(&self, block_id: BlockId) -> StoreResult<Vec<NotificationData>> {
        self.db.get_pending_notifications_for_block(block_id)
    }

    fn set_notification_send_date(&self, key: &NotificationKey, at: DateTime<Utc>) -> StoreResult<bool> {
        self.db.set_notification_send_date(key, at)
    }

    fn set_notification_error(
        &self,
        key: &NotificationKey,
        message: &str,
        error_count: u32,
    ) -> StoreResult<bool> {
        self.db.set_notification_error(key, message, error_count)
    }

    fn clean_up_tx(&self, before: DateTime<Utc>, mempool_expiry: DateTime<Utc>) -> StoreResult<CleanUpStats> {
        self.db.clean_up_tx(before, mempool_expiry)
    }
}

/// Fails `after_commit` at `point` the first `times` times.
pub struct FailAfterCommit {
    pub point: FaultPoint,
    pub remaining: Mutex<u32>,
}

impl FailAfterCommit {
    pub fn new(point: FaultPoint, times: u32) -> Arc<Self> {
        Arc::new(Self {
            point,
            remaining: Mutex::new(times),
        })
    }
}

impl FaultInjection for FailAfterCommit {
    fn after_commit(&self, point: FaultPoint) -> Result<(), InjectedFault> {
        let mut remaining = self.remaining.lock();
        if point == self.point && *remaining > 0 {
            *remaining -= 1;
            return Err(InjectedFault::after(point));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub const CALLBACK_URL: &str = "http://subscriber.test/callback";

pub struct Harness {
    pub db: GatewayDb,
    pub peer: Arc<MockPeer>,
    pub status: Arc<BlockParserStatus>,
    pub scheduler: Arc<NotificationScheduler>,
    pub parser: Arc<BlockParser>,
    pub config: GatewayConfig,
}

pub fn harness() -> Harness {
    harness_with(GatewayConfig::default(), None)
}

pub fn harness_with(config: GatewayConfig, faults: Option<Arc<dyn FaultInjection>>) -> Harness {
    let db = GatewayDb::open_temporary().expect("temp db");
    harness_over(Arc::new(db.clone()), db, config, faults)
}

/// A harness whose parser writes through `store`, which must wrap `db`.
pub fn harness_over(
    store: Arc<dyn TxStore>,
    db: GatewayDb,
    config: GatewayConfig,
    faults: Option<Arc<dyn FaultInjection>>,
) -> Harness {
    let peer = Arc::new(MockPeer::default());
    let status = Arc::new(BlockParserStatus::new());
    let latency = Arc::new(HostLatencyTracker::new(
        config.notifications.saved_execution_times,
        config.notifications.slow_host_threshold_ms,
    ));
    let scheduler = Arc::new(NotificationScheduler::new(&config.notifications, latency));
    let mut parser = BlockParser::new(
        store,
        peer.clone(),
        scheduler.clone(),
        status.clone(),
        &config,
    );
    if let Some(faults) = faults {
        parser = parser.with_faults(faults);
    }
    Harness {
        db,
        peer,
        status,
        scheduler,
        parser: Arc::new(parser),
        config,
    }
}

impl Harness {
    pub fn checker(&self) -> MempoolChecker {
        MempoolChecker::new(
            Arc::new(self.db.clone()),
            self.peer.clone(),
            self.status.clone(),
            &self.config,
        )
    }

    /// Track `raw` as a submitted transaction with both callbacks enabled.
    pub fn track(&self, raw: &RawTx) -> TxId {
        self.track_with(raw, true, true)
    }

    pub fn track_with(&self, raw: &RawTx, merkle_proof: bool, ds_check: bool) -> TxId {
        let submitted_at = Utc::now() - chrono::Duration::seconds(600);
        let mut tx = NewTx::submitted(raw.txid(), raw.serialize(), submitted_at);
        tx.merkle_proof = merkle_proof;
        tx.ds_check = ds_check;
        tx.callback = Some(CallbackTarget::new(CALLBACK_URL));
        tx.inputs = raw
            .inputs
            .iter()
            .enumerate()
            .map(|(n, input)| TxInput {
                n: n as u32,
                prev: input.prev,
            })
            .collect();
        self.db.insert_or_update_txs(&[tx], false, true).expect("insert tx")[0]
    }

    /// Serve a block on top of `prev` at `height` and return its hash.
    pub fn mine(&self, prev: Hash256, height: u64, tag: u64, txs: Vec<RawTx>) -> Hash256 {
        self.peer.add_block(&block(prev, tag, txs), height)
    }

    pub fn block(&self, hash: &Hash256) -> Block {
        self.db.get_block(hash).expect("store").expect("block exists")
    }

    pub fn is_active(&self, hash: &Hash256) -> bool {
        self.block(hash).on_active_chain
    }
}

/// A block with a coinbase tagged `tag` followed by `txs`.
pub fn block(prev: Hash256, tag: u64, txs: Vec<RawTx>) -> RawBlock {
    let mut all = vec![RawTx::coinbase(tag)];
    all.extend(txs);
    RawBlock::new(prev, 1_700_000_000 + tag as u32, all)
}
