//! # GatewayDb: Embedded Store
//!
//! [`TxStore`] implemented on sled. All on-disk state of the gateway flows
//! through this module.
//!
//! ## Tree Layout
//!
//! | Tree           | Key                                  | Value                         |
//! |----------------|--------------------------------------|-------------------------------|
//! | `blocks`       | `block id` (8B BE)                   | `bincode(Block)`              |
//! | `block_hashes` | `hash` (32B)                         | `block id` (8B BE)            |
//! | `heights`      | `height` (8B BE) ++ `block id`       | empty                         |
//! | `txs`          | `tx id` (8B BE)                      | `bincode(Tx)`                 |
//! | `tx_hashes`    | `hash` (32B)                         | `tx id` (8B BE)               |
//! | `tx_inputs`    | `tx id` ++ `n` (4B BE)               | `bincode(TxInput)`            |
//! | `spends`       | `prev hash` ++ `prev n` ++ `tx id`   | empty                         |
//! | `tx_blocks`    | `tx id` ++ `block id`                | `bincode(TxBlock)`            |
//! | `block_txs`    | `block id` ++ `tx id`                | empty                         |
//! | `block_ds`     | `tx id` ++ `block id` ++ `ds hash`   | `bincode(TxBlockDoubleSpend)` |
//! | `mempool_ds`   | `tx id` ++ `ds hash`                 | `bincode(TxMempoolDoubleSpendAttempt)` |
//!
//! Numeric keys are big-endian so sled's lexicographic order matches numeric
//! order: iterating `txs` yields ascending ids, and a prefix scan over
//! `heights` returns every block at one height.
//!
//! ## Atomicity
//!
//! Index entries that belong to the same row are written in one `Batch`
//! per tree. Read-modify-write sequences hold `write_lock`, so two writers
//! never interleave on the same row; readers never take it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db, Tree};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use super::models::{
    Block, BlockId, CleanUpStats, NewBlock, NewTx, NotificationData, NotificationKey,
    NotificationKind, OutPoint, Tx, TxBlock, TxBlockDoubleSpend, TxId, TxInput,
    TxMempoolDoubleSpendAttempt, TxStatus,
};
use super::store::{StoreError, StoreResult, TxStore};
use crate::crypto::{Hash256, MerkleBranch};

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn read_u64(tree: &'static str, bytes: &[u8]) -> StoreResult<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        tree,
        reason: format!("expected 8-byte id, got {} bytes", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(arr))
}

/// Value of index-only entries.
const EMPTY: &[u8] = &[];

fn pair_key(a: u64, b: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&a.to_be_bytes());
    key[8..].copy_from_slice(&b.to_be_bytes());
    key
}

fn spend_prefix(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(outpoint.tx_hash.as_bytes());
    key[32..].copy_from_slice(&outpoint.n.to_be_bytes());
    key
}

fn spend_key(outpoint: &OutPoint, tx_id: TxId) -> Vec<u8> {
    let mut key = spend_prefix(outpoint).to_vec();
    key.extend_from_slice(&tx_id.to_be_bytes());
    key
}

fn input_key(tx_id: TxId, n: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&tx_id.to_be_bytes());
    key[8..].copy_from_slice(&n.to_be_bytes());
    key
}

fn block_ds_key(tx_id: TxId, block_id: BlockId, ds_tx_hash: &Hash256) -> Vec<u8> {
    let mut key = pair_key(tx_id, block_id).to_vec();
    key.extend_from_slice(ds_tx_hash.as_bytes());
    key
}

fn mempool_ds_key(tx_id: TxId, ds_tx_hash: &Hash256) -> Vec<u8> {
    let mut key = tx_id.to_be_bytes().to_vec();
    key.extend_from_slice(ds_tx_hash.as_bytes());
    key
}

/// Trailing 8 bytes of a composite key as an id.
fn trailing_id(tree: &'static str, key: &[u8]) -> StoreResult<u64> {
    if key.len() < 8 {
        return Err(StoreError::Corrupt {
            tree,
            reason: "key shorter than an id".into(),
        });
    }
    read_u64(tree, &key[key.len() - 8..])
}

// ---------------------------------------------------------------------------
// GatewayDb
// ---------------------------------------------------------------------------

/// sled-backed [`TxStore`].
///
/// Cheap to clone; clones share the same trees and write lock.
#[derive(Debug, Clone)]
pub struct GatewayDb {
    db: Db,
    blocks: Tree,
    block_hashes: Tree,
    heights: Tree,
    txs: Tree,
    tx_hashes: Tree,
    tx_inputs: Tree,
    spends: Tree,
    tx_blocks: Tree,
    block_txs: Tree,
    block_ds: Tree,
    mempool_ds: Tree,
    write_lock: Arc<Mutex<()>>,
}

impl GatewayDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database removed on drop. Used by tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            block_hashes: db.open_tree("block_hashes")?,
            heights: db.open_tree("heights")?,
            txs: db.open_tree("txs")?,
            tx_hashes: db.open_tree("tx_hashes")?,
            tx_inputs: db.open_tree("tx_inputs")?,
            spends: db.open_tree("spends")?,
            tx_blocks: db.open_tree("tx_blocks")?,
            block_txs: db.open_tree("block_txs")?,
            block_ds: db.open_tree("block_ds")?,
            mempool_ds: db.open_tree("mempool_ds")?,
            write_lock: Arc::new(Mutex::new(())),
            db,
        })
    }

    /// Open a named tree in the same database (e.g. the node registry).
    pub fn open_tree(&self, name: &str) -> StoreResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    /// Block until all pending writes are durable.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // -- Internal readers ---------------------------------------------------

    fn block_id_of(&self, hash: &Hash256) -> StoreResult<Option<BlockId>> {
        match self.block_hashes.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(read_u64("block_hashes", &bytes)?)),
            None => Ok(None),
        }
    }

    fn tx_id_of(&self, hash: &Hash256) -> StoreResult<Option<TxId>> {
        match self.tx_hashes.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(read_u64("tx_hashes", &bytes)?)),
            None => Ok(None),
        }
    }

    fn load<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> StoreResult<Option<T>> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_block(&self, block: &Block) -> StoreResult<()> {
        self.blocks.insert(block.id.to_be_bytes(), encode(block)?)?;
        Ok(())
    }

    fn put_tx(&self, tx: &Tx) -> StoreResult<()> {
        self.txs.insert(tx.id.to_be_bytes(), encode(tx)?)?;
        Ok(())
    }

    /// Whether the tx has a `TxBlock` on a block that is currently active.
    fn is_mined_on_active_chain(&self, tx_id: TxId) -> StoreResult<bool> {
        for entry in self.tx_blocks.scan_prefix(tx_id.to_be_bytes()) {
            let (key, _) = entry?;
            let block_id = trailing_id("tx_blocks", &key)?;
            if let Some(block) = self.get_block_by_id(block_id)? {
                if block.on_active_chain {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Read-modify-write of one bincode row. Returns `false` if absent.
    fn update_row<T, F>(&self, tree: &Tree, key: &[u8], f: F) -> StoreResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let _guard = self.write_lock.lock();
        let Some(mut row) = Self::load::<T>(tree, key)? else {
            return Ok(false);
        };
        f(&mut row);
        tree.insert(key, encode(&row)?)?;
        Ok(true)
    }

    fn insert_inputs(&self, tx_id: TxId, inputs: &[TxInput]) -> StoreResult<()> {
        let mut input_batch = Batch::default();
        let mut spend_batch = Batch::default();
        for input in inputs {
            let key = input_key(tx_id, input.n);
            if self.tx_inputs.contains_key(key)? {
                continue;
            }
            input_batch.insert(&key[..], encode(input)?);
            spend_batch.insert(spend_key(&input.prev, tx_id), EMPTY);
        }
        self.tx_inputs.apply_batch(input_batch)?;
        self.spends.apply_batch(spend_batch)?;
        Ok(())
    }

    // -- Notification projections -------------------------------------------

    fn merkle_notification(&self, row: &TxBlock) -> StoreResult<Option<NotificationData>> {
        if row.sent_merkle_proof_at.is_some() {
            return Ok(None);
        }
        let Some(tx) = self.get_tx(row.tx_id)? else {
            return Ok(None);
        };
        let Some(callback) = tx.callback.clone().filter(|_| tx.merkle_proof) else {
            return Ok(None);
        };
        let Some(block) = self.get_block_by_id(row.block_id)? else {
            return Ok(None);
        };
        if !block.on_active_chain {
            return Ok(None);
        }
        Ok(Some(NotificationData {
            kind: NotificationKind::MerkleProof,
            tx_id: tx.id,
            tx_hash: tx.hash,
            block_id: Some(block.id),
            block_hash: Some(block.hash),
            block_height: Some(block.height),
            ds_tx_hash: None,
            ds_tx_payload: None,
            merkle_branch: row.merkle_branch.clone(),
            callback,
            error_count: row.error_count,
        }))
    }

    fn block_ds_notification(
        &self,
        row: &TxBlockDoubleSpend,
    ) -> StoreResult<Option<NotificationData>> {
        if row.sent_ds_notification_at.is_some() {
            return Ok(None);
        }
        let Some(tx) = self.get_tx(row.tx_id)? else {
            return Ok(None);
        };
        let Some(callback) = tx.callback.clone().filter(|_| tx.ds_check) else {
            return Ok(None);
        };
        let Some(block) = self.get_block_by_id(row.block_id)? else {
            return Ok(None);
        };
        if !block.on_active_chain {
            return Ok(None);
        }
        Ok(Some(NotificationData {
            kind: NotificationKind::DoubleSpend,
            tx_id: tx.id,
            tx_hash: tx.hash,
            block_id: Some(block.id),
            block_hash: Some(block.hash),
            block_height: Some(block.height),
            ds_tx_hash: Some(row.ds_tx_hash),
            ds_tx_payload: row.ds_tx_payload.clone(),
            merkle_branch: None,
            callback,
            error_count: row.error_count,
        }))
    }

    fn mempool_ds_notification(
        &self,
        row: &TxMempoolDoubleSpendAttempt,
    ) -> StoreResult<Option<NotificationData>> {
        if row.sent_ds_notification_at.is_some() {
            return Ok(None);
        }
        let Some(tx) = self.get_tx(row.tx_id)? else {
            return Ok(None);
        };
        let Some(callback) = tx.callback.clone().filter(|_| tx.ds_check) else {
            return Ok(None);
        };
        Ok(Some(NotificationData {
            kind: NotificationKind::DoubleSpendAttempt,
            tx_id: tx.id,
            tx_hash: tx.hash,
            block_id: None,
            block_hash: None,
            block_height: None,
            ds_tx_hash: Some(row.ds_tx_hash),
            ds_tx_payload: row.ds_tx_payload.clone(),
            merkle_branch: None,
            callback,
            error_count: row.error_count,
        }))
    }

    // -- Deletion -----------------------------------------------------------

    /// Remove a tx with its inputs, spend edges and notification rows.
    /// Caller holds the write lock.
    fn delete_tx_rows(&self, tx: &Tx) -> StoreResult<()> {
        let prefix = tx.id.to_be_bytes();

        let mut inputs = Batch::default();
        let mut spends = Batch::default();
        for entry in self.tx_inputs.scan_prefix(prefix) {
            let (key, value) = entry?;
            let input: TxInput = decode(&value)?;
            spends.remove(spend_key(&input.prev, tx.id));
            inputs.remove(key);
        }
        self.tx_inputs.apply_batch(inputs)?;
        self.spends.apply_batch(spends)?;

        let mut tx_blocks = Batch::default();
        let mut block_txs = Batch::default();
        for entry in self.tx_blocks.scan_prefix(prefix) {
            let (key, _) = entry?;
            let block_id = trailing_id("tx_blocks", &key)?;
            block_txs.remove(pair_key(block_id, tx.id).to_vec());
            tx_blocks.remove(key);
        }
        self.tx_blocks.apply_batch(tx_blocks)?;
        self.block_txs.apply_batch(block_txs)?;

        for tree in [&self.block_ds, &self.mempool_ds] {
            let mut batch = Batch::default();
            for entry in tree.scan_prefix(prefix) {
                let (key, _) = entry?;
                batch.remove(key);
            }
            tree.apply_batch(batch)?;
        }

        self.tx_hashes.remove(tx.hash.as_bytes())?;
        self.txs.remove(prefix)?;
        Ok(())
    }

    /// Remove a block with its indexes and the rows attached to it.
    /// Caller holds the write lock.
    fn delete_block_rows(&self, block: &Block) -> StoreResult<()> {
        let mut block_txs = Batch::default();
        let mut tx_blocks = Batch::default();
        for entry in self.block_txs.scan_prefix(block.id.to_be_bytes()) {
            let (key, _) = entry?;
            let tx_id = trailing_id("block_txs", &key)?;
            tx_blocks.remove(pair_key(tx_id, block.id).to_vec());
            block_txs.remove(key);
        }
        self.block_txs.apply_batch(block_txs)?;
        self.tx_blocks.apply_batch(tx_blocks)?;

        let mut ds = Batch::default();
        for entry in self.block_ds.iter() {
            let (key, value) = entry?;
            let row: TxBlockDoubleSpend = decode(&value)?;
            if row.block_id == block.id {
                ds.remove(key);
            }
        }
        self.block_ds.apply_batch(ds)?;

        self.heights.remove(pair_key(block.height, block.id))?;
        self.block_hashes.remove(block.hash.as_bytes())?;
        self.blocks.remove(block.id.to_be_bytes())?;
        Ok(())
    }
}

impl TxStore for GatewayDb {
    // -- Blocks -------------------------------------------------------------

    fn get_block(&self, hash: &Hash256) -> StoreResult<Option<Block>> {
        match self.block_id_of(hash)? {
            Some(id) => self.get_block_by_id(id),
            None => Ok(None),
        }
    }

    fn get_block_by_id(&self, id: BlockId) -> StoreResult<Option<Block>> {
        Self::load(&self.blocks, &id.to_be_bytes())
    }

    fn insert_or_update_block(&self, new: &NewBlock) -> StoreResult<BlockId> {
        let _guard = self.write_lock.lock();

        if let Some(mut block) = self.get_block(&new.hash)? {
            if block.height != new.height {
                self.heights.remove(pair_key(block.height, block.id))?;
                self.heights.insert(pair_key(new.height, block.id), EMPTY)?;
                block.height = new.height;
            }
            block.prev_hash = new.prev_hash;
            block.block_time = new.block_time;
            self.put_block(&block)?;
            return Ok(block.id);
        }

        let id = self.db.generate_id()?;
        let block = Block {
            id,
            hash: new.hash,
            prev_hash: new.prev_hash,
            height: new.height,
            on_active_chain: new.on_active_chain,
            block_time: new.block_time,
            parsed_for_merkle_at: None,
            parsed_for_ds_at: None,
        };
        self.put_block(&block)?;
        self.block_hashes.insert(new.hash.as_bytes(), &id.to_be_bytes())?;
        self.heights.insert(pair_key(new.height, id), EMPTY)?;
        Ok(id)
    }

    fn set_on_active_chain(&self, height: u64, hash: &Hash256) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();

        let Some(target_id) = self.block_id_of(hash)? else {
            return Ok(false);
        };
        let Some(mut target) = self.get_block_by_id(target_id)? else {
            return Ok(false);
        };
        if target.height != height {
            self.heights.remove(pair_key(target.height, target.id))?;
            self.heights.insert(pair_key(height, target.id), EMPTY)?;
            target.height = height;
        }

        let mut batch = Batch::default();
        for entry in self.heights.scan_prefix(height.to_be_bytes()) {
            let (key, _) = entry?;
            let id = trailing_id("heights", &key)?;
            if id == target_id {
                continue;
            }
            if let Some(mut other) = self.get_block_by_id(id)? {
                if other.on_active_chain {
                    other.on_active_chain = false;
                    batch.insert(&id.to_be_bytes()[..], encode(&other)?);
                }
            }
        }
        target.on_active_chain = true;
        batch.insert(&target_id.to_be_bytes()[..], encode(&target)?);
        self.blocks.apply_batch(batch)?;
        Ok(true)
    }

    fn get_best_block(&self) -> StoreResult<Option<Block>> {
        for entry in self.heights.iter().rev() {
            let (key, _) = entry?;
            let id = trailing_id("heights", &key)?;
            if let Some(block) = self.get_block_by_id(id)? {
                if block.on_active_chain {
                    return Ok(Some(block));
                }
            }
        }
        Ok(None)
    }

    fn get_unparsed_blocks(&self) -> StoreResult<Vec<Block>> {
        let mut out = Vec::new();
        for entry in self.heights.iter() {
            let (key, _) = entry?;
            let id = trailing_id("heights", &key)?;
            if let Some(block) = self.get_block_by_id(id)? {
                if !block.is_fully_parsed() {
                    out.push(block);
                }
            }
        }
        Ok(out)
    }

    fn set_block_parsed_for_merkle(&self, id: BlockId, at: DateTime<Utc>) -> StoreResult<()> {
        let found = self.update_row::<Block, _>(&self.blocks, &id.to_be_bytes(), |b| {
            b.parsed_for_merkle_at.get_or_insert(at);
        })?;
        if !found {
            return Err(StoreError::NotFound(format!("block {id}")));
        }
        Ok(())
    }

    fn set_block_parsed_for_ds(&self, id: BlockId, at: DateTime<Utc>) -> StoreResult<()> {
        let found = self.update_row::<Block, _>(&self.blocks, &id.to_be_bytes(), |b| {
            b.parsed_for_ds_at.get_or_insert(at);
        })?;
        if !found {
            return Err(StoreError::NotFound(format!("block {id}")));
        }
        Ok(())
    }

    // -- Transactions -------------------------------------------------------

    fn insert_or_update_txs(
        &self,
        txs: &[NewTx],
        unconfirmed_ancestor: bool,
        insert_inputs: bool,
    ) -> StoreResult<Vec<TxId>> {
        let _guard = self.write_lock.lock();
        let mut ids = Vec::with_capacity(txs.len());

        for new in txs {
            let existing = match self.tx_id_of(&new.hash)? {
                Some(id) => self.get_tx(id)?,
                None => None,
            };

            let id = match existing {
                Some(tx) if unconfirmed_ancestor => tx.id,
                Some(mut tx) => {
                    if tx.unconfirmed_ancestor {
                        // Placeholder replaced by the real submission.
                        tx.received_at = new.received_at;
                        tx.unconfirmed_ancestor = false;
                    }
                    tx.status = new.status;
                    if new.payload.is_some() {
                        tx.payload = new.payload.clone();
                    }
                    tx.submitted_at = tx.submitted_at.max(new.submitted_at);
                    tx.merkle_proof = new.merkle_proof;
                    tx.ds_check = new.ds_check;
                    if new.callback.is_some() {
                        tx.callback = new.callback.clone();
                    }
                    if new.policy_quote_id.is_some() {
                        tx.policy_quote_id = new.policy_quote_id;
                    }
                    self.put_tx(&tx)?;
                    tx.id
                }
                None => {
                    let id = self.db.generate_id()?;
                    let tx = Tx {
                        id,
                        hash: new.hash,
                        payload: new.payload.clone(),
                        status: new.status,
                        received_at: new.received_at,
                        submitted_at: new.submitted_at,
                        merkle_proof: new.merkle_proof,
                        ds_check: new.ds_check,
                        unconfirmed_ancestor,
                        callback: new.callback.clone(),
                        policy_quote_id: new.policy_quote_id,
                        missing_inputs_retries: 0,
                    };
                    self.put_tx(&tx)?;
                    self.tx_hashes.insert(new.hash.as_bytes(), &id.to_be_bytes())?;
                    id
                }
            };

            if insert_inputs {
                self.insert_inputs(id, &new.inputs)?;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn get_tx(&self, id: TxId) -> StoreResult<Option<Tx>> {
        Self::load(&self.txs, &id.to_be_bytes())
    }

    fn get_tx_by_hash(&self, hash: &Hash256) -> StoreResult<Option<Tx>> {
        match self.tx_id_of(hash)? {
            Some(id) => self.get_tx(id),
            None => Ok(None),
        }
    }

    fn get_txs_by_hashes(&self, hashes: &[Hash256]) -> StoreResult<Vec<Tx>> {
        let mut out = Vec::new();
        for hash in hashes {
            if let Some(tx) = self.get_tx_by_hash(hash)? {
                out.push(tx);
            }
        }
        Ok(out)
    }

    fn get_tx_inputs(&self, id: TxId) -> StoreResult<Vec<TxInput>> {
        self.tx_inputs
            .scan_prefix(id.to_be_bytes())
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    fn get_spenders(&self, outpoint: &OutPoint) -> StoreResult<Vec<TxId>> {
        self.spends
            .scan_prefix(spend_prefix(outpoint))
            .map(|entry| {
                let (key, _) = entry?;
                trailing_id("spends", &key)
            })
            .collect()
    }

    fn get_child_txs(&self, tx_hash: &Hash256) -> StoreResult<Vec<TxId>> {
        let mut out = Vec::new();
        for entry in self.spends.scan_prefix(tx_hash.as_bytes()) {
            let (key, _) = entry?;
            let id = trailing_id("spends", &key)?;
            if !out.contains(&id) {
                out.push(id);
            }
        }
        Ok(out)
    }

    fn set_tx_status(&self, id: TxId, status: TxStatus) -> StoreResult<()> {
        let found = self.update_row::<Tx, _>(&self.txs, &id.to_be_bytes(), |tx| {
            tx.status = status;
        })?;
        if !found {
            return Err(StoreError::NotFound(format!("tx {id}")));
        }
        Ok(())
    }

    fn mark_tx_resubmitted(&self, id: TxId, at: DateTime<Utc>) -> StoreResult<()> {
        let found = self.update_row::<Tx, _>(&self.txs, &id.to_be_bytes(), |tx| {
            tx.submitted_at = tx.submitted_at.max(at);
            tx.missing_inputs_retries = 0;
        })?;
        if !found {
            return Err(StoreError::NotFound(format!("tx {id}")));
        }
        Ok(())
    }

    fn record_missing_inputs(&self, id: TxId, max_retries: u32) -> StoreResult<TxStatus> {
        let mut status = None;
        self.update_row::<Tx, _>(&self.txs, &id.to_be_bytes(), |tx| {
            tx.missing_inputs_retries = tx.missing_inputs_retries.saturating_add(1);
            if tx.missing_inputs_retries > max_retries {
                tx.status = TxStatus::MissingInputsMaxRetriesReached;
            }
            status = Some(tx.status);
        })?;
        status.ok_or_else(|| StoreError::NotFound(format!("tx {id}")))
    }

    fn get_missing_transactions(
        &self,
        mempool: &HashSet<Hash256>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Tx>> {
        let mut out = Vec::new();
        for entry in self.txs.iter() {
            let (_, value) = entry?;
            let tx: Tx = decode(&value)?;
            if !tx.status.expects_mempool_presence()
                || tx.unconfirmed_ancestor
                || tx.submitted_at > cutoff
                || mempool.contains(&tx.hash)
            {
                continue;
            }
            if self.is_mined_on_active_chain(tx.id)? {
                continue;
            }
            out.push(tx);
        }
        Ok(out)
    }

    // -- Notification rows --------------------------------------------------

    fn insert_tx_block(
        &self,
        tx_id: TxId,
        block_id: BlockId,
        merkle_branch: Option<MerkleBranch>,
    ) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let key = pair_key(tx_id, block_id);
        if self.tx_blocks.contains_key(key)? {
            return Ok(false);
        }
        let row = TxBlock {
            tx_id,
            block_id,
            merkle_branch,
            sent_merkle_proof_at: None,
            error_count: 0,
            last_error: None,
        };
        self.tx_blocks.insert(key, encode(&row)?)?;
        self.block_txs.insert(pair_key(block_id, tx_id), EMPTY)?;
        Ok(true)
    }

    fn get_tx_blocks(&self, tx_id: TxId) -> StoreResult<Vec<TxBlock>> {
        self.tx_blocks
            .scan_prefix(tx_id.to_be_bytes())
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    fn insert_block_double_spend(
        &self,
        tx_id: TxId,
        block_id: BlockId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<Vec<u8>>,
    ) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let key = block_ds_key(tx_id, block_id, ds_tx_hash);
        if self.block_ds.contains_key(&key)? {
            return Ok(false);
        }
        let row = TxBlockDoubleSpend {
            tx_id,
            block_id,
            ds_tx_hash: *ds_tx_hash,
            ds_tx_payload,
            sent_ds_notification_at: None,
            error_count: 0,
            last_error: None,
        };
        self.block_ds.insert(key, encode(&row)?)?;
        Ok(true)
    }

    fn get_block_double_spends(&self, tx_id: TxId) -> StoreResult<Vec<TxBlockDoubleSpend>> {
        self.block_ds
            .scan_prefix(tx_id.to_be_bytes())
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    fn insert_mempool_double_spend(
        &self,
        tx_id: TxId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<Vec<u8>>,
    ) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let key = mempool_ds_key(tx_id, ds_tx_hash);
        if self.mempool_ds.contains_key(&key)? {
            return Ok(false);
        }
        let row = TxMempoolDoubleSpendAttempt {
            tx_id,
            ds_tx_hash: *ds_tx_hash,
            ds_tx_payload,
            sent_ds_notification_at: None,
            error_count: 0,
            last_error: None,
        };
        self.mempool_ds.insert(key, encode(&row)?)?;
        Ok(true)
    }

    fn get_mempool_double_spends(
        &self,
        tx_id: TxId,
    ) -> StoreResult<Vec<TxMempoolDoubleSpendAttempt>> {
        self.mempool_ds
            .scan_prefix(tx_id.to_be_bytes())
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    fn get_txs_to_send_merkle_proof_notifications(
        &self,
        skip: usize,
        fetch: usize,
    ) -> StoreResult<Vec<NotificationData>> {
        let mut out = Vec::new();
        let mut skipped = 0;
        for entry in self.tx_blocks.iter() {
            if out.len() >= fetch {
                break;
            }
            let (_, value) = entry?;
            let row: TxBlock = decode(&value)?;
            if let Some(n) = self.merkle_notification(&row)? {
                if skipped < skip {
                    skipped += 1;
                } else {
                    out.push(n);
                }
            }
        }
        Ok(out)
    }

    fn get_txs_to_send_block_ds_notifications(&self) -> StoreResult<Vec<NotificationData>> {
        let mut out = Vec::new();
        for entry in self.block_ds.iter() {
            let (_, value) = entry?;
            let row: TxBlockDoubleSpend = decode(&value)?;
            out.extend(self.block_ds_notification(&row)?);
        }
        Ok(out)
    }

    fn get_txs_to_send_mempool_ds_notifications(&self) -> StoreResult<Vec<NotificationData>> {
        let mut out = Vec::new();
        for entry in self.mempool_ds.iter() {
            let (_, value) = entry?;
            let row: TxMempoolDoubleSpendAttempt = decode(&value)?;
            out.extend(self.mempool_ds_notification(&row)?);
        }
        Ok(out)
    }

    fn get_pending_notifications_for_block(
        &self,
        block_id: BlockId,
    ) -> StoreResult<Vec<NotificationData>> {
        let mut out = Vec::new();
        for entry in self.block_txs.scan_prefix(block_id.to_be_bytes()) {
            let (key, _) = entry?;
            let tx_id = trailing_id("block_txs", &key)?;
            if let Some(row) = Self::load::<TxBlock>(&self.tx_blocks, &pair_key(tx_id, block_id))? {
                out.extend(self.merkle_notification(&row)?);
            }
        }
        for entry in self.block_ds.iter() {
            let (_, value) = entry?;
            let row: TxBlockDoubleSpend = decode(&value)?;
            if row.block_id == block_id {
                out.extend(self.block_ds_notification(&row)?);
            }
        }
        Ok(out)
    }

    fn set_notification_send_date(
        &self,
        key: &NotificationKey,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match (key.kind, key.block_id, key.ds_tx_hash) {
            (NotificationKind::MerkleProof, Some(block_id), _) => self
                .update_row::<TxBlock, _>(&self.tx_blocks, &pair_key(key.tx_id, block_id), |r| {
                    r.sent_merkle_proof_at = Some(at);
                }),
            (NotificationKind::DoubleSpend, Some(block_id), Some(ds)) => self
                .update_row::<TxBlockDoubleSpend, _>(
                    &self.block_ds,
                    &block_ds_key(key.tx_id, block_id, &ds),
                    |r| r.sent_ds_notification_at = Some(at),
                ),
            (NotificationKind::DoubleSpendAttempt, _, Some(ds)) => self
                .update_row::<TxMempoolDoubleSpendAttempt, _>(
                    &self.mempool_ds,
                    &mempool_ds_key(key.tx_id, &ds),
                    |r| r.sent_ds_notification_at = Some(at),
                ),
            _ => Ok(false),
        }
    }

    fn set_notification_error(
        &self,
        key: &NotificationKey,
        message: &str,
        error_count: u32,
    ) -> StoreResult<bool> {
        let message = message.to_string();
        match (key.kind, key.block_id, key.ds_tx_hash) {
            (NotificationKind::MerkleProof, Some(block_id), _) => self
                .update_row::<TxBlock, _>(&self.tx_blocks, &pair_key(key.tx_id, block_id), |r| {
                    r.error_count = error_count;
                    r.last_error = Some(message);
                }),
            (NotificationKind::DoubleSpend, Some(block_id), Some(ds)) => self
                .update_row::<TxBlockDoubleSpend, _>(
                    &self.block_ds,
                    &block_ds_key(key.tx_id, block_id, &ds),
                    |r| {
                        r.error_count = error_count;
                        r.last_error = Some(message);
                    },
                ),
            (NotificationKind::DoubleSpendAttempt, _, Some(ds)) => self
                .update_row::<TxMempoolDoubleSpendAttempt, _>(
                    &self.mempool_ds,
                    &mempool_ds_key(key.tx_id, &ds),
                    |r| {
                        r.error_count = error_count;
                        r.last_error = Some(message);
                    },
                ),
            _ => Ok(false),
        }
    }

    // -- Maintenance --------------------------------------------------------

    fn clean_up_tx(
        &self,
        before: DateTime<Utc>,
        mempool_expiry: DateTime<Utc>,
    ) -> StoreResult<CleanUpStats> {
        let best_id = self.get_best_block()?.map(|b| b.id);
        let _guard = self.write_lock.lock();
        let mut stats = CleanUpStats::default();

        let mut expired_blocks = Vec::new();
        for entry in self.blocks.iter() {
            let (_, value) = entry?;
            let block: Block = decode(&value)?;
            if block.block_time < before && Some(block.id) != best_id {
                expired_blocks.push(block);
            }
        }

        // Transactions mined in an expired block go with it.
        let mut doomed: HashSet<TxId> = HashSet::new();
        for block in &expired_blocks {
            for entry in self.block_txs.scan_prefix(block.id.to_be_bytes()) {
                let (key, _) = entry?;
                doomed.insert(trailing_id("block_txs", &key)?);
            }
        }
        for block in &expired_blocks {
            self.delete_block_rows(block)?;
            stats.blocks += 1;
        }

        let mut to_delete = Vec::new();
        for entry in self.txs.iter() {
            let (_, value) = entry?;
            let tx: Tx = decode(&value)?;
            let never_mined = self.tx_blocks.scan_prefix(tx.id.to_be_bytes()).next().is_none();
            if doomed.contains(&tx.id) || (never_mined && tx.received_at < mempool_expiry) {
                to_delete.push(tx);
            }
        }
        for tx in &to_delete {
            self.delete_tx_rows(tx)?;
            stats.txs += 1;
        }

        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
