//! Attribution of a double spend to everything it invalidates.
//!
//! When a tracked transaction loses an input to a conflicting spend, every
//! tracked transaction built on top of it is invalidated too. The resolver
//! walks the spend graph forward from the conflicted transaction and records
//! one double-spend row for each descendant (the transaction itself
//! included) that asked for double-spend checks.
//!
//! ## Bounds
//!
//! The walk is breadth-first with a visited set, so diamond-shaped graphs
//! are visited once, and stops `max_depth` levels below the start.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::crypto::Hash256;
use crate::storage::{BlockId, StoreResult, Tx, TxId, TxStore};

pub struct DoubleSpendResolver {
    store: Arc<dyn TxStore>,
    max_depth: usize,
}

impl DoubleSpendResolver {
    pub fn new(store: Arc<dyn TxStore>, max_depth: usize) -> Self {
        Self { store, max_depth }
    }

    /// Tracked transactions with `ds_check` set among `start` and its
    /// descendants, in breadth-first order.
    pub fn affected_txs(&self, start: TxId) -> StoreResult<Vec<Tx>> {
        let mut affected = Vec::new();
        let mut visited = HashSet::from([start]);
        let mut frontier = VecDeque::from([(start, 0usize)]);

        while let Some((id, depth)) = frontier.pop_front() {
            let Some(tx) = self.store.get_tx(id)? else {
                continue;
            };
            if depth < self.max_depth {
                for child in self.store.get_child_txs(&tx.hash)? {
                    if visited.insert(child) {
                        frontier.push_back((child, depth + 1));
                    }
                }
            }
            if tx.ds_check {
                affected.push(tx);
            }
        }
        Ok(affected)
    }

    /// Record that `ds_tx_hash`, mined in `block_id`, double-spends
    /// `conflicted`. Returns how many new rows were written.
    pub fn record_block_double_spend(
        &self,
        conflicted: TxId,
        block_id: BlockId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<&[u8]>,
    ) -> StoreResult<usize> {
        let mut written = 0;
        for tx in self.affected_txs(conflicted)? {
            if self.store.insert_block_double_spend(
                tx.id,
                block_id,
                ds_tx_hash,
                ds_tx_payload.map(<[u8]>::to_vec),
            )? {
                written += 1;
            }
        }
        if written > 0 {
            debug!(tx = conflicted, block = block_id, ds = %ds_tx_hash, written, "block double spend recorded");
        }
        Ok(written)
    }

    /// Record a double-spend attempt seen in a peer mempool.
    pub fn record_mempool_double_spend(
        &self,
        conflicted: TxId,
        ds_tx_hash: &Hash256,
        ds_tx_payload: Option<&[u8]>,
    ) -> StoreResult<usize> {
        let mut written = 0;
        for tx in self.affected_txs(conflicted)? {
            if self
                .store
                .insert_mempool_double_spend(tx.id, ds_tx_hash, ds_tx_payload.map(<[u8]>::to_vec))?
            {
                written += 1;
            }
        }
        if written > 0 {
            debug!(tx = conflicted, ds = %ds_tx_hash, written, "mempool double spend attempt recorded");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{GatewayDb, NewTx, OutPoint, TxInput};
    use chrono::Utc;

    /// Insert a tx spending `parents` (output 0 of each).
    fn add_tx(db: &GatewayDb, tag: u8, parents: &[Hash256], ds_check: bool) -> (TxId, Hash256) {
        let hash = Hash256([tag; 32]);
        let mut tx = NewTx::submitted(hash, vec![tag], Utc::now());
        tx.ds_check = ds_check;
        tx.inputs = parents
            .iter()
            .enumerate()
            .map(|(n, p)| TxInput {
                n: n as u32,
                prev: OutPoint::new(*p, 0),
            })
            .collect();
        let id = db.insert_or_update_txs(&[tx], false, true).unwrap()[0];
        (id, hash)
    }

    fn resolver(db: &GatewayDb, depth: usize) -> DoubleSpendResolver {
        DoubleSpendResolver::new(Arc::new(db.clone()), depth)
    }

    #[test]
    fn attributes_to_every_ds_check_descendant() {
        let db = GatewayDb::open_temporary().unwrap();
        let (a, ha) = add_tx(&db, 1, &[Hash256([0xaa; 32])], true);
        let (b, hb) = add_tx(&db, 2, &[ha], false);
        let (c, _) = add_tx(&db, 3, &[hb], true);

        let ds = Hash256([0xdd; 32]);
        let written = resolver(&db, 10).record_block_double_spend(a, 7, &ds, Some(b"raw")).unwrap();
        assert_eq!(written, 2);
        assert_eq!(db.get_block_double_spends(a).unwrap().len(), 1);
        assert!(db.get_block_double_spends(b).unwrap().is_empty());
        assert_eq!(db.get_block_double_spends(c).unwrap()[0].ds_tx_hash, ds);
    }

    #[test]
    fn repeated_attribution_writes_nothing() {
        let db = GatewayDb::open_temporary().unwrap();
        let (a, _) = add_tx(&db, 1, &[Hash256([0xaa; 32])], true);
        let r = resolver(&db, 10);
        let ds = Hash256([0xdd; 32]);

        assert_eq!(r.record_mempool_double_spend(a, &ds, None).unwrap(), 1);
        assert_eq!(r.record_mempool_double_spend(a, &ds, None).unwrap(), 0);
        assert_eq!(db.get_mempool_double_spends(a).unwrap().len(), 1);
    }

    #[test]
    fn diamond_is_visited_once() {
        let db = GatewayDb::open_temporary().unwrap();
        let (a, ha) = add_tx(&db, 1, &[Hash256([0xaa; 32])], true);
        let (_, hb) = add_tx(&db, 2, &[ha], true);
        let (_, hc) = add_tx(&db, 3, &[ha], true);
        add_tx(&db, 4, &[hb, hc], true);

        let affected = resolver(&db, 10).affected_txs(a).unwrap();
        assert_eq!(affected.len(), 4);
    }

    #[test]
    fn walk_stops_at_max_depth() {
        let db = GatewayDb::open_temporary().unwrap();
        let (a, mut prev) = add_tx(&db, 1, &[Hash256([0xaa; 32])], true);
        for tag in 2..=5 {
            prev = add_tx(&db, tag, &[prev], true).1;
        }
        assert_eq!(resolver(&db, 2).affected_txs(a).unwrap().len(), 3);
        assert_eq!(resolver(&db, 0).affected_txs(a).unwrap().len(), 1);
    }
}
