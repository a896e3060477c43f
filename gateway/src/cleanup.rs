//! Periodic removal of old blocks and expired transactions.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CleanUpConfig;
use crate::storage::{CleanUpStats, StoreResult, TxStore};

pub struct CleanUpTask {
    store: Arc<dyn TxStore>,
    config: CleanUpConfig,
}

impl CleanUpTask {
    pub fn new(store: Arc<dyn TxStore>, config: CleanUpConfig) -> Self {
        Self { store, config }
    }

    /// Delete everything older than the configured retention as of `now`.
    pub fn clean_up_once(&self, now: DateTime<Utc>) -> StoreResult<CleanUpStats> {
        let before = now - ChronoDuration::days(i64::from(self.config.clean_up_tx_after_days));
        let mempool_expiry =
            now - ChronoDuration::days(i64::from(self.config.clean_up_tx_after_mempool_expired_days));
        let stats = self.store.clean_up_tx(before, mempool_expiry)?;
        if stats.blocks > 0 || stats.txs > 0 {
            info!(blocks = stats.blocks, txs = stats.txs, "clean-up removed old data");
        }
        Ok(stats)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_sec.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.clean_up_once(Utc::now()) {
                        warn!(error = %e, "clean-up failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("clean-up task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash256;
    use crate::storage::{GatewayDb, NewBlock, NewTx};

    #[test]
    fn removes_expired_rows_relative_to_now() {
        let db = GatewayDb::open_temporary().unwrap();
        let now = Utc::now();
        let old = now - ChronoDuration::days(30);

        // An old stale block and the current tip.
        db.insert_or_update_block(&NewBlock {
            hash: Hash256([1; 32]),
            prev_hash: Hash256::ZERO,
            height: 1,
            on_active_chain: false,
            block_time: old,
        })
        .unwrap();
        db.insert_or_update_block(&NewBlock {
            hash: Hash256([2; 32]),
            prev_hash: Hash256([1; 32]),
            height: 2,
            on_active_chain: true,
            block_time: now,
        })
        .unwrap();
        db.insert_or_update_txs(&[NewTx::submitted(Hash256([3; 32]), vec![3], old)], false, false)
            .unwrap();
        db.insert_or_update_txs(&[NewTx::submitted(Hash256([4; 32]), vec![4], now)], false, false)
            .unwrap();

        let task = CleanUpTask::new(Arc::new(db.clone()), CleanUpConfig::default());
        let stats = task.clean_up_once(now).unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.txs, 1);
        assert!(db.get_tx_by_hash(&Hash256([4; 32])).unwrap().is_some());
        assert!(db.get_block(&Hash256([2; 32])).unwrap().is_some());
    }
}
