//! Mempool reconciliation.
//!
//! A transaction the gateway accepted should sit in at least one peer
//! mempool until it is mined. Each pass takes the union of the peers'
//! mempools, asks the store which tracked transactions are absent (and not
//! mined on the active chain), and resubmits them in batches.
//!
//! ## Design
//!
//! - Passes never overlap: the pass holds a `tokio::sync::Mutex` taken with
//!   `try_lock`, so a slow pass makes the next tick a no-op instead of
//!   queueing behind it.
//! - The peer call and the bookkeeping write are separate steps. A write
//!   that fails (or never happens) leaves the transaction missing, so the
//!   next pass resubmits it again.
//! - Missing-inputs verdicts are counted per transaction; past
//!   `missing_inputs_retries` the transaction is parked in a terminal
//!   status and never resubmitted again.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::chain::BlockParserStatus;
use crate::config::{GatewayConfig, MempoolCheckerConfig};
use crate::crypto::Hash256;
use crate::faults::{FaultInjection, FaultPoint, InjectedFault, NoFaults};
use crate::resolver::DoubleSpendResolver;
use crate::rpc::{with_timeout, CollidedTx, PeerRpc, RawTxSubmission, RpcError, SubmitOutcome};
use crate::storage::{StoreError, Tx, TxStatus, TxStore};

#[derive(Debug, Error)]
pub enum CheckerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Fault(#[from] InjectedFault),
}

/// A transaction a peer refused, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTx {
    pub tx_hash: Hash256,
    pub payload: Option<Vec<u8>>,
    pub reason: String,
    /// Mempool transactions the refused one conflicted with.
    pub collided_with: Vec<CollidedTx>,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResubmitStats {
    pub missing: usize,
    pub accepted: usize,
    pub already_known: usize,
    pub missing_inputs: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub failed_writes: usize,
}

pub struct MempoolChecker {
    store: Arc<dyn TxStore>,
    rpc: Arc<dyn PeerRpc>,
    resolver: DoubleSpendResolver,
    parser_status: Arc<BlockParserStatus>,
    faults: Arc<dyn FaultInjection>,
    config: MempoolCheckerConfig,
    enabled: bool,
    request_timeout: Duration,
    pass: Mutex<()>,
}

impl MempoolChecker {
    pub fn new(
        store: Arc<dyn TxStore>,
        rpc: Arc<dyn PeerRpc>,
        parser_status: Arc<BlockParserStatus>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            resolver: DoubleSpendResolver::new(store.clone(), config.notifications.max_descendant_depth),
            store,
            rpc,
            parser_status,
            faults: Arc::new(NoFaults),
            config: config.mempool_checker.clone(),
            enabled: config.mempool_checker_enabled(),
            request_timeout: config.rpc.request_timeout(),
            pass: Mutex::new(()),
        }
    }

    pub fn with_faults(mut self, faults: Arc<dyn FaultInjection>) -> Self {
        self.faults = faults;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run one pass with `batch_size` transactions per submission.
    ///
    /// Returns `false` when a peer call failed and the whole pass should be
    /// retried soon; `true` otherwise, including when nothing was missing
    /// or another pass was already running.
    pub async fn check_mempool_and_resubmit_txs(&self, batch_size: usize) -> bool {
        let Ok(_pass) = self.pass.try_lock() else {
            debug!("mempool check already running");
            return true;
        };
        match self.reconcile(batch_size.max(1)).await {
            Ok(stats) => {
                if stats.missing > 0 {
                    info!(
                        missing = stats.missing,
                        accepted = stats.accepted,
                        already_known = stats.already_known,
                        missing_inputs = stats.missing_inputs,
                        rejected = stats.rejected,
                        failed_writes = stats.failed_writes,
                        "mempool check resubmitted missing transactions"
                    );
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "mempool check failed");
                false
            }
        }
    }

    async fn reconcile(&self, batch_size: usize) -> Result<ResubmitStats, CheckerError> {
        let mempool = with_timeout(self.request_timeout, self.rpc.get_raw_mempool()).await?;
        let min_age = chrono::Duration::seconds(self.config.resubmit_min_age_sec as i64);
        let missing = self.store.get_missing_transactions(&mempool, Utc::now() - min_age)?;

        let mut stats = ResubmitStats {
            missing: missing.len(),
            ..Default::default()
        };
        for chunk in missing.chunks(batch_size) {
            let (batch, txs): (Vec<RawTxSubmission>, Vec<&Tx>) = chunk
                .iter()
                .filter_map(|tx| {
                    let payload = tx.payload.clone()?;
                    Some((
                        RawTxSubmission {
                            hash: tx.hash,
                            payload,
                        },
                        tx,
                    ))
                })
                .unzip();
            stats.skipped += chunk.len() - txs.len();
            if batch.is_empty() {
                continue;
            }

            let outcomes = with_timeout(self.request_timeout, self.rpc.send_raw_transactions(&batch)).await?;
            if outcomes.len() != txs.len() {
                return Err(RpcError::Malformed(format!(
                    "expected {} outcomes, got {}",
                    txs.len(),
                    outcomes.len()
                ))
                .into());
            }
            for (tx, outcome) in txs.into_iter().zip(outcomes) {
                if let Err(e) = self.apply(tx, outcome, &mut stats) {
                    stats.failed_writes += 1;
                    warn!(tx = %tx.hash, error = %e, "could not record resubmission outcome");
                }
            }
        }
        Ok(stats)
    }

    fn apply(&self, tx: &Tx, outcome: SubmitOutcome, stats: &mut ResubmitStats) -> Result<(), CheckerError> {
        match outcome {
            SubmitOutcome::Accepted => {
                stats.accepted += 1;
                self.commit_resubmitted(tx)
            }
            SubmitOutcome::AlreadyKnown => {
                stats.already_known += 1;
                if self.config.refresh_already_known {
                    self.commit_resubmitted(tx)
                } else {
                    Ok(())
                }
            }
            SubmitOutcome::MissingInputs => {
                stats.missing_inputs += 1;
                let status = self
                    .store
                    .record_missing_inputs(tx.id, self.config.missing_inputs_retries)?;
                if status == TxStatus::MissingInputsMaxRetriesReached {
                    warn!(tx = %tx.hash, "missing inputs retries exhausted; giving up");
                }
                Ok(())
            }
            SubmitOutcome::Rejected {
                reason,
                collided_with,
            } => {
                stats.rejected += 1;
                if collided_with.is_empty() {
                    warn!(tx = %tx.hash, reason = %reason, "peer rejected resubmitted transaction");
                    return Ok(());
                }
                self.store.set_tx_status(tx.id, TxStatus::NodeRejected)?;
                for other in &collided_with {
                    self.resolver
                        .record_mempool_double_spend(tx.id, &other.hash, other.payload.as_deref())?;
                }
                info!(tx = %tx.hash, collisions = collided_with.len(), "resubmitted transaction double spent in mempool");
                Ok(())
            }
        }
    }

    fn commit_resubmitted(&self, tx: &Tx) -> Result<(), CheckerError> {
        self.faults.before_commit(FaultPoint::MempoolResubmit)?;
        self.store.mark_tx_resubmitted(tx.id, Utc::now())?;
        self.faults.after_commit(FaultPoint::MempoolResubmit)?;
        Ok(())
    }

    /// Record double-spend attempts against tracked transactions `invalid`
    /// collided with. Returns how many rows were written.
    pub fn process_invalid_tx(&self, invalid: &InvalidTx) -> Result<usize, CheckerError> {
        let hashes: Vec<Hash256> = invalid.collided_with.iter().map(|c| c.hash).collect();
        let mut written = 0;
        for tracked in self.store.get_txs_by_hashes(&hashes)? {
            written += self.resolver.record_mempool_double_spend(
                tracked.id,
                &invalid.tx_hash,
                invalid.payload.as_deref(),
            )?;
        }
        if written > 0 {
            info!(ds = %invalid.tx_hash, reason = %invalid.reason, written, "double spend attempt recorded");
        }
        Ok(written)
    }

    /// Periodic passes until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            info!("mempool checker disabled");
            return;
        }
        let mut delay = Duration::from_secs(self.config.interval_sec);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let backlog = self.parser_status.blocks_queued();
            if backlog > self.config.block_parser_queued_max {
                debug!(backlog, "block parser busy; mempool check postponed");
                delay = Duration::from_secs(self.config.unsuccessful_interval_sec);
                continue;
            }
            let ok = self
                .check_mempool_and_resubmit_txs(self.config.resubmit_batch_size)
                .await;
            delay = Duration::from_secs(if ok {
                self.config.interval_sec
            } else {
                self.config.unsuccessful_interval_sec
            });
        }
        debug!("mempool checker stopped");
    }
}
