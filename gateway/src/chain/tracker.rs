//! # Chain Tracker
//!
//! Ingests block hashes announced by discovery, one block at a time, in
//! arrival order. For every block it:
//!
//! 1. streams and parses the block from a peer, looking up each
//!    transaction and each spent outpoint in the store as it goes;
//! 2. decides whether the block joins the active chain and, if it does,
//!    walks back through its ancestors (fetching missing headers) until it
//!    meets the active chain or the fork window runs out;
//! 3. writes chain membership, merkle-proof rows and double-spend rows;
//! 4. hands the block's pending notifications to the scheduler.
//!
//! ## Failure model
//!
//! All peer calls of a block happen before its first write. A timeout,
//! disconnect or malformed block therefore leaves the store exactly as it
//! was; the hash is simply processed again when it is announced again (or
//! at the next start, through [`BlockParser::recover`]).
//!
//! ## Fork window
//!
//! Activation never looks further back than
//! `max_block_chain_length_for_fork` ancestors. Blocks below that window
//! keep whatever chain membership they had.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::codec::{read_block, CodecError};
use super::status::{BlockParserStatus, ParsedBlockStats};
use crate::config::{BlockParserConfig, GatewayConfig};
use crate::crypto::{merkle_branch, Hash256};
use crate::faults::{FaultInjection, FaultPoint, InjectedFault, NoFaults};
use crate::notification::NotificationScheduler;
use crate::resolver::DoubleSpendResolver;
use crate::rpc::{with_timeout, BlockHeaderInfo, PeerRpc, RpcError};
use crate::storage::{BlockId, NewBlock, StoreError, TxId, TxStore};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("block download timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Fault(#[from] InjectedFault),
}

/// What processing one hash did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Already parsed for both passes; nothing was touched.
    Duplicate,
    Parsed {
        block_id: BlockId,
        on_active_chain: bool,
        txs_found: u64,
        ds_found: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct QueuedBlock {
    hash: Hash256,
    queued_at: Instant,
}

/// A tracked transaction whose input was spent by a different block tx.
struct Conflict {
    conflicted: TxId,
    ds_tx_hash: Hash256,
    ds_tx_payload: Vec<u8>,
}

/// Chain-membership changes decided before anything is written.
struct ActivationPlan {
    activate: bool,
    /// Ancestors to mark active, nearest first.
    path: Vec<(u64, Hash256)>,
    /// Ancestors the store has never seen.
    missing: Vec<NewBlock>,
}

pub struct BlockParser {
    store: Arc<dyn TxStore>,
    rpc: Arc<dyn PeerRpc>,
    scheduler: Arc<NotificationScheduler>,
    resolver: DoubleSpendResolver,
    status: Arc<BlockParserStatus>,
    faults: Arc<dyn FaultInjection>,
    config: BlockParserConfig,
    request_timeout: Duration,
    download_timeout: Duration,
    queue_tx: mpsc::UnboundedSender<QueuedBlock>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<QueuedBlock>>,
}

impl BlockParser {
    pub fn new(
        store: Arc<dyn TxStore>,
        rpc: Arc<dyn PeerRpc>,
        scheduler: Arc<NotificationScheduler>,
        status: Arc<BlockParserStatus>,
        config: &GatewayConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            resolver: DoubleSpendResolver::new(store.clone(), config.notifications.max_descendant_depth),
            store,
            rpc,
            scheduler,
            status,
            faults: Arc::new(NoFaults),
            config: config.block_parser.clone(),
            request_timeout: config.rpc.request_timeout(),
            download_timeout: config.rpc.block_download_timeout(),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }

    pub fn with_faults(mut self, faults: Arc<dyn FaultInjection>) -> Self {
        self.faults = faults;
        self
    }

    pub fn status(&self) -> &Arc<BlockParserStatus> {
        &self.status
    }

    /// Queue a hash for processing. Never blocks.
    pub fn enqueue(&self, hash: Hash256) {
        let item = QueuedBlock {
            hash,
            queued_at: Instant::now(),
        };
        if self.queue_tx.send(item).is_ok() {
            self.status.queued();
        }
    }

    /// Queue every block missing a parse pass and the peers' current tip.
    pub async fn recover(&self) -> Result<usize, TrackerError> {
        let unparsed = self.store.get_unparsed_blocks()?;
        let mut queued = unparsed.len();
        for block in unparsed {
            self.enqueue(block.hash);
        }
        match self.peer(self.rpc.get_best_block_hash()).await {
            Ok(best) => {
                self.enqueue(best);
                queued += 1;
            }
            Err(e) => warn!(error = %e, "could not fetch best block hash during recovery"),
        }
        info!(queued, "block parser recovery queued blocks");
        Ok(queued)
    }

    /// Process queued hashes until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.config.dont_parse_blocks {
            info!("block parsing disabled");
            return;
        }
        let mut rx = self.queue_rx.lock().await;
        loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    self.status.dequeued();
                    self.handle(item).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("block parser stopped");
    }

    /// Process everything currently queued, including ancestors queued
    /// along the way. Returns the number of hashes handled.
    pub async fn process_queued(&self) -> usize {
        let mut rx = self.queue_rx.lock().await;
        let mut handled = 0;
        while let Ok(item) = rx.try_recv() {
            self.status.dequeued();
            self.handle(item).await;
            handled += 1;
        }
        handled
    }

    /// Process one hash immediately, bypassing the queue.
    pub async fn process_block(&self, hash: &Hash256) -> Result<BlockOutcome, TrackerError> {
        let item = QueuedBlock {
            hash: *hash,
            queued_at: Instant::now(),
        };
        let result = self.parse(item).await;
        self.record(&item.hash, &result);
        result
    }

    async fn handle(&self, item: QueuedBlock) {
        let result = self.parse(item).await;
        self.record(&item.hash, &result);
    }

    fn record(&self, hash: &Hash256, result: &Result<BlockOutcome, TrackerError>) {
        self.status.block_processed();
        match result {
            Ok(BlockOutcome::Duplicate) => {
                self.status.block_duplicated();
                debug!(%hash, "block already parsed");
            }
            Ok(BlockOutcome::Parsed {
                on_active_chain,
                txs_found,
                ds_found,
                ..
            }) => {
                info!(%hash, active = on_active_chain, txs_found, ds_found, "block parsed");
            }
            Err(e) => {
                self.status.error();
                warn!(%hash, error = %e, "block processing failed");
            }
        }
    }

    async fn parse(&self, item: QueuedBlock) -> Result<BlockOutcome, TrackerError> {
        let started = Instant::now();
        let hash = item.hash;

        let existing = self.store.get_block(&hash)?;
        if existing.as_ref().is_some_and(|b| b.is_fully_parsed()) {
            return Ok(BlockOutcome::Duplicate);
        }
        let height = match &existing {
            Some(block) => block.height,
            None => self.peer(self.rpc.get_block_header(&hash)).await?.height,
        };

        // -- Download and scan --------------------------------------------

        let mut found: Vec<(TxId, usize)> = Vec::new();
        let mut conflicts: Vec<Conflict> = Vec::new();
        let store = &self.store;
        let scan = async {
            let stream = self.peer(self.rpc.get_block_as_stream(&hash)).await?;
            read_block(stream, Some(&hash), self.config.max_block_size, |index, tx, raw| {
                if let Some(tracked) = store.get_tx_by_hash(&tx.hash)? {
                    found.push((tracked.id, index));
                }
                for outpoint in &tx.inputs {
                    for spender in store.get_spenders(outpoint)? {
                        let Some(spender_tx) = store.get_tx(spender)? else {
                            continue;
                        };
                        if spender_tx.hash != tx.hash {
                            conflicts.push(Conflict {
                                conflicted: spender,
                                ds_tx_hash: tx.hash,
                                ds_tx_payload: raw.to_vec(),
                            });
                        }
                    }
                }
                Ok::<(), TrackerError>(())
            })
            .await
        };
        let parsed = tokio::time::timeout(self.download_timeout, scan)
            .await
            .map_err(|_| TrackerError::Timeout(self.download_timeout))??;
        let download = started.elapsed();

        // An active row keeps its membership. An inactive unparsed row is
        // either a fork ancestor or left over from a commit that failed
        // before activation, so membership is decided again.
        let plan = match &existing {
            Some(block) if block.on_active_chain => ActivationPlan {
                activate: false,
                path: Vec::new(),
                missing: Vec::new(),
            },
            _ => self.plan_activation(parsed.header.prev_hash, height).await?,
        };

        // -- Commit ---------------------------------------------------------

        self.faults.before_commit(FaultPoint::BlockParser)?;

        let block_id = self.store.insert_or_update_block(&NewBlock {
            hash,
            prev_hash: parsed.header.prev_hash,
            height,
            on_active_chain: false,
            block_time: parsed.header.block_time(),
        })?;
        for ancestor in &plan.missing {
            self.store.insert_or_update_block(ancestor)?;
        }
        if plan.activate {
            for (h, ancestor) in plan.path.iter().rev() {
                self.store.set_on_active_chain(*h, ancestor)?;
            }
            self.store.set_on_active_chain(height, &hash)?;
        }

        let mut txs_found = 0;
        for (tx_id, index) in &found {
            self.store
                .insert_tx_block(*tx_id, block_id, merkle_branch(&parsed.tx_hashes, *index))?;
            txs_found += 1;
        }
        let mut ds_found = 0;
        for c in &conflicts {
            ds_found += self.resolver.record_block_double_spend(
                c.conflicted,
                block_id,
                &c.ds_tx_hash,
                Some(&c.ds_tx_payload),
            )? as u64;
        }

        let now = Utc::now();
        self.store.set_block_parsed_for_merkle(block_id, now)?;
        self.store.set_block_parsed_for_ds(block_id, now)?;

        // The commit is durable; a failing hook is reported only once the
        // follow-up work below has run.
        let hook = self.faults.after_commit(FaultPoint::BlockParser);

        for ancestor in &plan.missing {
            self.enqueue(ancestor.hash);
        }

        // -- Status and notifications ---------------------------------------

        let on_active_chain = self
            .store
            .get_block_by_id(block_id)?
            .is_some_and(|b| b.on_active_chain);
        self.status.set_last_block(hash, height);
        if let Some(best) = self.store.get_best_block()? {
            self.status.set_best_block(best.hash, best.height);
        }
        self.status.block_parsed(ParsedBlockStats {
            bytes: parsed.size,
            txs: parsed.tx_hashes.len() as u64,
            txs_found,
            ds_found,
            download,
            parse: started.elapsed(),
            in_queue_and_parse: item.queued_at.elapsed(),
        });

        if on_active_chain {
            self.queue_notifications(block_id)?;
            // Re-activated ancestors may hold rows that were parked while
            // they sat on a stale fork.
            for (_, ancestor) in &plan.path {
                if let Some(block) = self.store.get_block(ancestor)? {
                    if block.is_fully_parsed() {
                        self.queue_notifications(block.id)?;
                    }
                }
            }
        }
        hook?;

        Ok(BlockOutcome::Parsed {
            block_id,
            on_active_chain,
            txs_found,
            ds_found,
        })
    }

    async fn plan_activation(&self, prev_hash: Hash256, height: u64) -> Result<ActivationPlan, TrackerError> {
        let activate = match self.store.get_best_block()? {
            None => true,
            Some(best) => prev_hash == best.hash || height > best.height,
        };
        let mut plan = ActivationPlan {
            activate,
            path: Vec::new(),
            missing: Vec::new(),
        };
        if !activate {
            return Ok(plan);
        }

        let mut cursor = prev_hash;
        for _ in 0..self.config.max_block_chain_length_for_fork {
            if cursor == Hash256::ZERO {
                break;
            }
            match self.store.get_block(&cursor)? {
                Some(block) if block.on_active_chain => break,
                Some(block) => {
                    plan.path.push((block.height, block.hash));
                    cursor = block.prev_hash;
                }
                None => {
                    let info: BlockHeaderInfo = self.peer(self.rpc.get_block_header(&cursor)).await?;
                    plan.path.push((info.height, info.hash));
                    plan.missing.push(NewBlock {
                        hash: info.hash,
                        prev_hash: info.prev_hash,
                        height: info.height,
                        on_active_chain: false,
                        block_time: chrono::DateTime::from_timestamp(i64::from(info.time), 0)
                            .unwrap_or_default(),
                    });
                    cursor = info.prev_hash;
                }
            }
        }
        Ok(plan)
    }

    fn queue_notifications(&self, block_id: BlockId) -> Result<(), StoreError> {
        let pending = self.store.get_pending_notifications_for_block(block_id)?;
        let total = pending.len();
        let queued = pending
            .into_iter()
            .filter(|item| self.scheduler.enqueue(item.clone()))
            .count();
        if queued < total {
            debug!(block = block_id, queued, total, "notification queue full; sweep will retry");
        }
        Ok(())
    }

    async fn peer<T, F>(&self, call: F) -> Result<T, RpcError>
    where
        F: std::future::Future<Output = Result<T, RpcError>>,
    {
        with_timeout(self.request_timeout, call).await
    }
}
