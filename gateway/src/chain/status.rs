//! Live counters of the block parser.
//!
//! The parser is the only writer. Counters are plain atomics so status
//! readers never contend with it; the best/last block pointers sit behind a
//! mutex that is held only while copying them.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::MIB;
use crate::crypto::Hash256;

#[derive(Debug, Default, Clone, Copy)]
struct BlockPointers {
    best_block_hash: Option<Hash256>,
    best_block_height: Option<u64>,
    last_block_hash: Option<Hash256>,
    last_block_height: Option<u64>,
}

/// Timings and sizes of one successfully parsed block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedBlockStats {
    pub bytes: u64,
    pub txs: u64,
    pub txs_found: u64,
    pub ds_found: u64,
    /// Time spent streaming and decoding the block.
    pub download: Duration,
    /// Time from dequeue until the block was fully processed.
    pub parse: Duration,
    /// Time from enqueue until the block was fully processed.
    pub in_queue_and_parse: Duration,
}

/// Process-wide parser status. Created at startup, never persisted.
#[derive(Debug, Default)]
pub struct BlockParserStatus {
    blocks_processed: AtomicU64,
    blocks_parsed: AtomicU64,
    blocks_duplicated: AtomicU64,
    num_of_errors: AtomicU64,
    blocks_queued: AtomicU64,
    total_bytes: AtomicU64,
    total_txs: AtomicU64,
    total_txs_found: AtomicU64,
    total_ds_found: AtomicU64,
    last_block_parse_time_us: AtomicU64,
    last_block_in_queue_and_parse_time_us: AtomicU64,
    blocks_parse_time_us: AtomicU64,
    blocks_download_time_us: AtomicU64,
    max_parse_time_us: AtomicU64,
    pointers: Mutex<BlockPointers>,
}

impl BlockParserStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dequeue, whatever its outcome.
    pub fn block_processed(&self) {
        self.blocks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_duplicated(&self) {
        self.blocks_duplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.num_of_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queued(&self) {
        self.blocks_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dequeued(&self) {
        // Never wraps below zero.
        let _ = self
            .blocks_queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn blocks_queued(&self) -> u64 {
        self.blocks_queued.load(Ordering::Relaxed)
    }

    pub fn block_parsed(&self, stats: ParsedBlockStats) {
        let parse_us = stats.parse.as_micros() as u64;
        self.blocks_parsed.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(stats.bytes, Ordering::Relaxed);
        self.total_txs.fetch_add(stats.txs, Ordering::Relaxed);
        self.total_txs_found.fetch_add(stats.txs_found, Ordering::Relaxed);
        self.total_ds_found.fetch_add(stats.ds_found, Ordering::Relaxed);
        self.blocks_parse_time_us.fetch_add(parse_us, Ordering::Relaxed);
        self.blocks_download_time_us
            .fetch_add(stats.download.as_micros() as u64, Ordering::Relaxed);
        self.last_block_parse_time_us.store(parse_us, Ordering::Relaxed);
        self.last_block_in_queue_and_parse_time_us
            .store(stats.in_queue_and_parse.as_micros() as u64, Ordering::Relaxed);
        self.max_parse_time_us.fetch_max(parse_us, Ordering::Relaxed);
    }

    pub fn set_best_block(&self, hash: Hash256, height: u64) {
        let mut p = self.pointers.lock();
        p.best_block_hash = Some(hash);
        p.best_block_height = Some(height);
    }

    pub fn set_last_block(&self, hash: Hash256, height: u64) {
        let mut p = self.pointers.lock();
        p.last_block_hash = Some(hash);
        p.last_block_height = Some(height);
    }

    /// Consistent copy of every field plus the derived averages.
    pub fn snapshot(&self) -> BlockParserStatusSnapshot {
        let pointers = *self.pointers.lock();
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        let blocks_parsed = load(&self.blocks_parsed);
        let total_txs = load(&self.total_txs);
        let total_bytes = load(&self.total_bytes);
        let parse_ms = load(&self.blocks_parse_time_us) as f64 / 1000.0;
        let download_secs = load(&self.blocks_download_time_us) as f64 / 1_000_000.0;

        let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };

        BlockParserStatusSnapshot {
            blocks_processed: load(&self.blocks_processed),
            blocks_parsed,
            blocks_duplicated: load(&self.blocks_duplicated),
            num_of_errors: load(&self.num_of_errors),
            blocks_queued: load(&self.blocks_queued),
            total_bytes,
            total_txs,
            total_txs_found: load(&self.total_txs_found),
            total_ds_found: load(&self.total_ds_found),
            last_block_parse_time_ms: load(&self.last_block_parse_time_us) as f64 / 1000.0,
            last_block_in_queue_and_parse_time_ms: load(&self.last_block_in_queue_and_parse_time_us)
                as f64
                / 1000.0,
            average_parse_time_ms: ratio(parse_ms, blocks_parsed as f64),
            average_tx_parse_time_ms: ratio(parse_ms, total_txs as f64),
            average_block_download_speed_mib_s: ratio(total_bytes as f64 / MIB as f64, download_secs),
            max_parse_time_ms: load(&self.max_parse_time_us) as f64 / 1000.0,
            best_block_hash: pointers.best_block_hash.map(|h| h.to_hex()),
            best_block_height: pointers.best_block_height,
            last_block_hash: pointers.last_block_hash.map(|h| h.to_hex()),
            last_block_height: pointers.last_block_height,
        }
    }
}

/// Point-in-time copy of [`BlockParserStatus`], served by the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockParserStatusSnapshot {
    pub blocks_processed: u64,
    pub blocks_parsed: u64,
    pub blocks_duplicated: u64,
    pub num_of_errors: u64,
    pub blocks_queued: u64,
    pub total_bytes: u64,
    pub total_txs: u64,
    pub total_txs_found: u64,
    pub total_ds_found: u64,
    pub last_block_parse_time_ms: f64,
    pub last_block_in_queue_and_parse_time_ms: f64,
    pub average_parse_time_ms: f64,
    pub average_tx_parse_time_ms: f64,
    pub average_block_download_speed_mib_s: f64,
    pub max_parse_time_ms: f64,
    pub best_block_hash: Option<String>,
    pub best_block_height: Option<u64>,
    pub last_block_hash: Option<String>,
    pub last_block_height: Option<u64>,
}

impl BlockParserStatusSnapshot {
    /// One-paragraph operator summary.
    pub fn summary(&self) -> String {
        let best = match (&self.best_block_hash, self.best_block_height) {
            (Some(hash), Some(height)) => format!("{hash} at height {height}"),
            _ => "none".to_string(),
        };
        format!(
            "Block parser: {} processed, {} parsed, {} duplicated, {} errors, {} queued. \
             {} bytes in {} txs ({} tracked, {} double spends). \
             Parse time avg {:.2} ms (max {:.2} ms, last {:.2} ms, {:.4} ms/tx), \
             download {:.2} MiB/s. Best block: {}.",
            self.blocks_processed,
            self.blocks_parsed,
            self.blocks_duplicated,
            self.num_of_errors,
            self.blocks_queued,
            self.total_bytes,
            self.total_txs,
            self.total_txs_found,
            self.total_ds_found,
            self.average_parse_time_ms,
            self.max_parse_time_ms,
            self.last_block_parse_time_ms,
            self.average_tx_parse_time_ms,
            self.average_block_download_speed_mib_s,
            best,
        )
    }
}
