//! # Streamed Block Codec
//!
//! Reads a serialized block from any [`AsyncRead`] one transaction at a
//! time. Each transaction is hashed as soon as its last byte arrives and
//! handed to a visitor together with its raw bytes; the block as a whole is
//! never held in memory. Only the list of txids is kept, since the merkle
//! root (and every merkle branch) needs it.
//!
//! ## Limits
//!
//! Every byte read counts against `max_size`. Length prefixes are checked
//! against the bytes remaining under that limit before anything is
//! allocated, so a corrupt count cannot trigger a huge allocation.
//!
//! ## Validation
//!
//! The codec is not a consensus validator. It checks that the header hashes
//! to the requested block hash, that the recomputed merkle root matches the
//! header, and that the stream ends exactly after the last transaction.

use chrono::{DateTime, TimeZone, Utc};
use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::crypto::{merkle_root, Hash256};
use crate::storage::OutPoint;

/// Serialized header length.
pub const HEADER_SIZE: usize = 80;

/// Smallest possible serialized transaction: version, one empty input,
/// one empty output, lock time.
const MIN_TX_SIZE: u64 = 4 + 1 + 41 + 1 + 9 + 4;
const MIN_INPUT_SIZE: u64 = 32 + 4 + 1 + 4;
const MIN_OUTPUT_SIZE: u64 = 8 + 1;

/// Scripts are read in slices of this size.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(std::io::Error),

    #[error("block stream ended early")]
    Truncated,

    #[error("block exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("header hashes to {actual}, expected {expected}")]
    HashMismatch { expected: Hash256, actual: Hash256 },

    #[error("merkle root mismatch: header {header}, computed {computed}")]
    MerkleMismatch { header: Hash256, computed: Hash256 },

    #[error("malformed block: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let hash_at = |at: usize| {
            let mut h = [0u8; 32];
            h.copy_from_slice(&bytes[at..at + 32]);
            Hash256(h)
        };
        Self {
            version: u32_at(0) as i32,
            prev_hash: hash_at(4),
            merkle_root: hash_at(36),
            time: u32_at(68),
            bits: u32_at(72),
            nonce: u32_at(76),
        }
    }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::digest(&self.serialize())
    }

    pub fn block_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.time), 0)
            .single()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Parsed output
// ---------------------------------------------------------------------------

/// What the visitor sees of each transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTx {
    pub hash: Hash256,
    /// Outpoints spent by the transaction. Empty for a coinbase.
    pub inputs: Vec<OutPoint>,
    pub output_count: usize,
}

/// Summary of a fully read block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    pub header: BlockHeader,
    pub hash: Hash256,
    /// Txids in block order.
    pub tx_hashes: Vec<Hash256>,
    /// Bytes consumed from the stream.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Byte source that enforces the size limit and optionally captures what
/// it reads.
struct LimitedReader<R> {
    inner: BufReader<R>,
    consumed: u64,
    limit: u64,
    capture: Vec<u8>,
    capturing: bool,
}

impl<R: AsyncRead + Unpin> LimitedReader<R> {
    fn new(inner: R, limit: u64) -> Self {
        Self {
            inner: BufReader::new(inner),
            consumed: 0,
            limit,
            capture: Vec::new(),
            capturing: false,
        }
    }

    fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        if buf.len() as u64 > self.remaining() {
            return Err(CodecError::TooLarge { limit: self.limit });
        }
        self.inner.read_exact(buf).await?;
        self.consumed += buf.len() as u64;
        if self.capturing {
            self.capture.extend_from_slice(buf);
        }
        Ok(())
    }

    async fn read_u32(&mut self) -> Result<u32, CodecError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(u32::from_le_bytes(b))
    }

    async fn read_hash(&mut self) -> Result<Hash256, CodecError> {
        let mut b = [0u8; 32];
        self.read_exact(&mut b).await?;
        Ok(Hash256(b))
    }

    /// Bitcoin CompactSize integer.
    async fn read_varint(&mut self) -> Result<u64, CodecError> {
        let mut first = [0u8; 1];
        self.read_exact(&mut first).await?;
        Ok(match first[0] {
            0xfd => {
                let mut b = [0u8; 2];
                self.read_exact(&mut b).await?;
                u64::from(u16::from_le_bytes(b))
            }
            0xfe => {
                let mut b = [0u8; 4];
                self.read_exact(&mut b).await?;
                u64::from(u32::from_le_bytes(b))
            }
            0xff => {
                let mut b = [0u8; 8];
                self.read_exact(&mut b).await?;
                u64::from_le_bytes(b)
            }
            n => u64::from(n),
        })
    }

    /// Read a count and reject it if that many items of `min_item_size`
    /// cannot fit in the remaining budget.
    async fn read_count(&mut self, min_item_size: u64, what: &str) -> Result<u64, CodecError> {
        let count = self.read_varint().await?;
        if count.saturating_mul(min_item_size) > self.remaining() {
            return Err(CodecError::Malformed(format!(
                "{what} count {count} cannot fit in the remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Consume a length-prefixed script without keeping it beyond the
    /// capture buffer.
    async fn skip_script(&mut self) -> Result<(), CodecError> {
        let mut len = self.read_count(1, "script byte").await?;
        let mut chunk = vec![0u8; READ_CHUNK.min(len as usize)];
        while len > 0 {
            let n = (len as usize).min(chunk.len());
            self.read_exact(&mut chunk[..n]).await?;
            len -= n as u64;
        }
        Ok(())
    }

    async fn at_eof(&mut self) -> Result<bool, CodecError> {
        let mut probe = [0u8; 1];
        let n = self.inner.read(&mut probe).await.map_err(CodecError::from)?;
        Ok(n == 0)
    }
}

/// Read one transaction, returning what the visitor needs. The raw bytes
/// are left in `reader.capture`.
async fn read_tx<R: AsyncRead + Unpin>(reader: &mut LimitedReader<R>) -> Result<ParsedTx, CodecError> {
    reader.capture.clear();
    reader.capturing = true;

    let _version = reader.read_u32().await?;

    let input_count = reader.read_count(MIN_INPUT_SIZE, "input").await?;
    let mut inputs = Vec::with_capacity(input_count as usize);
    for _ in 0..input_count {
        let prev = reader.read_hash().await?;
        let n = reader.read_u32().await?;
        reader.skip_script().await?;
        let _sequence = reader.read_u32().await?;
        let outpoint = OutPoint::new(prev, n);
        if !outpoint.is_null() {
            inputs.push(outpoint);
        }
    }

    let output_count = reader.read_count(MIN_OUTPUT_SIZE, "output").await?;
    for _ in 0..output_count {
        let mut value = [0u8; 8];
        reader.read_exact(&mut value).await?;
        reader.skip_script().await?;
    }

    let _lock_time = reader.read_u32().await?;
    reader.capturing = false;

    Ok(ParsedTx {
        hash: Hash256::digest(&reader.capture),
        inputs,
        output_count: output_count as usize,
    })
}

/// Stream a block from `source`, calling `visit(index, tx, raw)` for every
/// transaction in block order.
///
/// When `expected` is given the header must hash to it. Reading more than
/// `max_size` bytes fails with [`CodecError::TooLarge`]. A visitor error
/// aborts the read and is returned unchanged.
pub async fn read_block<R, F, E>(
    source: R,
    expected: Option<&Hash256>,
    max_size: u64,
    mut visit: F,
) -> Result<ParsedBlock, E>
where
    R: AsyncRead + Unpin,
    F: FnMut(usize, &ParsedTx, &[u8]) -> Result<(), E>,
    E: From<CodecError>,
{
    let mut reader = LimitedReader::new(source, max_size);

    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header).await?;
    let header = BlockHeader::parse(&raw_header);
    let hash = Hash256::digest(&raw_header);
    if let Some(expected) = expected {
        if *expected != hash {
            return Err(CodecError::HashMismatch {
                expected: *expected,
                actual: hash,
            }
            .into());
        }
    }

    let tx_count = reader.read_count(MIN_TX_SIZE, "transaction").await?;
    if tx_count == 0 {
        return Err(CodecError::Malformed("block has no transactions".into()).into());
    }

    let mut tx_hashes = Vec::with_capacity(tx_count.min(1 << 20) as usize);
    for index in 0..tx_count as usize {
        let tx = read_tx(&mut reader).await?;
        visit(index, &tx, &reader.capture)?;
        tx_hashes.push(tx.hash);
    }

    if !reader.at_eof().await? {
        return Err(CodecError::Malformed("trailing bytes after last transaction".into()).into());
    }

    let computed = merkle_root(&tx_hashes);
    if computed != header.merkle_root {
        return Err(CodecError::MerkleMismatch {
            header: header.merkle_root,
            computed,
        }
        .into());
    }

    Ok(ParsedBlock {
        header,
        hash,
        tx_hashes,
        size: reader.consumed,
    })
}
