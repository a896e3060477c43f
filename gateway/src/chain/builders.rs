//! Serializable blocks and transactions for assembling fixtures.
//!
//! Compiled for unit tests and behind the `test-util` feature, which the
//! integration tests and benchmarks enable.

use super::codec::BlockHeader;
use crate::crypto::{merkle_root, Hash256};
use crate::storage::OutPoint;

pub(crate) fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInput {
    pub prev: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub value: u64,
    pub script: Vec<u8>,
}

/// A transaction in serializable form. Used to assemble blocks for mock
/// peers and benchmarks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTx {
    pub version: u32,
    pub inputs: Vec<RawInput>,
    pub outputs: Vec<RawOutput>,
    pub lock_time: u32,
}

impl RawTx {
    /// A coinbase whose script carries `tag`, so distinct tags give
    /// distinct txids.
    pub fn coinbase(tag: u64) -> Self {
        Self {
            version: 1,
            inputs: vec![RawInput {
                prev: OutPoint::new(Hash256::ZERO, u32::MAX),
                script: tag.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![RawOutput {
                value: 50_0000_0000,
                script: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    /// A one-output transaction spending `prevs`.
    pub fn spending(prevs: &[OutPoint], tag: u32) -> Self {
        Self {
            version: 1,
            inputs: prevs
                .iter()
                .map(|prev| RawInput {
                    prev: *prev,
                    script: vec![0x00],
                    sequence: u32::MAX,
                })
                .collect(),
            outputs: vec![RawOutput {
                value: 1000,
                script: vec![0x51],
            }],
            lock_time: tag,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(input.prev.tx_hash.as_bytes());
            out.extend_from_slice(&input.prev.n.to_le_bytes());
            write_varint(&mut out, input.script.len() as u64);
            out.extend_from_slice(&input.script);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut out, output.script.len() as u64);
            out.extend_from_slice(&output.script);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn txid(&self) -> Hash256 {
        Hash256::digest(&self.serialize())
    }

    pub fn outpoint(&self, n: u32) -> OutPoint {
        OutPoint::new(self.txid(), n)
    }
}

/// A block in serializable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub header: BlockHeader,
    pub txs: Vec<RawTx>,
}

impl RawBlock {
    /// Assemble a block on top of `prev_hash` with a correct merkle root.
    pub fn new(prev_hash: Hash256, time: u32, txs: Vec<RawTx>) -> Self {
        let ids: Vec<Hash256> = txs.iter().map(RawTx::txid).collect();
        Self {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: merkle_root(&ids),
                time,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            txs,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header.serialize().to_vec();
        write_varint(&mut out, self.txs.len() as u64);
        for tx in &self.txs {
            out.extend_from_slice(&tx.serialize());
        }
        out
    }
}
