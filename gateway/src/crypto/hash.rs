//! # Hashing Utilities
//!
//! Bitcoin-style hashing: SHA-256, double SHA-256, and the [`Hash256`]
//! identifier used for every block and transaction the gateway tracks.
//!
//! ## Byte order
//!
//! A `Hash256` stores the raw digest exactly as `SHA-256(SHA-256(data))`
//! produces it (the "internal" order used on the wire and inside merkle
//! trees). Peer RPC interfaces display hashes byte-reversed, so `to_hex` /
//! `from_hex` reverse on the way out and in. Never hex-encode the inner array
//! directly when talking to a node.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a display-order hash string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte double-SHA-256 identifier (block hash or txid).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash. Used as the previous-hash of a genesis block.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Wrap raw digest bytes (internal order).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes (internal order).
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Display-order hex, as printed by node RPC.
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    /// Parse display-order hex.
    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let bytes = hex::decode(s.trim()).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(HashParseError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        out.reverse();
        Ok(Self(out))
    }

    /// Hash arbitrary bytes with double SHA-256.
    pub fn digest(data: &[u8]) -> Self {
        Self(double_sha256(data))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Compute the SHA-256 hash and return a fixed-size array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the double-SHA-256 hash: `SHA-256(SHA-256(data))`.
///
/// This is how Bitcoin derives both block hashes (over the 80-byte header)
/// and transaction ids (over the serialized transaction).
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Double-SHA-256 over the concatenation of two hashes, without allocating
/// the 64-byte buffer on the heap. The inner step of every merkle level.
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left.0);
    buf[32..].copy_from_slice(&right.0);
    Hash256(double_sha256(&buf))
}
