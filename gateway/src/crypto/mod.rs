//! # Cryptographic Primitives
//!
//! Double-SHA-256 identifiers, merkle branches, and the Ed25519 key that
//! signs callback envelopes.

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, sha256, Hash256, HashParseError};
pub use keys::{CallbackSigner, KeyError};
pub use merkle::{merkle_branch, merkle_root, MerkleBranch, MerkleNode};
