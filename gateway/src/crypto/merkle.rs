//! Bitcoin merkle trees: root computation and inclusion branches.
//!
//! Levels with an odd number of nodes pair the last node with itself. A
//! branch records that case as [`MerkleNode::Duplicate`] rather than repeating
//! the hash, matching the TSC merkle proof format that callback consumers
//! expect (`"*"` for a duplicated node).

use serde::{Deserialize, Serialize};

use super::hash::{hash_pair, Hash256};

/// One sibling on the path from a leaf to the root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MerkleNode {
    /// The sibling hash at this level.
    Hash(Hash256),
    /// The node is paired with itself (odd level width).
    Duplicate,
}

/// Inclusion proof for one transaction in a block.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MerkleBranch {
    /// Position of the transaction in the block.
    pub index: u64,
    /// Siblings from the leaf level upwards.
    pub nodes: Vec<MerkleNode>,
}

impl MerkleBranch {
    /// Fold the branch over `leaf` and return the implied merkle root.
    pub fn compute_root(&self, leaf: &Hash256) -> Hash256 {
        let mut current = *leaf;
        let mut index = self.index;
        for node in &self.nodes {
            let sibling = match node {
                MerkleNode::Hash(h) => *h,
                MerkleNode::Duplicate => current,
            };
            current = if index & 1 == 0 {
                hash_pair(&current, &sibling)
            } else {
                hash_pair(&sibling, &current)
            };
            index >>= 1;
        }
        current
    }

    /// Node list in TSC notation: display-order hex, `"*"` for duplicates.
    pub fn to_tsc_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| match n {
                MerkleNode::Hash(h) => h.to_hex(),
                MerkleNode::Duplicate => "*".to_string(),
            })
            .collect()
    }
}

/// Compute the merkle root of a block's transaction ids.
///
/// An empty list yields [`Hash256::ZERO`]; a single leaf is its own root.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Build the inclusion branch for the leaf at `index`.
///
/// Returns `None` when `index` is out of range.
pub fn merkle_branch(leaves: &[Hash256], index: usize) -> Option<MerkleBranch> {
    if index >= leaves.len() {
        return None;
    }
    let mut nodes = Vec::new();
    let mut level: Vec<Hash256> = leaves.to_vec();
    let mut pos = index;
    while level.len() > 1 {
        let sibling = pos ^ 1;
        if sibling < level.len() {
            nodes.push(MerkleNode::Hash(level[sibling]));
        } else {
            nodes.push(MerkleNode::Duplicate);
        }
        level = next_level(&level);
        pos >>= 1;
    }
    Some(MerkleBranch {
        index: index as u64,
        nodes,
    })
}

fn next_level(level: &[Hash256]) -> Vec<Hash256> {
    level
        .chunks(2)
        .map(|pair| {
            let right = pair.get(1).unwrap_or(&pair[0]);
            hash_pair(&pair[0], right)
        })
        .collect()
}
