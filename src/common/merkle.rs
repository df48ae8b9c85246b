//! Simple binary merkle tree over byte items.
//!
//! Leaves are hashed as `sha256(0x00 || item)` and inner nodes as
//! `sha256(0x01 || left || right)`. The tree splits at the largest power of
//! two strictly smaller than the item count, so proofs stay stable when items
//! are appended.

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};

use super::crypto::Hash;

const LEAF_PREFIX: u8 = 0;
const INNER_PREFIX: u8 = 1;

pub fn leaf_hash(item: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(item);
    hasher.finalize().into()
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Root over the leaf hashes. The empty tree hashes to all zeroes.
pub fn root_from_leaf_hashes(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => [0u8; 32],
        1 => leaves[0],
        n => {
            let k = split_point(n);
            let left = root_from_leaf_hashes(&leaves[..k]);
            let right = root_from_leaf_hashes(&leaves[k..]);
            inner_hash(&left, &right)
        }
    }
}

pub fn root<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    let leaves: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
    root_from_leaf_hashes(&leaves)
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Proof {
    pub index: usize,
    pub total: usize,
    pub leaf_hash: Hash,
    /// Sibling hashes from the leaf up to the root.
    pub aunts: Vec<Hash>,
}

/// Returns the root and one proof per item.
pub fn proofs<T: AsRef<[u8]>>(items: &[T]) -> (Hash, Vec<Proof>) {
    let leaves: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
    let root = root_from_leaf_hashes(&leaves);
    let proofs = (0..leaves.len())
        .map(|index| Proof {
            index,
            total: leaves.len(),
            leaf_hash: leaves[index],
            aunts: aunts_for(&leaves, index),
        })
        .collect();
    (root, proofs)
}

fn aunts_for(leaves: &[Hash], index: usize) -> Vec<Hash> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut aunts = aunts_for(&leaves[..k], index);
        aunts.push(root_from_leaf_hashes(&leaves[k..]));
        aunts
    } else {
        let mut aunts = aunts_for(&leaves[k..], index - k);
        aunts.push(root_from_leaf_hashes(&leaves[..k]));
        aunts
    }
}

fn compute_from_aunts(index: usize, total: usize, leaf: Hash, aunts: &[Hash]) -> Option<Hash> {
    if index >= total || total == 0 {
        return None;
    }
    if total == 1 {
        return if aunts.is_empty() { Some(leaf) } else { None };
    }
    let (last, rest) = aunts.split_last()?;
    let k = split_point(total);
    if index < k {
        let left = compute_from_aunts(index, k, leaf, rest)?;
        Some(inner_hash(&left, last))
    } else {
        let right = compute_from_aunts(index - k, total - k, leaf, rest)?;
        Some(inner_hash(last, &right))
    }
}

impl Proof {
    /// Checks that `item` sits at `self.index` under `root`.
    pub fn verify(&self, root: &Hash, item: &[u8]) -> bool {
        if leaf_hash(item) != self.leaf_hash {
            return false;
        }
        compute_from_aunts(self.index, self.total, self.leaf_hash, &self.aunts)
            .map(|computed| &computed == root)
            .unwrap_or(false)
    }
}
