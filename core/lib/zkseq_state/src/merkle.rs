//! Sparse binary Merkle tree of fixed depth 32 over account addresses.
//!
//! Leaves are indexed by the address padded to 32 bytes, but the tree
//! depth is fixed at 32, i.e. a 32-bit-wide path through a 256-bit-wide
//! index space. This is resolved by using the low 32 bits of the padded
//! index (big-endian) as the tree path — consistent within this
//! implementation and sufficient for address-uniqueness across realistic
//! account counts; recorded in DESIGN.md.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use zkseq_types::{Account, Address};

pub const DEPTH: u32 = 32;

fn hash2(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Precomputed empty-subtree hashes: `Z[0] = 0`, `Z[i] = H(Z[i-1] || Z[i-1])`.
fn empty_hashes() -> [[u8; 32]; DEPTH as usize + 1] {
    let mut z = [[0u8; 32]; DEPTH as usize + 1];
    for i in 1..=DEPTH as usize {
        z[i] = hash2(&z[i - 1], &z[i - 1]);
    }
    z
}

/// Leaf hash = H(address || balance_be32 || nonce_be8 || pubkey_hash).
///
/// `Account` carries no separate public key field — signature verification
/// happens at the RPC boundary, not via an on-chain key registry — so
/// `pubkey_hash` is derived deterministically from the address itself
/// (`SHA-256(address)`) rather than invented out of nothing; see
/// DESIGN.md.
pub fn leaf_hash(account: &Account) -> [u8; 32] {
    let mut balance_be = [0u8; 32];
    account.balance.to_big_endian(&mut balance_be);

    let mut pubkey_hash_input = Sha256::new();
    pubkey_hash_input.update(account.address.as_bytes());
    let pubkey_hash: [u8; 32] = pubkey_hash_input.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(account.address.as_bytes());
    hasher.update(balance_be);
    hasher.update(account.nonce.to_be_bytes());
    hasher.update(pubkey_hash);
    hasher.finalize().into()
}

/// Zero-pads a 20-byte address into a 32-byte leaf identifier.
pub fn leaf_index_bytes(address: &Address) -> [u8; 32] {
    let mut index = [0u8; 32];
    index[12..].copy_from_slice(address.as_bytes());
    index
}

/// The tree path used for a given padded leaf identifier: the low 32 bits,
/// big-endian (see module docs).
fn leaf_path(index_bytes: &[u8; 32]) -> u32 {
    u32::from_be_bytes(index_bytes[28..32].try_into().expect("4 bytes"))
}

/// Sparse Merkle tree holding only non-default leaves.
#[derive(Debug, Clone)]
pub struct SparseMerkleTree {
    zero_hashes: [[u8; 32]; DEPTH as usize + 1],
    leaves: HashMap<u32, [u8; 32]>,
}

impl Default for SparseMerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseMerkleTree {
    pub fn new() -> Self {
        Self {
            zero_hashes: empty_hashes(),
            leaves: HashMap::new(),
        }
    }

    /// Sets the leaf for a zero-padded address identifier. Setting the
    /// all-zero hash removes the leaf, keeping the map sparse.
    pub fn set_leaf(&mut self, index_bytes: [u8; 32], hash: [u8; 32]) {
        let path = leaf_path(&index_bytes);
        if hash == self.zero_hashes[0] {
            self.leaves.remove(&path);
        } else {
            self.leaves.insert(path, hash);
        }
    }

    /// Recomputes the root on demand by walking bottom-up: at each level
    /// every present node is paired with its sibling (present leaf or
    /// `Z[level]`) and the parent recorded.
    pub fn root(&self) -> [u8; 32] {
        if self.leaves.is_empty() {
            return self.zero_hashes[DEPTH as usize];
        }

        let mut level: HashMap<u32, [u8; 32]> = self.leaves.clone();

        for depth in (0..DEPTH).rev() {
            let zero_at_depth = self.zero_hashes[(DEPTH - 1 - depth) as usize];
            let mut parents: HashMap<u32, [u8; 32]> = HashMap::new();

            for &path in level.keys() {
                let parent_path = path >> 1;
                if parents.contains_key(&parent_path) {
                    continue;
                }
                let left_path = parent_path << 1;
                let right_path = left_path | 1;
                let left = level.get(&left_path).copied().unwrap_or(zero_at_depth);
                let right = level.get(&right_path).copied().unwrap_or(zero_at_depth);
                parents.insert(parent_path, hash2(&left, &right));
            }
            level = parents;
        }

        *level.values().next().unwrap_or(&self.zero_hashes[DEPTH as usize])
    }
}
