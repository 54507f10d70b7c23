//! Merkle tree over transaction payloads.
//!
//! - Leaves are hashed with SHA-256 before the rollup.
//! - Parents are `SHA256(left || right)`.
//! - A level with an odd number of nodes duplicates its last node.

use core::fmt;

use crate::crypto::hash::sha256;

#[derive(Debug)]
pub enum MerkleError {
    Empty,
}

impl fmt::Display for MerkleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MerkleError::Empty => write!(f, "merkle tree requires at least one leaf"),
        }
    }
}

impl std::error::Error for MerkleError {}

impl From<MerkleError> for crate::error::Error {
    fn from(err: MerkleError) -> Self {
        crate::error::Error::Decode(err.to_string())
    }
}

pub struct MerkleTree {
    root: [u8; 32],
}

impl MerkleTree {
    /// Build a tree from raw leaf payloads.
    pub fn new(leaves: &[Vec<u8>]) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::Empty);
        }

        let mut level: Vec<[u8; 32]> = leaves.iter().map(|l| sha256(l)).collect();

        // An odd leaf count duplicates the last leaf; a single leaf
        // therefore still pairs with itself.
        if level.len() % 2 == 1 {
            let last = *level.last().expect("non-empty");
            level.push(last);
        }

        // Reduce until one node remains.
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = *level.last().expect("non-empty");
                level.push(last);
            }

            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks_exact(2) {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                next.push(sha256(&buf));
            }
            level = next;
        }

        Ok(Self { root: level[0] })
    }

    #[inline]
    pub fn root(&self) -> [u8; 32] {
        self.root
    }
}
