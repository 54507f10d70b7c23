//! Proof-of-work: find a nonce such that the block hash, read as a
//! 256-bit integer, falls below `1 << (256 - DIFFICULTY)`.

use std::sync::atomic::{AtomicBool, Ordering};

use num_bigint::BigUint;
use num_traits::One;

use crate::blockchain::block::Block;
use crate::config::DIFFICULTY;
use crate::crypto::hash::sha256;
use crate::error::{Error, Result};

/// Nonces are confined to the non-negative range of a signed 64-bit int.
const MAX_NONCE: u64 = i64::MAX as u64;

pub struct ProofOfWork {
    target: BigUint,
    prev_hash: Vec<u8>,
    merkle_root: [u8; 32],
    difficulty: u32,
}

impl ProofOfWork {
    pub fn new(block: &Block) -> Result<Self> {
        Self::with_difficulty(block, DIFFICULTY)
    }

    /// Same engine at an explicit difficulty; tests run the search loop
    /// at lower settings.
    pub(crate) fn with_difficulty(block: &Block, difficulty: u32) -> Result<Self> {
        let target = BigUint::one() << (256 - difficulty as usize);
        Ok(Self {
            target,
            prev_hash: block.prev_hash.clone(),
            merkle_root: block.hash_transactions()?,
            difficulty,
        })
    }

    /// `prev_hash || merkle_root || be64(nonce) || be64(difficulty)`.
    fn input(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.prev_hash.len() + 32 + 16);
        data.extend_from_slice(&self.prev_hash);
        data.extend_from_slice(&self.merkle_root);
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&u64::from(self.difficulty).to_be_bytes());
        data
    }

    /// Search the nonce space from zero. The `cancel` flag is polled
    /// every iteration so a shutdown can interrupt a running miner.
    pub fn run(&self, cancel: &AtomicBool) -> Result<(u64, [u8; 32])> {
        for nonce in 0..MAX_NONCE {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::MiningInterrupted);
            }
            let hash = sha256(&self.input(nonce));
            if BigUint::from_bytes_be(&hash) < self.target {
                return Ok((nonce, hash));
            }
        }
        Err(Error::MiningExhausted)
    }

    /// Recompute the hash at a claimed nonce and compare to the target.
    pub fn validate(&self, nonce: u64) -> bool {
        let hash = sha256(&self.input(nonce));
        BigUint::from_bytes_be(&hash) < self.target
    }
}
