//! Blocks: a timestamped batch of transactions sealed by proof-of-work
//! and chained by the previous block's hash.

use std::sync::atomic::AtomicBool;

use bincode::Options;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::blockchain::pow::ProofOfWork;
use crate::blockchain::transaction::Transaction;
use crate::config;
use crate::crypto::merkle::MerkleTree;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Unix seconds at sealing time.
    pub timestamp: i64,
    /// SHA-256 of the proof-of-work input at the sealed nonce.
    #[serde(with = "serde_bytes")]
    pub hash: Vec<u8>,
    /// Non-empty; the first is a coinbase when mined by a miner.
    pub transactions: Vec<Transaction>,
    /// Empty for the genesis block.
    #[serde(with = "serde_bytes")]
    pub prev_hash: Vec<u8>,
    pub height: u64,
    pub nonce: u64,
}

impl Block {
    /// Assemble and seal a block; runs the proof-of-work search.
    pub fn new(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        height: u64,
        cancel: &AtomicBool,
    ) -> Result<Self> {
        let mut block = Self {
            timestamp: Utc::now().timestamp(),
            hash: Vec::new(),
            transactions,
            prev_hash,
            height,
            nonce: 0,
        };
        let pow = ProofOfWork::new(&block)?;
        let (nonce, hash) = pow.run(cancel)?;
        block.nonce = nonce;
        block.hash = hash.to_vec();
        Ok(block)
    }

    /// The chain's first block: height zero, empty previous hash.
    pub fn genesis(coinbase: Transaction) -> Result<Self> {
        Self::new(vec![coinbase], Vec::new(), 0, &AtomicBool::new(false))
    }

    /// Merkle root over each transaction's canonical serialization.
    /// This is what the proof-of-work commits to.
    pub fn hash_transactions(&self) -> Result<[u8; 32]> {
        let leaves = self
            .transactions
            .iter()
            .map(|tx| tx.serialize())
            .collect::<Result<Vec<_>>>()?;
        Ok(MerkleTree::new(&leaves)?.root())
    }

    /// Recheck this block's proof-of-work.
    pub fn validate_pow(&self) -> Result<bool> {
        Ok(ProofOfWork::new(self)?.validate(self.nonce))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(config::bincode_options().serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(config::bincode_options().deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn coinbase() -> Transaction {
        let wallet = Wallet::new();
        Transaction::coinbase(&wallet.address(), "block test").unwrap()
    }

    #[test]
    fn genesis_has_height_zero_and_no_parent() {
        let block = Block::genesis(coinbase()).unwrap();
        assert_eq!(block.height, 0);
        assert!(block.prev_hash.is_empty());
        assert_eq!(block.hash.len(), 32);
        assert!(block.validate_pow().unwrap());
    }

    #[test]
    fn sealed_block_survives_a_round_trip() {
        let block = Block::genesis(coinbase()).unwrap();
        let bytes = block.serialize().unwrap();
        let restored = Block::deserialize(&bytes).unwrap();
        assert_eq!(restored, block);
        assert!(restored.validate_pow().unwrap());
    }

    #[test]
    fn corrupting_the_nonce_breaks_the_proof() {
        let block = Block::genesis(coinbase()).unwrap();
        let mut corrupted = block.clone();
        // Walk bit flips until one misses the target (the first almost
        // always does at this difficulty).
        for bit in 0..63 {
            corrupted.nonce = block.nonce ^ (1 << bit);
            if !corrupted.validate_pow().unwrap() {
                return;
            }
        }
        panic!("every nonce perturbation still satisfied the target");
    }

    #[test]
    fn merkle_root_changes_with_contents() {
        let block = Block::genesis(coinbase()).unwrap();
        let mut altered = block.clone();
        altered.transactions[0].outputs[0].value += 1;
        assert_ne!(
            block.hash_transactions().unwrap(),
            altered.hash_transactions().unwrap()
        );
    }
}
