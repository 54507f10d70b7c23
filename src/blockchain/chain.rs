//! The persistent chain store: a hash-addressed block database with a
//! `lh` pointer naming the current best tip.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use crate::blockchain::block::Block;
use crate::blockchain::transaction::{Transaction, TxOutputs};
use crate::config::{NodeConfig, GENESIS_DATA};
use crate::database::{Batch, Store};
use crate::error::{Error, Result};

/// Key holding the hash of the current best tip.
const LAST_HASH_KEY: &[u8] = b"lh";

pub struct Blockchain {
    store: Store,
    path: PathBuf,
}

impl Blockchain {
    /// Create a fresh chain with a genesis block paying the coinbase
    /// reward to `address`. Refuses to overwrite an existing chain.
    pub fn create(address: &str, config: &NodeConfig) -> Result<Self> {
        let path = config.db_path();
        if Store::exists(&path) {
            return Err(Error::ChainExists(path));
        }
        let store = Store::open(&path)?;

        let coinbase = Transaction::coinbase(address, GENESIS_DATA)?;
        let genesis = Block::genesis(coinbase)?;
        log::info!("genesis block sealed: {}", hex::encode(&genesis.hash));

        let mut batch = Batch::default();
        batch.insert(genesis.hash.as_slice(), genesis.serialize()?);
        batch.insert(LAST_HASH_KEY, genesis.hash.as_slice());
        store.apply_batch(batch)?;

        Ok(Self { store, path })
    }

    /// Open an existing chain; refuses when none was created yet.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let path = config.db_path();
        if !Store::exists(&path) {
            return Err(Error::ChainMissing(path));
        }
        let store = Store::open(&path)?;
        Ok(Self { store, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub fn get_last_hash(&self) -> Result<Vec<u8>> {
        let tip = self
            .store
            .get(LAST_HASH_KEY)?
            .ok_or_else(|| Error::ChainMissing(self.path.clone()))?;
        Ok(tip.to_vec())
    }

    pub fn get_best_height(&self) -> Result<u64> {
        let tip = self.get_last_hash()?;
        Ok(self.get_block(&tip)?.height)
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Block> {
        let raw = self
            .store
            .get(hash)?
            .ok_or_else(|| Error::BlockNotFound(hex::encode(hash)))?;
        Block::deserialize(&raw)
    }

    /// Every block hash from the tip down to genesis.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let mut hashes = Vec::new();
        for block in self.iterator()? {
            hashes.push(block?.hash);
        }
        Ok(hashes)
    }

    /// Verify `txs`, seal them into a new block on top of the current
    /// tip and advance `lh`.
    pub fn mine_block(&self, txs: Vec<Transaction>, cancel: &AtomicBool) -> Result<Block> {
        for tx in &txs {
            if !self.verify_transaction(tx)? {
                return Err(Error::InvalidTransaction(hex::encode(&tx.id)));
            }
        }

        let last_hash = self.get_last_hash()?;
        let height = self.get_block(&last_hash)?.height + 1;
        let block = Block::new(txs, last_hash, height, cancel)?;

        let mut batch = Batch::default();
        batch.insert(block.hash.as_slice(), block.serialize()?);
        batch.insert(LAST_HASH_KEY, block.hash.as_slice());
        self.store.apply_batch(batch)?;

        log::info!(
            "mined block {} at height {}",
            hex::encode(&block.hash),
            block.height
        );
        Ok(block)
    }

    /// Store a block received from a peer, adopting it as the tip only
    /// when it is strictly higher than the current one.
    pub fn add_block(&self, block: &Block) -> Result<()> {
        if self.store.contains(&block.hash)? {
            return Ok(());
        }

        let best_height = self.get_best_height()?;
        let mut batch = Batch::default();
        batch.insert(block.hash.as_slice(), block.serialize()?);
        if block.height > best_height {
            batch.insert(LAST_HASH_KEY, block.hash.as_slice());
        }
        self.store.apply_batch(batch)?;

        log::debug!(
            "stored block {} at height {} (best {})",
            hex::encode(&block.hash),
            block.height,
            best_height
        );
        Ok(())
    }

    /// Walk back from the tip looking for a transaction by id.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction> {
        for block in self.iterator()? {
            for tx in block?.transactions {
                if tx.id == id {
                    return Ok(tx);
                }
            }
        }
        Err(Error::MissingPrevTx(hex::encode(id)))
    }

    /// Map of hex tx id to that transaction's still-unspent outputs,
    /// computed by a full walk from the tip to genesis.
    pub fn find_utxo(&self) -> Result<HashMap<String, TxOutputs>> {
        let mut utxo: HashMap<String, TxOutputs> = HashMap::new();
        let mut spent: HashMap<String, Vec<i64>> = HashMap::new();

        for block in self.iterator()? {
            for tx in &block?.transactions {
                let txid = hex::encode(&tx.id);

                for (idx, out) in tx.outputs.iter().enumerate() {
                    let idx = idx as i64;
                    let consumed = spent
                        .get(&txid)
                        .map_or(false, |outs| outs.contains(&idx));
                    if !consumed {
                        utxo.entry(txid.clone())
                            .or_default()
                            .outputs
                            .push((idx as u64, out.clone()));
                    }
                }

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent
                            .entry(hex::encode(&input.id))
                            .or_default()
                            .push(input.out);
                    }
                }
            }
        }
        Ok(utxo)
    }

    /// Sign `tx` against the chain: each input's funding transaction is
    /// looked up by id.
    pub fn sign_transaction(&self, tx: &mut Transaction, secret: &[u8]) -> Result<()> {
        let prevs = self.previous_transactions(tx)?;
        tx.sign(secret, &prevs)
    }

    /// Verify `tx` against the chain. Coinbases are trivially valid.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prevs = self.previous_transactions(tx)?;
        tx.verify(&prevs)
    }

    fn previous_transactions(&self, tx: &Transaction) -> Result<HashMap<String, Transaction>> {
        let mut prevs = HashMap::new();
        for input in &tx.inputs {
            let prev = self.find_transaction(&input.id)?;
            prevs.insert(hex::encode(&prev.id), prev);
        }
        Ok(prevs)
    }

    /// Cursor over blocks from the tip back to genesis.
    pub fn iterator(&self) -> Result<ChainIterator<'_>> {
        Ok(ChainIterator {
            store: &self.store,
            current: self.get_last_hash()?,
        })
    }
}

pub struct ChainIterator<'a> {
    store: &'a Store,
    current: Vec<u8>,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_empty() {
            return None;
        }
        let raw = match self.store.get(&self.current) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Some(Err(Error::BlockNotFound(hex::encode(&self.current)))),
            Err(err) => return Some(Err(err)),
        };
        match Block::deserialize(&raw) {
            Ok(block) => {
                self.current = block.prev_hash.clone();
                Some(Ok(block))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
