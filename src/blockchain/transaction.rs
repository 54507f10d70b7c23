//! Transactions: inputs referencing prior outputs, outputs locked by a
//! public-key hash, and the trimmed-copy signing protocol.

use std::collections::HashMap;
use std::fmt;

use bincode::Options;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::blockchain::utxo::UtxoSet;
use crate::config::{self, REWARD};
use crate::crypto::{self, hash};
use crate::error::{Error, Result};
use crate::wallet::Wallet;

/// Reference to an output of a previous transaction, plus the material
/// proving the spender owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the funding transaction; empty for coinbase.
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    /// Index into the funding transaction's outputs; -1 for coinbase.
    pub out: i64,
    /// 64-byte `r || s` signature, empty until signed.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Raw 64-byte `X || Y` public key of the spender. The coinbase
    /// input reuses this field to carry arbitrary genesis data.
    #[serde(with = "serde_bytes")]
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Whether this input was produced by the owner of `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash::hash_pub_key(&self.pub_key).as_slice() == pub_key_hash
    }
}

/// A coin fragment: a value locked by the hash of its owner's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    #[serde(with = "serde_bytes")]
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Create an output locked to the owner of `address`.
    pub fn new(value: u64, address: &str) -> Result<Self> {
        let pub_key_hash = crypto::decode_address(address)?;
        Ok(Self { value, pub_key_hash })
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// The still-unspent outputs of one transaction as stored in the UTXO
/// index. Original output indices are kept alongside each output so a
/// partial spend never renumbers the survivors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputs {
    pub outputs: Vec<(u64, TxOutput)>,
}

impl TxOutputs {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(config::bincode_options().serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(config::bincode_options().deserialize(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the canonical encoding with this field zeroed.
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// The first transaction of every mined block: no real input, one
    /// output paying the reward to the miner. Empty data is replaced by
    /// random bytes so repeated rewards to one address get distinct ids.
    pub fn coinbase(to: &str, data: &str) -> Result<Self> {
        let data = if data.is_empty() {
            let mut random = vec![0u8; 20];
            rand::thread_rng().fill_bytes(&mut random);
            random
        } else {
            data.as_bytes().to_vec()
        };
        let input = TxInput {
            id: Vec::new(),
            out: -1,
            signature: Vec::new(),
            pub_key: data,
        };
        let output = TxOutput::new(REWARD, to)?;
        let mut tx = Self {
            id: Vec::new(),
            inputs: vec![input],
            outputs: vec![output],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Build and sign a transfer of `amount` from `wallet` to `to`,
    /// funded by spendable outputs found in the UTXO index.
    pub fn new(wallet: &Wallet, to: &str, amount: u64, utxo: &UtxoSet) -> Result<Self> {
        let sender_hash = hash::hash_pub_key(wallet.public_key());
        let (accumulated, spendable) = utxo.find_spendable_outputs(&sender_hash, amount)?;
        if accumulated < amount {
            return Err(Error::InsufficientFunds {
                available: accumulated,
                required: amount,
            });
        }

        let mut inputs = Vec::new();
        for (txid_hex, out_indices) in &spendable {
            let id = hex::decode(txid_hex).map_err(|e| Error::Decode(e.to_string()))?;
            for &out in out_indices {
                inputs.push(TxInput {
                    id: id.clone(),
                    out,
                    signature: Vec::new(),
                    pub_key: wallet.public_key().to_vec(),
                });
            }
        }

        let mut outputs = vec![TxOutput::new(amount, to)?];
        if accumulated > amount {
            // Change back to the sender.
            outputs.push(TxOutput {
                value: accumulated - amount,
                pub_key_hash: sender_hash.to_vec(),
            });
        }

        let mut tx = Self {
            id: Vec::new(),
            inputs,
            outputs,
        };
        tx.id = tx.hash()?;
        utxo.chain().sign_transaction(&mut tx, wallet.secret_key())?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].id.is_empty() && self.inputs[0].out == -1
    }

    /// SHA-256 of the canonical encoding with the id zeroed.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let mut copy = self.clone();
        copy.id = Vec::new();
        Ok(hash::sha256(&copy.serialize()?).to_vec())
    }

    /// Copy with every input's signature and pubkey cleared; the
    /// per-input signing digest is derived from it.
    fn trimmed_copy(&self) -> Self {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                id: input.id.clone(),
                out: input.out,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();
        Self {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Sign every input against the previous transactions it spends.
    pub(crate) fn sign(
        &mut self,
        secret: &[u8],
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut trimmed = self.trimmed_copy();
        for i in 0..self.inputs.len() {
            let prev_out = referenced_output(&self.inputs[i], prev_txs)?;
            trimmed.inputs[i].signature.clear();
            trimmed.inputs[i].pub_key = prev_out.pub_key_hash.clone();
            let sighash = trimmed.hash()?;
            trimmed.inputs[i].pub_key.clear();
            self.inputs[i].signature = crypto::sign_digest(secret, &sighash)?;
        }
        Ok(())
    }

    /// Check every input's signature. Malformed signatures or keys make
    /// the transaction invalid rather than erroring; a missing previous
    /// transaction is an error in its own right.
    pub(crate) fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut trimmed = self.trimmed_copy();
        for i in 0..self.inputs.len() {
            let prev_out = referenced_output(&self.inputs[i], prev_txs)?;
            trimmed.inputs[i].signature.clear();
            trimmed.inputs[i].pub_key = prev_out.pub_key_hash.clone();
            let sighash = trimmed.hash()?;
            trimmed.inputs[i].pub_key.clear();

            let input = &self.inputs[i];
            if !crypto::verify_digest(&input.pub_key, &sighash, &input.signature) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(config::bincode_options().serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(config::bincode_options().deserialize(data)?)
    }
}

/// Resolve the output an input spends, or fail with the id of the
/// missing funding transaction.
fn referenced_output<'a>(
    input: &TxInput,
    prev_txs: &'a HashMap<String, Transaction>,
) -> Result<&'a TxOutput> {
    let txid = hex::encode(&input.id);
    let prev = prev_txs
        .get(&txid)
        .ok_or_else(|| Error::MissingPrevTx(txid.clone()))?;
    let idx = usize::try_from(input.out)
        .map_err(|_| Error::InvalidTransaction(format!("bad output index in input of {txid}")))?;
    prev.outputs
        .get(idx)
        .ok_or_else(|| Error::InvalidTransaction(format!("output {idx} of {txid} out of range")))
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {i}:")?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.id))?;
            writeln!(f, "       Out:       {}", input.out)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {i}:")?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", hex::encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_pub_key;
    use crate::wallet::Wallet;

    fn prev_map(txs: &[Transaction]) -> HashMap<String, Transaction> {
        txs.iter()
            .map(|tx| (hex::encode(&tx.id), tx.clone()))
            .collect()
    }

    /// An unsigned transfer spending `prev`'s first output.
    fn transfer(prev: &Transaction, from: &Wallet, to: &Wallet, amount: u64) -> Transaction {
        let change = prev.outputs[0].value - amount;
        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                id: prev.id.clone(),
                out: 0,
                signature: Vec::new(),
                pub_key: from.public_key().to_vec(),
            }],
            outputs: vec![
                TxOutput {
                    value: amount,
                    pub_key_hash: hash_pub_key(to.public_key()).to_vec(),
                },
                TxOutput {
                    value: change,
                    pub_key_hash: hash_pub_key(from.public_key()).to_vec(),
                },
            ],
        };
        tx.id = tx.hash().unwrap();
        tx
    }

    #[test]
    fn coinbase_identity() {
        let wallet = Wallet::new();
        let tx = Transaction::coinbase(&wallet.address(), "").unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.inputs.len(), 1);
        assert!(tx.inputs[0].id.is_empty());
        assert_eq!(tx.inputs[0].out, -1);
        assert!(tx.inputs[0].signature.is_empty());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, REWARD);

        // Any real input breaks the identity.
        let mut not_cb = tx.clone();
        not_cb.inputs[0].id = vec![1; 32];
        assert!(!not_cb.is_coinbase());
        let mut not_cb = tx;
        not_cb.inputs[0].out = 0;
        assert!(!not_cb.is_coinbase());
    }

    #[test]
    fn id_commits_to_contents() {
        let wallet = Wallet::new();
        let tx = Transaction::coinbase(&wallet.address(), "genesis data").unwrap();
        assert_eq!(tx.id.len(), 32);
        assert_eq!(tx.id, tx.hash().unwrap());

        let mut altered = tx.clone();
        altered.outputs[0].value += 1;
        assert_ne!(altered.hash().unwrap(), tx.id);
    }

    #[test]
    fn sign_verify_round_trip() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let funding = Transaction::coinbase(&alice.address(), "").unwrap();
        let prevs = prev_map(&[funding.clone()]);

        let mut tx = transfer(&funding, &alice, &bob, 5);
        tx.sign(alice.secret_key(), &prevs).unwrap();
        assert!(tx.verify(&prevs).unwrap());
    }

    #[test]
    fn verification_rejects_tampering() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let funding = Transaction::coinbase(&alice.address(), "").unwrap();
        let prevs = prev_map(&[funding.clone()]);

        let mut tx = transfer(&funding, &alice, &bob, 5);
        tx.sign(alice.secret_key(), &prevs).unwrap();

        let mut bad = tx.clone();
        bad.inputs[0].signature[10] ^= 0x01;
        assert!(!bad.verify(&prevs).unwrap());

        let mut bad = tx.clone();
        bad.inputs[0].pub_key[0] ^= 0x01;
        assert!(!bad.verify(&prevs).unwrap());

        let mut bad = tx.clone();
        bad.outputs[0].value = 19;
        assert!(!bad.verify(&prevs).unwrap());
    }

    #[test]
    fn signing_with_wrong_key_fails_verification() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let mallory = Wallet::new();
        let funding = Transaction::coinbase(&alice.address(), "").unwrap();
        let prevs = prev_map(&[funding.clone()]);

        let mut tx = transfer(&funding, &alice, &bob, 5);
        tx.sign(mallory.secret_key(), &prevs).unwrap();
        assert!(!tx.verify(&prevs).unwrap());
    }

    #[test]
    fn missing_previous_transaction_is_an_error() {
        let alice = Wallet::new();
        let bob = Wallet::new();
        let funding = Transaction::coinbase(&alice.address(), "").unwrap();

        let mut tx = transfer(&funding, &alice, &bob, 5);
        let empty = HashMap::new();
        assert!(matches!(
            tx.sign(alice.secret_key(), &empty),
            Err(Error::MissingPrevTx(_))
        ));
        assert!(matches!(tx.verify(&empty), Err(Error::MissingPrevTx(_))));
    }

    #[test]
    fn outputs_bundle_round_trips_with_indices() {
        let outs = TxOutputs {
            outputs: vec![
                (0, TxOutput { value: 3, pub_key_hash: vec![1; 20] }),
                (2, TxOutput { value: 7, pub_key_hash: vec![2; 20] }),
            ],
        };
        let bytes = outs.serialize().unwrap();
        assert_eq!(TxOutputs::deserialize(&bytes).unwrap(), outs);
    }
}
