//! Wallets: ECDSA keypairs addressed by Base58Check, persisted in a
//! per-node wallet file.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config::{self, NodeConfig};
use crate::crypto::{self, hash};
use crate::error::Result;

/// A single keypair. Key material is held as raw bytes so the file
/// format stays independent of the crypto backend's types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    #[serde(with = "serde_bytes")]
    secret_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Self {
        let (secret_key, public_key) = crypto::new_key_pair();
        Self {
            secret_key,
            public_key,
        }
    }

    /// Base58Check address: version byte plus the hashed public key.
    pub fn address(&self) -> String {
        let pub_key_hash = hash::hash_pub_key(&self.public_key);
        crypto::encode_address(&pub_key_hash)
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// The on-disk collection of wallets, keyed by address.
pub struct WalletStore {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
}

impl WalletStore {
    /// Load the wallet file for this node. A missing file is an empty
    /// store, not an error.
    pub fn load(config: &NodeConfig) -> Result<Self> {
        Self::load_from(config.wallet_path())
    }

    fn load_from(path: PathBuf) -> Result<Self> {
        let wallets: HashMap<String, Wallet> = match fs::read(&path) {
            Ok(bytes) => config::bincode_options().deserialize(&bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { wallets, path })
    }

    /// Generate a wallet, register it and return its address.
    pub fn create_wallet(&mut self) -> String {
        let wallet = Wallet::new();
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        address
    }

    pub fn get(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    /// Persist the store. Written to a sibling temp file first and
    /// renamed into place so a crash never truncates the wallet file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = config::bincode_options().serialize(&self.wallets)?;
        let tmp = self.path.with_extension("data.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
