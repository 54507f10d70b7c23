//! Node configuration: per-node paths, protocol constants, and the
//! canonical codec options shared by every serialized structure.

use std::env;
use std::path::PathBuf;

use bincode::Options;

use crate::error::{Error, Result};

/// Leading zero bits required of a valid block hash.
pub const DIFFICULTY: u32 = 12;

/// Coinbase reward paid to the miner of each block.
pub const REWARD: u64 = 20;

/// Data carried by the genesis coinbase input.
pub const GENESIS_DATA: &str = "First transaction from genesis";

/// Wire protocol version exchanged during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Address every fresh node announces itself to.
pub const CENTRAL_NODE: &str = "localhost:3000";

/// Canonical encoding for blocks, transactions, UTXO bundles and wire
/// payloads: fixed-width big-endian integers, u64 length prefixes for
/// slices and lists, field order fixed by struct declaration.
pub fn bincode_options() -> impl Options + Copy {
    bincode::options()
        .with_big_endian()
        .with_fixint_encoding()
}

/// Per-node configuration derived from the `NODE_ID` environment variable.
///
/// The node id doubles as the listen port; the database and wallet file
/// paths are templated from it so several nodes can share one machine.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: PathBuf::from("./data"),
        }
    }

    /// Read `NODE_ID` from the environment; required for every subcommand.
    pub fn from_env() -> Result<Self> {
        match env::var("NODE_ID") {
            Ok(id) if !id.is_empty() => Ok(Self::new(id)),
            _ => Err(Error::Config("NODE_ID env is not set".into())),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("localhost:{}", self.node_id)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("blocks_{}", self.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(format!("wallet_{}.data", self.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_templated_by_node_id() {
        let cfg = NodeConfig::new("3000").with_data_dir("/tmp/x");
        assert_eq!(cfg.listen_addr(), "localhost:3000");
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/x/blocks_3000"));
        assert_eq!(cfg.wallet_path(), PathBuf::from("/tmp/x/wallet_3000.data"));
    }

    #[test]
    fn codec_is_big_endian_fixed_width() {
        let bytes = bincode_options().serialize(&1u64).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
