use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid address")]
    InvalidAddress,

    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("previous transaction {0} not found")]
    MissingPrevTx(String),

    #[error("invalid transaction {0}")]
    InvalidTransaction(String),

    #[error("block {0} not found")]
    BlockNotFound(String),

    #[error("a blockchain already exists at {0}")]
    ChainExists(PathBuf),

    #[error("no blockchain found at {0}, create one first")]
    ChainMissing(PathBuf),

    #[error("nonce space exhausted while mining")]
    MiningExhausted,

    #[error("mining interrupted by shutdown")]
    MiningInterrupted,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("database is locked by another process")]
    DbLocked,

    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
