//! Hashing, address encoding, ECDSA keys and the Merkle tree.

pub mod base58;
pub mod hash;
pub mod keys;
pub mod merkle;

pub use base58::{decode_address, encode_address, validate_address};
pub use hash::{checksum, hash_pub_key, sha256};
pub use keys::{new_key_pair, sign_digest, verify_digest};
pub use merkle::MerkleTree;
