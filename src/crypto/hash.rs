//! Digest helpers shared by addresses, transactions and proof-of-work.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// First four bytes of the double SHA-256, used as the address checksum.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// RIPEMD-160 over SHA-256 of a raw public key, the 20-byte hash that
/// locks outputs.
pub fn hash_pub_key(pub_key: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(pub_key);
    Ripemd160::digest(sha).into()
}
