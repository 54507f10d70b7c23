//! Base58Check address encoding.
//!
//! `address = base58(version || pubkey_hash || checksum)` where the
//! checksum is the first four bytes of the double SHA-256 over
//! `version || pubkey_hash`.

use crate::crypto::hash;
use crate::error::{Error, Result};

/// Address version byte.
pub const VERSION: u8 = 0x00;

/// Trailing checksum length in bytes.
pub const CHECKSUM_LEN: usize = 4;

const PUB_KEY_HASH_LEN: usize = 20;

/// Encode a 20-byte public-key hash into an address string.
pub fn encode_address(pub_key_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + CHECKSUM_LEN);
    payload.push(VERSION);
    payload.extend_from_slice(pub_key_hash);
    let check = hash::checksum(&payload);
    payload.extend_from_slice(&check);
    bs58::encode(payload).into_string()
}

/// Decode an address back into its public-key hash, verifying the
/// version byte and checksum.
pub fn decode_address(address: &str) -> Result<Vec<u8>> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|_| Error::InvalidAddress)?;
    if payload.len() != 1 + PUB_KEY_HASH_LEN + CHECKSUM_LEN {
        return Err(Error::InvalidAddress);
    }
    let (body, claimed) = payload.split_at(payload.len() - CHECKSUM_LEN);
    if hash::checksum(body) != claimed || body[0] != VERSION {
        return Err(Error::InvalidAddress);
    }
    Ok(body[1..].to_vec())
}

/// True when the address decodes and its checksum matches.
pub fn validate_address(address: &str) -> bool {
    decode_address(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hash = [0xabu8; 20];
        let addr = encode_address(&hash);
        assert_eq!(decode_address(&addr).unwrap(), hash.to_vec());
        assert!(validate_address(&addr));
    }

    #[test]
    fn rejects_corrupted_addresses() {
        let addr = encode_address(&[0x11u8; 20]);
        // Flip every character in turn; each mutation must be rejected
        // (a flipped char either breaks base58 or the checksum).
        for i in 0..addr.len() {
            let mut bytes = addr.clone().into_bytes();
            bytes[i] = if bytes[i] == b'2' { b'3' } else { b'2' };
            let mutated = String::from_utf8(bytes).unwrap();
            if mutated != addr {
                assert!(!validate_address(&mutated), "mutation at {i} accepted");
            }
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(!validate_address(""));
        assert!(!validate_address("not-base58-0OIl"));
        assert!(!validate_address("abc"));
    }
}
