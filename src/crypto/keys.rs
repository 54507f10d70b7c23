//! ECDSA P-256 key material.
//!
//! Public keys travel as the raw 64-byte `X || Y` point, signatures as
//! the fixed-width 64-byte `r || s` concatenation (32 bytes each, zero
//! padded), so both sides agree on component boundaries.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Raw `X || Y` public key width.
pub const PUBLIC_KEY_LEN: usize = 64;

/// Fixed `r || s` signature width.
pub const SIGNATURE_LEN: usize = 64;

/// Generate a fresh keypair, returned as `(secret, public)` raw bytes.
pub fn new_key_pair() -> (Vec<u8>, Vec<u8>) {
    let signing = SigningKey::random(&mut OsRng);
    let secret = signing.to_bytes().to_vec();
    let public = raw_public_key(signing.verifying_key());
    (secret, public)
}

/// Strip the SEC1 uncompressed-point tag, leaving `X || Y`.
pub fn raw_public_key(key: &VerifyingKey) -> Vec<u8> {
    let point = key.to_encoded_point(false);
    point.as_bytes()[1..].to_vec()
}

/// Sign a 32-byte digest, producing the 64-byte `r || s` signature.
pub fn sign_digest(secret: &[u8], digest: &[u8]) -> Result<Vec<u8>> {
    let key = SigningKey::from_slice(secret).map_err(|e| Error::Crypto(e.to_string()))?;
    let signature: Signature = key
        .sign_prehash(digest)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(signature.to_bytes().to_vec())
}

/// Verify an `r || s` signature over a digest against a raw public key.
/// Malformed keys or signatures verify as false rather than erroring.
pub fn verify_digest(public: &[u8], digest: &[u8], signature: &[u8]) -> bool {
    if public.len() != PUBLIC_KEY_LEN || signature.len() != SIGNATURE_LEN {
        return false;
    }
    let mut sec1 = Vec::with_capacity(PUBLIC_KEY_LEN + 1);
    sec1.push(0x04);
    sec1.extend_from_slice(public);
    let Ok(key) = VerifyingKey::from_sec1_bytes(&sec1) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_prehash(digest, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256;

    #[test]
    fn keys_have_fixed_widths() {
        let (secret, public) = new_key_pair();
        assert_eq!(secret.len(), 32);
        assert_eq!(public.len(), PUBLIC_KEY_LEN);
    }

    #[test]
    fn sign_verify_round_trip() {
        let (secret, public) = new_key_pair();
        let digest = sha256(b"spend 5 to someone");
        let sig = sign_digest(&secret, &digest).unwrap();
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(verify_digest(&public, &digest, &sig));
    }

    #[test]
    fn any_bit_flip_invalidates() {
        let (secret, public) = new_key_pair();
        let digest = sha256(b"payload");
        let sig = sign_digest(&secret, &digest).unwrap();

        let mut bad_sig = sig.clone();
        bad_sig[17] ^= 0x01;
        assert!(!verify_digest(&public, &digest, &bad_sig));

        let mut bad_key = public.clone();
        bad_key[3] ^= 0x80;
        assert!(!verify_digest(&bad_key, &digest, &sig));

        let other = sha256(b"different payload");
        assert!(!verify_digest(&public, &other, &sig));
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let (secret, _) = new_key_pair();
        let (_, other_public) = new_key_pair();
        let digest = sha256(b"msg");
        let sig = sign_digest(&secret, &digest).unwrap();
        assert!(!verify_digest(&other_public, &digest, &sig));
    }
}
