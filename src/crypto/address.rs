//! Address derivation
//!
//! An address is Base58Check over `0x32 || RIPEMD160(SHA256(pubkey))`, where
//! the public key is the uncompressed SEC1 encoding (leading 0x04 byte). The
//! 4-byte double-SHA256 checksum is appended before Base58 encoding.

use k256::ecdsa::VerifyingKey;
use ripemd::{Digest, Ripemd160};

use crate::constants::ADDRESS_VERSION;

use super::sha256;

/// Derive the OX address for a public key
pub fn address_from_public_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let sha = sha256(point.as_bytes());
    let mut ripe = Ripemd160::new();
    ripe.update(sha);
    let digest = ripe.finalize();

    bs58::encode(digest)
        .with_check_version(ADDRESS_VERSION)
        .into_string()
}

/// Check that a string is a well-formed OX address
pub fn is_valid_address(addr: &str) -> bool {
    match bs58::decode(addr)
        .with_check(Some(ADDRESS_VERSION))
        .into_vec()
    {
        // version byte + 20-byte RIPEMD digest
        Ok(bytes) => bytes.len() == 21,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_address_is_deterministic() {
        let key = KeyPair::generate();
        let a = address_from_public_key(&key.verifying_key());
        let b = address_from_public_key(&key.verifying_key());
        assert_eq!(a, b);
    }

    #[test]
    fn test_derived_address_validates() {
        let key = KeyPair::generate();
        assert!(is_valid_address(&key.address()));
    }

    #[test]
    fn test_tampered_address_rejected() {
        let key = KeyPair::generate();
        let mut addr = key.address();
        // flip the last character to break the checksum
        let last = addr.pop().unwrap();
        addr.push(if last == '1' { '2' } else { '1' });
        assert!(!is_valid_address(&addr));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(!is_valid_address(""));
        assert!(!is_valid_address("not an address"));
        assert!(!is_valid_address("0OIl"));
    }
}
