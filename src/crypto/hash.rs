//! SHA-256 hashing and fixed-width hex helpers
//!
//! All hashes on the wire and on disk are lowercase 64-character hex strings.
//! Canonical encodings concatenate fixed-width hex fields, so the width
//! helpers here are part of the consensus rules.

use sha2::{Digest, Sha256};

/// Length of a rendered SHA-256 digest in hex characters
pub const HASH_HEX_LEN: usize = 64;

/// SHA-256 over raw bytes
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over raw bytes, rendered as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Count leading zero bits of a digest, MSB first
pub fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0u32;
    for &byte in digest {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// 8-hex-digit big-endian rendering of a 32-bit value
pub fn hex_u32(value: u32) -> String {
    format!("{value:08x}")
}

/// 16-hex-digit big-endian rendering of a 64-bit value
pub fn hex_u64(value: u64) -> String {
    format!("{value:016x}")
}

/// 16-hex-digit rendering of an amount in base units
pub fn hex_amount(amount: i64) -> String {
    hex_u64(amount as u64)
}

/// Check that a string is a well-formed lowercase hex digest
pub fn is_hex_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
