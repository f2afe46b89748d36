//! Block structure and proof-of-work
//!
//! The canonical header for hashing is the concatenation of fixed-width hex
//! fields: 8-digit height, 16-digit timestamp, merkle root, previous hash,
//! 8-digit nonce. The block hash is SHA-256 over that ASCII sequence.

use serde::{Deserialize, Serialize};

use crate::constants::{GENESIS_HASH, GENESIS_PREV_HASH, GENESIS_TIMESTAMP};
use crate::crypto::{hex_u32, hex_u64, is_hex_hash, leading_zero_bits, sha256, sha256_hex};
use crate::validation::Transaction;

use super::Network;

/// A block in the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Height; index 0 is genesis
    #[serde(rename = "i")]
    pub height: u64,
    /// Milliseconds since Unix epoch
    #[serde(rename = "t")]
    pub timestamp: u64,
    /// Transactions; first is the coinbase on every non-genesis block
    #[serde(rename = "txs")]
    pub transactions: Vec<Transaction>,
    /// Merkle root over transaction ids
    #[serde(rename = "merkle")]
    pub merkle_root: String,
    /// Hash of the preceding block
    #[serde(rename = "prev")]
    pub previous_hash: String,
    /// This block's own hash
    #[serde(rename = "h")]
    pub hash: String,
    /// PoW nonce
    #[serde(rename = "n")]
    pub nonce: u32,
}

/// Two blocks are equal iff every field except the transaction list matches;
/// transactions are compared only through the merkle root.
impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.height == other.height
            && self.timestamp == other.timestamp
            && self.merkle_root == other.merkle_root
            && self.previous_hash == other.previous_hash
            && self.hash == other.hash
            && self.nonce == other.nonce
    }
}

impl Eq for Block {}

impl Block {
    /// Canonical header prefix: everything except the nonce digits
    pub fn header_prefix(height: u64, timestamp: u64, merkle_root: &str, previous_hash: &str) -> String {
        format!(
            "{}{}{}{}",
            hex_u32(height as u32),
            hex_u64(timestamp),
            merkle_root,
            previous_hash
        )
    }

    /// Canonical header of this block, nonce included
    pub fn header_hex(&self) -> String {
        format!(
            "{}{}",
            Self::header_prefix(self.height, self.timestamp, &self.merkle_root, &self.previous_hash),
            hex_u32(self.nonce)
        )
    }

    /// SHA-256 of the canonical header
    pub fn compute_hash(&self) -> String {
        sha256_hex(self.header_hex().as_bytes())
    }

    /// True when the canonical header hash meets the difficulty for this height
    pub fn pow_ok(&self, network: Network) -> bool {
        let digest = sha256(self.header_hex().as_bytes());
        leading_zero_bits(&digest) >= network.difficulty(self.height)
    }

    /// Shape checks applied to blocks announced by peers before any chain
    /// work: well-formed hashes and a header that carries its own PoW.
    pub fn sane(&self, network: Network) -> bool {
        is_hex_hash(&self.hash) && is_hex_hash(&self.previous_hash) && self.pow_ok(network)
    }
}

/// The fixed genesis block
///
/// Its hash is a constant of the network, not a recomputation; genesis is
/// never validated, only matched.
pub fn genesis_block() -> Block {
    Block {
        height: 0,
        timestamp: GENESIS_TIMESTAMP,
        transactions: Vec::new(),
        merkle_root: String::new(),
        previous_hash: GENESIS_PREV_HASH.to_string(),
        hash: GENESIS_HASH.to_string(),
        nonce: 0,
    }
}
