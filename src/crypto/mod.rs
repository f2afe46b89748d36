//! Cryptography module - SHA-256 hashing, ECDSA signatures, Merkle roots, addresses

mod address;
mod hash;
mod keys;
mod merkle;

pub use address::*;
pub use hash::*;
pub use keys::*;
pub use merkle::*;
