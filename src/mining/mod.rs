//! Mining module - Candidate assembly and bounded nonce search

mod miner;

pub use miner::*;
