//! OXIDE (OX) Blockchain Core Library
//!
//! A small self-contained cryptocurrency node: PoW consensus over a single
//! append-only chain, UTXO ledger, newline-framed JSON peer protocol, and
//! multi-peer initial block download.
//!
//! OX is the short form used in addresses and protocol identifiers.

pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod mining;
pub mod node;
pub mod p2p;
pub mod storage;
pub mod validation;

/// Protocol constants - HARD-CODED, NEVER CONFIGURABLE
pub mod constants {
    /// Number of base units per OX coin (8 decimal places)
    pub const COIN: i64 = 100_000_000;

    /// Flat fee charged per transaction (0.5 OX, in base units)
    pub const FEE_PER_TX: i64 = COIN / 2;

    /// Maximum inputs a single transaction may carry
    pub const MAX_TX_INPUTS: usize = 32;

    /// Maximum non-coinbase transactions per block
    pub const MAX_TX_IN_BLOCK: usize = 32;

    /// Maximum blocks served per GetBlocks request
    pub const MAX_GET_BLOCKS: u64 = 32;

    /// Maximum pending transactions served per GetMempool request
    pub const MAX_PENDING_TO_SEND: usize = 32;

    /// How many blocks a fork walk-back steps at a time
    pub const CONFLICT_RESOLUTION_STEPS: u64 = 4;

    /// Peer protocol version; peers advertising less are disconnected
    pub const PROTOCOL_VERSION: u32 = 1;

    /// Furthest a block timestamp may sit in the future (30 hours, ms)
    pub const MAX_FUTURE_BLOCK_TIME_MS: u64 = 30 * 60 * 60 * 1000;

    /// Blocks per persisted bucket file
    pub const BLOCKS_PER_BUCKET: u64 = 100;

    /// Nonces searched per mining attempt
    pub const MINING_BATCH_SIZE: u32 = 100_000;

    /// Mining gives up once the nonce reaches 2^31 - 1
    pub const MAX_NONCE: u32 = i32::MAX as u32;

    /// Genesis block timestamp (ms since Unix epoch)
    pub const GENESIS_TIMESTAMP: u64 = 1_610_998_200_000;

    /// Genesis previous-block hash (a fixed constant, not a real parent)
    pub const GENESIS_PREV_HASH: &str =
        "4f571e9b08717e7627336808d26ea36958ccea7ff341cc2d218c3df61bd04d08";

    /// Genesis block hash
    pub const GENESIS_HASH: &str =
        "4fd2d32ca7af3219af42639d740781fa75ca956a5e100e0de2579731d120e9f2";

    /// Version byte prefixed to the RIPEMD-160 digest in addresses
    pub const ADDRESS_VERSION: u8 = 0x32;
}
