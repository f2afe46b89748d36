//! Chain parameters
//!
//! Difficulty, minimum block spacing, and block reward are pure functions of
//! height. There is no retargeting from observed block times.

use crate::constants::COIN;

/// Parameter set selector
///
/// `Main` is the wire-compatible schedule. `Regtest` keeps the monetary
/// schedule but drops the PoW and spacing requirements so chains can be
/// crafted without grinding hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Main,
    Regtest,
}

impl Network {
    /// Required leading zero bits of a block hash at a given height
    pub fn difficulty(&self, height: u64) -> u32 {
        match self {
            Network::Regtest => 0,
            Network::Main => match height {
                0 => 0,
                1..=49 => 20,
                50..=99 => 24,
                100..=999 => 28,
                1000..=9999 => 32,
                _ => 36,
            },
        }
    }

    /// Minimum milliseconds between a block and its parent
    pub fn min_distance_ms(&self, height: u64) -> u64 {
        match self {
            Network::Regtest => 0,
            Network::Main => {
                if height <= 100 {
                    30_000
                } else {
                    let decayed = 600_000i64 - 60_000 * (height / 10_000) as i64;
                    decayed.max(60_000) as u64
                }
            }
        }
    }

    /// Coinbase base reward at a given height, in base units
    ///
    /// 64 OX at genesis, halving every 10 000 blocks.
    pub fn base_reward(&self, height: u64) -> i64 {
        let halvings = height / 10_000;
        if halvings >= 63 {
            return 0;
        }
        (64 * COIN) >> halvings
    }
}
