//! Storage module - Persistent block buckets, transaction index, UTXO set, mempool

mod block_store;
mod tx_store;

pub use block_store::*;
pub use tx_store::*;

use thiserror::Error;

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}
