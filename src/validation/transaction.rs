//! Transaction structures and canonical id computation
//!
//! A transaction id is SHA-256 over the concatenation, for each input in
//! order, of (previous tx id, 8-hex output index), then for each output in
//! order, of (recipient address, 16-hex amount). Ids are recomputed on
//! validation and never trusted from the wire.

use serde::{Deserialize, Serialize};

use crate::crypto::{hex_amount, hex_u32, sha256_hex};

/// A transaction input referencing a previous output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    /// Id of the transaction containing the referenced output
    #[serde(rename = "t")]
    pub prev_tx_id: String,
    /// Index of the referenced output
    #[serde(rename = "i")]
    pub prev_out_index: u32,
    /// Signature string; empty for a coinbase input
    #[serde(rename = "s")]
    pub signature: String,
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Amount in base units
    #[serde(rename = "c")]
    pub amount: i64,
    /// Recipient address
    #[serde(rename = "a")]
    pub address: String,
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Canonical id over inputs and outputs
    pub id: String,
    #[serde(rename = "i")]
    pub inputs: Vec<TxIn>,
    #[serde(rename = "o")]
    pub outputs: Vec<TxOut>,
}

/// A transaction waiting in the mempool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Arrival time, ms since Unix epoch
    #[serde(rename = "t")]
    pub arrived_at: u64,
    #[serde(rename = "tx")]
    pub transaction: Transaction,
}

impl Transaction {
    /// Build a transaction, computing its id from the given inputs/outputs
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        let id = compute_tx_id(&inputs, &outputs);
        Transaction { id, inputs, outputs }
    }

    /// Build the coinbase transaction for a block
    ///
    /// The single input references the 8-hex block height with output index 0
    /// and an empty signature; the single output pays the miner.
    pub fn coinbase(height: u64, reward: i64, miner_address: &str) -> Self {
        Transaction::new(
            vec![TxIn {
                prev_tx_id: hex_u32(height as u32),
                prev_out_index: 0,
                signature: String::new(),
            }],
            vec![TxOut {
                amount: reward,
                address: miner_address.to_string(),
            }],
        )
    }

    /// Recompute this transaction's canonical id
    pub fn compute_id(&self) -> String {
        compute_tx_id(&self.inputs, &self.outputs)
    }

    /// Shape check for a coinbase at a specific height: one input referencing
    /// the height pseudo-id with index 0 and empty signature, one output
    pub fn is_coinbase_for(&self, height: u64) -> bool {
        self.inputs.len() == 1
            && self.outputs.len() == 1
            && self.inputs[0].prev_tx_id == hex_u32(height as u32)
            && self.inputs[0].prev_out_index == 0
            && self.inputs[0].signature.is_empty()
    }

    /// All outputs have a recipient and a positive amount
    pub fn outputs_well_formed(&self) -> bool {
        self.outputs
            .iter()
            .all(|out| !out.address.is_empty() && out.amount > 0)
    }

    /// Sum of output amounts
    pub fn total_output(&self) -> i64 {
        self.outputs.iter().map(|out| out.amount).sum()
    }
}

impl PendingTransaction {
    pub fn new(transaction: Transaction, arrived_at: u64) -> Self {
        PendingTransaction {
            arrived_at,
            transaction,
        }
    }
}

fn compute_tx_id(inputs: &[TxIn], outputs: &[TxOut]) -> String {
    let mut canonical = String::new();
    for input in inputs {
        canonical.push_str(&input.prev_tx_id);
        canonical.push_str(&hex_u32(input.prev_out_index));
    }
    for output in outputs {
        canonical.push_str(&output.address);
        canonical.push_str(&hex_amount(output.amount));
    }
    sha256_hex(canonical.as_bytes())
}
