//! Transaction store
//!
//! Holds the transaction index (id -> chain location), a lazy body cache fed
//! from the block store, the ordered UTXO list, and the mempool. All four are
//! persisted in a single JSON document.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validation::{PendingTransaction, Transaction, TxOut};

use super::{BlockStore, StoreError};

const TX_FILE: &str = "transactions.json";

/// Where an accepted transaction lives in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLocation {
    /// Containing block height
    #[serde(rename = "block")]
    pub block_height: u64,
    /// Position within the block
    #[serde(rename = "index")]
    pub position: u32,
}

/// An unspent transaction output
///
/// The address is a hint for scanning; validation re-consults the actual
/// output before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    #[serde(rename = "tx")]
    pub tx_id: String,
    #[serde(rename = "index")]
    pub out_index: u32,
    #[serde(rename = "addr")]
    pub address: String,
}

/// A UTXO resolved against its actual output, ready for coin selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableOutput {
    pub tx_id: String,
    pub out_index: u32,
    pub output: TxOut,
}

#[derive(Serialize, Deserialize, Default)]
struct TxStoreDoc {
    tx_indices: HashMap<String, TxLocation>,
    utxo: Vec<Utxo>,
    mempool: Vec<PendingTransaction>,
}

/// Transaction index, UTXO list, and mempool
pub struct TxStore {
    path: PathBuf,
    index: HashMap<String, TxLocation>,
    cache: HashMap<String, Transaction>,
    utxos: Vec<Utxo>,
    mempool: Vec<PendingTransaction>,
}

impl TxStore {
    /// Open the store, starting empty when no document exists yet
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(TX_FILE);
        let doc: TxStoreDoc = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            TxStoreDoc::default()
        };
        Ok(TxStore {
            path,
            index: doc.tx_indices,
            cache: HashMap::new(),
            utxos: doc.utxo,
            mempool: doc.mempool,
        })
    }

    /// Persist the index, UTXO list, and mempool
    pub fn flush(&self) -> Result<(), StoreError> {
        let doc = TxStoreDoc {
            tx_indices: self.index.clone(),
            utxo: self.utxos.clone(),
            mempool: self.mempool.clone(),
        };
        fs::write(&self.path, serde_json::to_string(&doc)?)?;
        Ok(())
    }

    /// True when the id is in the accepted-transaction index
    pub fn has_tx(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Location of an accepted transaction
    pub fn location(&self, id: &str) -> Option<&TxLocation> {
        self.index.get(id)
    }

    /// Fetch an accepted transaction body, reading its block on a cache miss
    ///
    /// A miss loads the whole containing block and caches every transaction
    /// in it, since peers that ask for one usually ask for its siblings.
    pub fn get_tx(
        &mut self,
        id: &str,
        blocks: &mut BlockStore,
    ) -> Result<Option<Transaction>, StoreError> {
        if let Some(tx) = self.cache.get(id) {
            return Ok(Some(tx.clone()));
        }
        let height = match self.index.get(id) {
            Some(location) => location.block_height,
            None => return Ok(None),
        };
        let block = blocks.get_by_height(height)?.ok_or_else(|| {
            StoreError::Corrupt(format!("tx {id} indexed at missing height {height}"))
        })?;
        for tx in &block.transactions {
            self.cache.insert(tx.id.clone(), tx.clone());
        }
        Ok(self.cache.get(id).cloned())
    }

    /// The current UTXO list, in store order
    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    /// Number of mempool entries
    pub fn mempool_len(&self) -> usize {
        self.mempool.len()
    }

    /// True when the id sits in the mempool
    pub fn mempool_contains(&self, id: &str) -> bool {
        self.mempool.iter().any(|p| p.transaction.id == id)
    }

    /// Queue a pending transaction
    pub fn add_pending(&mut self, pending: PendingTransaction) {
        self.mempool.push(pending);
    }

    /// Fetch a pending transaction by id
    pub fn get_pending(&self, id: &str) -> Option<&PendingTransaction> {
        self.mempool.iter().find(|p| p.transaction.id == id)
    }

    /// Oldest-first mempool snapshot, bounded
    pub fn pending_sorted(&self, limit: usize) -> Vec<PendingTransaction> {
        let mut pending = self.mempool.clone();
        pending.sort_by_key(|p| p.arrived_at);
        pending.truncate(limit);
        pending
    }

    /// Index an accepted transaction and roll the UTXO set forward
    pub fn add_tx(
        &mut self,
        tx: &Transaction,
        block_height: u64,
        position: u32,
    ) -> Result<(), StoreError> {
        if self.index.contains_key(&tx.id) {
            return Err(StoreError::Corrupt(format!(
                "transaction {} already indexed",
                tx.id
            )));
        }
        self.index.insert(
            tx.id.clone(),
            TxLocation {
                block_height,
                position,
            },
        );
        self.cache.insert(tx.id.clone(), tx.clone());

        for input in &tx.inputs {
            self.utxos
                .retain(|u| !(u.tx_id == input.prev_tx_id && u.out_index == input.prev_out_index));
        }
        for (out_index, output) in tx.outputs.iter().enumerate() {
            self.utxos.push(Utxo {
                tx_id: tx.id.clone(),
                out_index: out_index as u32,
                address: output.address.clone(),
            });
        }
        self.mempool.retain(|p| p.transaction.id != tx.id);
        Ok(())
    }

    /// De-index a rolled-back transaction and revert its UTXO effects
    ///
    /// Consumed outputs are restored with the address re-derived from the
    /// referenced output; a coinbase pseudo-input resolves to nothing and is
    /// skipped.
    pub fn remove_tx(
        &mut self,
        tx: &Transaction,
        blocks: &mut BlockStore,
    ) -> Result<(), StoreError> {
        for input in &tx.inputs {
            let referenced = self.get_tx(&input.prev_tx_id, blocks)?;
            if let Some(referenced) = referenced {
                if let Some(output) = referenced.outputs.get(input.prev_out_index as usize) {
                    self.utxos.push(Utxo {
                        tx_id: input.prev_tx_id.clone(),
                        out_index: input.prev_out_index,
                        address: output.address.clone(),
                    });
                }
            }
        }
        self.utxos.retain(|u| u.tx_id != tx.id);
        self.index.remove(&tx.id);
        self.cache.remove(&tx.id);
        Ok(())
    }

    /// Spendable outputs for an address plus outputs promised to it in the
    /// mempool
    ///
    /// UTXOs whose hint matches are re-checked against the actual output;
    /// inconsistent hints are dropped. UTXOs already consumed by a pending
    /// transaction are excluded.
    pub fn collect_for_address(
        &mut self,
        address: &str,
        blocks: &mut BlockStore,
    ) -> Result<(Vec<SpendableOutput>, Vec<TxOut>), StoreError> {
        let hinted: Vec<Utxo> = self
            .utxos
            .iter()
            .filter(|u| u.address == address)
            .cloned()
            .collect();

        let mut spendable = Vec::new();
        for utxo in hinted {
            let Some(tx) = self.get_tx(&utxo.tx_id, blocks)? else {
                continue;
            };
            let Some(output) = tx.outputs.get(utxo.out_index as usize) else {
                continue;
            };
            if output.address != address {
                continue;
            }
            spendable.push(SpendableOutput {
                tx_id: utxo.tx_id,
                out_index: utxo.out_index,
                output: output.clone(),
            });
        }

        let mut pending_outputs = Vec::new();
        for pending in &self.mempool {
            for input in &pending.transaction.inputs {
                spendable.retain(|s| {
                    !(s.tx_id == input.prev_tx_id && s.out_index == input.prev_out_index)
                });
            }
            for output in &pending.transaction.outputs {
                if output.address == address {
                    pending_outputs.push(output.clone());
                }
            }
        }

        Ok((spendable, pending_outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Network;
    use crate::validation::TxIn;
    use tempfile::TempDir;

    fn store_pair(dir: &TempDir) -> (BlockStore, TxStore) {
        let blocks = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        let txs = TxStore::open(dir.path()).unwrap();
        (blocks, txs)
    }

    fn pay(to: &str, amount: i64) -> Transaction {
        Transaction::new(
            vec![],
            vec![TxOut {
                amount,
                address: to.to_string(),
            }],
        )
    }

    #[test]
    fn test_add_tx_rolls_utxos_forward() {
        let dir = TempDir::new().unwrap();
        let (_, mut txs) = store_pair(&dir);

        let funding = pay("alice", 500);
        txs.add_tx(&funding, 1, 0).unwrap();
        assert_eq!(txs.utxos().len(), 1);

        let spend = Transaction::new(
            vec![TxIn {
                prev_tx_id: funding.id.clone(),
                prev_out_index: 0,
                signature: String::new(),
            }],
            vec![TxOut {
                amount: 450,
                address: "bob".into(),
            }],
        );
        txs.add_tx(&spend, 2, 1).unwrap();

        assert_eq!(txs.utxos().len(), 1);
        assert_eq!(txs.utxos()[0].tx_id, spend.id);
        assert_eq!(txs.utxos()[0].address, "bob");
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, mut txs) = store_pair(&dir);
        let tx = pay("alice", 1);
        txs.add_tx(&tx, 1, 0).unwrap();
        assert!(txs.add_tx(&tx, 1, 0).is_err());
    }

    #[test]
    fn test_add_tx_evicts_matching_mempool_entry() {
        let dir = TempDir::new().unwrap();
        let (_, mut txs) = store_pair(&dir);
        let tx = pay("alice", 1);
        txs.add_pending(PendingTransaction::new(tx.clone(), 10));
        assert!(txs.mempool_contains(&tx.id));
        txs.add_tx(&tx, 1, 0).unwrap();
        assert!(!txs.mempool_contains(&tx.id));
        assert!(txs.has_tx(&tx.id));
    }

    #[test]
    fn test_pending_sorted_oldest_first() {
        let dir = TempDir::new().unwrap();
        let (_, mut txs) = store_pair(&dir);
        txs.add_pending(PendingTransaction::new(pay("a", 1), 30));
        txs.add_pending(PendingTransaction::new(pay("b", 2), 10));
        txs.add_pending(PendingTransaction::new(pay("c", 3), 20));

        let sorted = txs.pending_sorted(2);
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].arrived_at, 10);
        assert_eq!(sorted[1].arrived_at, 20);
    }

    #[test]
    fn test_collect_for_address_drops_pending_spends() {
        let dir = TempDir::new().unwrap();
        let mut blocks = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        let mut txs = TxStore::open(dir.path()).unwrap();

        // fund alice through a block so get_tx can resolve the output
        let funding = pay("alice", 500);
        let prev = blocks.latest().clone();
        let mut block = crate::consensus::Block {
            height: 1,
            timestamp: prev.timestamp + 1,
            transactions: vec![funding.clone()],
            merkle_root: String::new(),
            previous_hash: prev.hash.clone(),
            hash: String::new(),
            nonce: 0,
        };
        block.hash = block.compute_hash();
        blocks.add_block(&block, false).unwrap();
        txs.add_tx(&funding, 1, 0).unwrap();

        let (spendable, pending) = txs.collect_for_address("alice", &mut blocks).unwrap();
        assert_eq!(spendable.len(), 1);
        assert_eq!(spendable[0].output.amount, 500);
        assert!(pending.is_empty());

        // a mempool spend of that UTXO hides it and promises change back
        let spend = Transaction::new(
            vec![TxIn {
                prev_tx_id: funding.id.clone(),
                prev_out_index: 0,
                signature: String::new(),
            }],
            vec![
                TxOut {
                    amount: 400,
                    address: "bob".into(),
                },
                TxOut {
                    amount: 50,
                    address: "alice".into(),
                },
            ],
        );
        txs.add_pending(PendingTransaction::new(spend, 99));

        let (spendable, pending) = txs.collect_for_address("alice", &mut blocks).unwrap();
        assert!(spendable.is_empty());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount, 50);
    }

    #[test]
    fn test_remove_tx_restores_consumed_utxos() {
        let dir = TempDir::new().unwrap();
        let mut blocks = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        let mut txs = TxStore::open(dir.path()).unwrap();

        let funding = pay("alice", 500);
        let prev = blocks.latest().clone();
        let mut block = crate::consensus::Block {
            height: 1,
            timestamp: prev.timestamp + 1,
            transactions: vec![funding.clone()],
            merkle_root: String::new(),
            previous_hash: prev.hash.clone(),
            hash: String::new(),
            nonce: 0,
        };
        block.hash = block.compute_hash();
        blocks.add_block(&block, false).unwrap();
        txs.add_tx(&funding, 1, 0).unwrap();

        let spend = Transaction::new(
            vec![TxIn {
                prev_tx_id: funding.id.clone(),
                prev_out_index: 0,
                signature: String::new(),
            }],
            vec![TxOut {
                amount: 450,
                address: "bob".into(),
            }],
        );
        txs.add_tx(&spend, 2, 1).unwrap();
        txs.remove_tx(&spend, &mut blocks).unwrap();

        assert!(!txs.has_tx(&spend.id));
        assert_eq!(txs.utxos().len(), 1);
        assert_eq!(txs.utxos()[0].tx_id, funding.id);
        assert_eq!(txs.utxos()[0].address, "alice");
    }

    #[test]
    fn test_flush_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let (_, mut txs) = store_pair(&dir);
            txs.add_tx(&pay("alice", 500), 1, 0).unwrap();
            txs.add_pending(PendingTransaction::new(pay("bob", 5), 77));
            txs.flush().unwrap();
        }
        let txs = TxStore::open(dir.path()).unwrap();
        assert_eq!(txs.utxos().len(), 1);
        assert_eq!(txs.mempool_len(), 1);
    }
}
