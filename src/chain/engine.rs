//! The chain engine
//!
//! Owns the block store, transaction store, UTXO list, and mempool as one
//! aggregate. Callers serialize access through a single lock; every public
//! mutation either commits completely or leaves the aggregate untouched.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::constants::{
    CONFLICT_RESOLUTION_STEPS, FEE_PER_TX, MAX_FUTURE_BLOCK_TIME_MS, MAX_GET_BLOCKS,
    MAX_PENDING_TO_SEND, MAX_TX_INPUTS, MAX_TX_IN_BLOCK,
};
use crate::consensus::{genesis_block, Block, Network};
use crate::crypto::{compute_merkle_root, signer_address, verify_id, KeyPair};
use crate::storage::{BlockStore, StoreError, TxStore};
use crate::validation::{PendingTransaction, Transaction, TxIn, TxOut};

use super::{ChainEvent, EventSink};

/// Why a block failed validation
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Height {got} does not extend {expected}")]
    Height { expected: u64, got: u64 },
    #[error("Timestamp out of bounds")]
    Timestamp,
    #[error("Missing or malformed coinbase")]
    Coinbase,
    #[error("Coinbase amount mismatch")]
    CoinbaseAmount,
    #[error("Transaction id does not recompute")]
    TxId,
    #[error("Duplicate transaction {0}")]
    DuplicateTx(String),
    #[error("Input references unknown transaction {0}")]
    UnknownInput(String),
    #[error("Output already spent")]
    SpentOutput,
    #[error("Output index out of range")]
    OutputIndex,
    #[error("Bad signature")]
    Signature,
    #[error("Signer does not own the referenced output")]
    AddressMismatch,
    #[error("Malformed output")]
    Output,
    #[error("Inputs do not cover outputs plus fee")]
    Unbalanced,
    #[error("Merkle root mismatch")]
    MerkleRoot,
    #[error("Previous hash mismatch")]
    PrevHash,
    #[error("Insufficient proof of work")]
    Pow,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of feeding peer-supplied blocks to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDelivery {
    /// Nothing was delivered
    Empty,
    /// The delivery matches what the chain already has
    NothingChanged,
    /// One block appended at the tip
    AddedSingle,
    /// A run of blocks appended at the tip
    AddedMultiple,
    /// A fork won; part of the chain was replaced and extended
    ReplacedMultiple,
    /// The single delivered block failed validation
    RejectedInvalidSingle,
    /// The delivered run was inconsistent or failed validation
    RejectedInvalidMultiple,
    /// The peer's chain is not longer than ours
    RejectedShorterChain,
    /// Blocks are missing between our tip and the delivery
    NeedMore { start: u64 },
    /// A fork is suspected; buffer the delivery and fetch from `start`
    NeedMoreShouldStore { start: u64 },
}

/// Outcome of mempool admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolAdmission {
    /// No transactions were delivered
    Empty,
    /// The batch was accepted (some entries may have been silently ignored)
    Added,
    /// Reserved; no current path produces it
    SoftRejected,
    /// A transaction failed a hard check; the sender is misbehaving
    HardRejected,
}

/// Outcome of building a local spend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Built, signed, and queued
    Sent(Transaction),
    /// The key does not control the `from` address
    InvalidKey,
    /// Usable outputs do not cover amount plus fee
    Insufficient,
    /// The spend would need more inputs than a transaction may carry
    TooManyInputs,
}

/// The chain aggregate: block store, transaction store, UTXO list, mempool
pub struct Chain {
    network: Network,
    blocks: BlockStore,
    txs: TxStore,
    events: EventSink,
}

impl Chain {
    /// Open both stores, initializing genesis on first run
    pub fn open(dir: impl Into<PathBuf>, network: Network) -> Result<Self, StoreError> {
        let dir = dir.into();
        let blocks = BlockStore::open(&dir, network)?;
        let txs = TxStore::open(&dir)?;
        Ok(Chain {
            network,
            blocks,
            txs,
            events: EventSink::new(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Subscribe to inventory events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Height of the tip
    pub fn height(&self) -> u64 {
        self.blocks.height()
    }

    /// The tip block
    pub fn latest_block(&self) -> Block {
        self.blocks.latest().clone()
    }

    /// Serve a continuous range of blocks, at most `MAX_GET_BLOCKS` long
    pub fn blocks_range(&mut self, start: u64, max: u64) -> Result<Vec<Block>, StoreError> {
        self.blocks.range(start, max.min(MAX_GET_BLOCKS))
    }

    /// Oldest pending transactions for a GetMempool reply
    pub fn pending_snapshot(&self) -> Vec<PendingTransaction> {
        self.txs.pending_sorted(MAX_PENDING_TO_SEND)
    }

    /// True when the id is in the accepted-transaction index
    pub fn contains_tx(&self, id: &str) -> bool {
        self.txs.has_tx(id)
    }

    /// True when the id waits in the mempool
    pub fn is_pending(&self, id: &str) -> bool {
        self.txs.mempool_contains(id)
    }

    /// Spendable and promised amounts for an address
    pub fn balance(&mut self, address: &str) -> Result<(i64, i64), StoreError> {
        let (spendable, pending) = self.txs.collect_for_address(address, &mut self.blocks)?;
        let usable = spendable.iter().map(|s| s.output.amount).sum();
        let promised = pending.iter().map(|out| out.amount).sum();
        Ok((usable, promised))
    }

    /// Flush both stores
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.blocks.flush()?;
        self.txs.flush()
    }

    /// Assemble the mining candidate for the next height
    ///
    /// Selects up to `MAX_TX_IN_BLOCK` oldest pending transactions, builds the
    /// coinbase collecting base reward plus flat fees, and seals the merkle
    /// root. The hash stays empty until mining finds a nonce.
    pub fn assemble_candidate(&mut self, miner_address: &str, timestamp: u64) -> Block {
        let latest = self.blocks.latest().clone();
        let height = latest.height + 1;

        let selected = self.txs.pending_sorted(MAX_TX_IN_BLOCK);
        let fees = FEE_PER_TX * selected.len() as i64;
        let coinbase =
            Transaction::coinbase(height, self.network.base_reward(height) + fees, miner_address);

        let mut transactions = vec![coinbase];
        transactions.extend(selected.into_iter().map(|p| p.transaction));
        let ids: Vec<String> = transactions.iter().map(|tx| tx.id.clone()).collect();

        Block {
            height,
            timestamp,
            transactions,
            merkle_root: compute_merkle_root(&ids),
            previous_hash: latest.hash.clone(),
            hash: String::new(),
            nonce: 0,
        }
    }

    /// Validate a block against `prev` within a delivery batch
    ///
    /// `received` carries every transaction already accepted from this batch
    /// so later blocks may spend earlier in-batch outputs; `spent` tracks the
    /// outpoints consumed across the batch. On success the block's
    /// transactions are folded into `received`.
    fn validate_block(
        &mut self,
        block: &Block,
        prev: &Block,
        received: &mut HashMap<String, Transaction>,
        spent: &mut HashSet<(String, u32)>,
        now_ms: u64,
    ) -> Result<(), ValidationError> {
        if block.height != prev.height + 1 {
            return Err(ValidationError::Height {
                expected: prev.height + 1,
                got: block.height,
            });
        }

        if block.timestamp > now_ms + MAX_FUTURE_BLOCK_TIME_MS {
            return Err(ValidationError::Timestamp);
        }
        if block.timestamp < prev.timestamp + self.network.min_distance_ms(block.height) {
            return Err(ValidationError::Timestamp);
        }

        let Some(coinbase) = block.transactions.first() else {
            return Err(ValidationError::Coinbase);
        };
        if !coinbase.is_coinbase_for(block.height) {
            return Err(ValidationError::Coinbase);
        }
        let expected = self.network.base_reward(block.height)
            + FEE_PER_TX * (block.transactions.len() as i64 - 1);
        if coinbase.outputs[0].amount != expected {
            return Err(ValidationError::CoinbaseAmount);
        }
        if coinbase.compute_id() != coinbase.id {
            return Err(ValidationError::TxId);
        }
        received.insert(coinbase.id.clone(), coinbase.clone());

        for tx in &block.transactions[1..] {
            self.validate_chained_tx(tx, received, spent)?;
            received.insert(tx.id.clone(), tx.clone());
        }

        let ids: Vec<String> = block.transactions.iter().map(|tx| tx.id.clone()).collect();
        if block.merkle_root != compute_merkle_root(&ids) {
            return Err(ValidationError::MerkleRoot);
        }
        if block.previous_hash != prev.hash {
            return Err(ValidationError::PrevHash);
        }
        if block.hash != block.compute_hash() || !block.pow_ok(self.network) {
            return Err(ValidationError::Pow);
        }

        Ok(())
    }

    /// Validate one non-coinbase transaction against the store and the batch
    fn validate_chained_tx(
        &mut self,
        tx: &Transaction,
        received: &HashMap<String, Transaction>,
        spent: &mut HashSet<(String, u32)>,
    ) -> Result<(), ValidationError> {
        if tx.compute_id() != tx.id {
            return Err(ValidationError::TxId);
        }
        if self.txs.has_tx(&tx.id) || received.contains_key(&tx.id) {
            return Err(ValidationError::DuplicateTx(tx.id.clone()));
        }

        let mut input_total = 0i64;
        for input in &tx.inputs {
            let outpoint = (input.prev_tx_id.clone(), input.prev_out_index);
            if spent.contains(&outpoint) {
                return Err(ValidationError::SpentOutput);
            }

            let referenced = match self.txs.get_tx(&input.prev_tx_id, &mut self.blocks)? {
                Some(tx) => tx,
                None => received
                    .get(&input.prev_tx_id)
                    .cloned()
                    .ok_or_else(|| ValidationError::UnknownInput(input.prev_tx_id.clone()))?,
            };
            let output = referenced
                .outputs
                .get(input.prev_out_index as usize)
                .ok_or(ValidationError::OutputIndex)?;

            let signer = signer_address(&input.signature)
                .map_err(|_| ValidationError::Signature)?;
            if signer != output.address {
                return Err(ValidationError::AddressMismatch);
            }
            if !verify_id(&tx.id, &input.signature) {
                return Err(ValidationError::Signature);
            }

            input_total += output.amount;
            spent.insert(outpoint);
        }

        if !tx.outputs_well_formed() {
            return Err(ValidationError::Output);
        }
        if input_total != tx.total_output() + FEE_PER_TX {
            return Err(ValidationError::Unbalanced);
        }

        Ok(())
    }

    /// Accept a block that directly extends the tip (mining or peer delivery)
    pub fn add_new_block(&mut self, block: &Block, now_ms: u64) -> Result<(), ValidationError> {
        let prev = self.blocks.latest().clone();
        let mut received = HashMap::new();
        let mut spent = HashSet::new();
        self.validate_block(block, &prev, &mut received, &mut spent, now_ms)?;
        self.commit_blocks(std::slice::from_ref(block))?;
        self.events.emit(ChainEvent::LatestBlock(block.clone()));
        Ok(())
    }

    /// Append validated blocks and index their transactions
    fn commit_blocks(&mut self, blocks: &[Block]) -> Result<(), StoreError> {
        for block in blocks {
            self.blocks.add_block(block, false)?;
            for (position, tx) in block.transactions.iter().enumerate() {
                self.txs.add_tx(tx, block.height, position as u32)?;
            }
        }
        self.blocks.flush()?;
        self.txs.flush()
    }

    /// Replace the chain from `received[start_idx]` onward
    ///
    /// Transactions of displaced local blocks are de-indexed (their UTXO
    /// effects reverted) before the new blocks are written and indexed.
    fn replace_blocks(&mut self, start_idx: usize, received: &[Block]) -> Result<(), StoreError> {
        let divergence = received[start_idx].height;

        let mut displaced = Vec::new();
        for height in divergence..=self.blocks.height() {
            if let Some(block) = self.blocks.get_by_height(height)? {
                displaced.push(block);
            }
        }
        for block in displaced.iter().rev() {
            for tx in block.transactions.iter().rev() {
                self.txs.remove_tx(tx, &mut self.blocks)?;
            }
        }

        let mut removed = Vec::new();
        self.blocks.replace_from(start_idx, received, &mut removed)?;

        for block in &received[start_idx..] {
            for (position, tx) in block.transactions.iter().enumerate() {
                self.txs.add_tx(tx, block.height, position as u32)?;
            }
        }
        self.txs.flush()
    }

    /// React to a batch of blocks delivered by a peer
    ///
    /// `peer_height` is the height the peer has announced for its own tip;
    /// it decides whether a non-extending delivery is worth chasing.
    pub fn add_blocks_from_peer(
        &mut self,
        delivery: &[Block],
        peer_height: u64,
        now_ms: u64,
    ) -> Result<BlockDelivery, StoreError> {
        let local_height = self.blocks.height();

        let Some(first) = delivery.first() else {
            return Ok(BlockDelivery::Empty);
        };
        if first.height > local_height + 1 {
            return Ok(BlockDelivery::NeedMore {
                start: local_height + 1,
            });
        }

        if delivery.len() == 1 {
            return self.single_block(&delivery[0], peer_height, local_height, now_ms);
        }

        for pair in delivery.windows(2) {
            if pair[1].height != pair[0].height + 1 {
                return Ok(BlockDelivery::RejectedInvalidMultiple);
            }
        }

        let latest = self.blocks.latest().clone();
        if first.height == local_height + 1 && first.previous_hash == latest.hash {
            // direct extension of the tip
            let mut received = HashMap::new();
            let mut spent = HashSet::new();
            let mut prev = latest;
            for block in delivery {
                if let Err(reason) =
                    self.validate_block(block, &prev, &mut received, &mut spent, now_ms)
                {
                    debug!(height = block.height, %reason, "rejecting extension batch");
                    return Ok(BlockDelivery::RejectedInvalidMultiple);
                }
                prev = block.clone();
            }
            self.commit_blocks(delivery)?;
            self.events.emit(ChainEvent::Blocks(delivery.to_vec()));
            return Ok(BlockDelivery::AddedMultiple);
        }

        let last = delivery.last().expect("non-empty delivery");
        if last.height <= local_height {
            if peer_height > local_height {
                return Ok(BlockDelivery::NeedMoreShouldStore {
                    start: last.height + 1,
                });
            }
            return Ok(BlockDelivery::RejectedShorterChain);
        }

        // the tail extends above our tip but the head overlaps or mismatches;
        // find the divergence point
        let mut start_idx = None;
        let mut rolling_prev = None;
        for (i, block) in delivery.iter().enumerate() {
            if block.height <= local_height {
                if block.height == 0 {
                    if *block != genesis_block() {
                        return Ok(BlockDelivery::RejectedInvalidMultiple);
                    }
                    rolling_prev = Some(genesis_block());
                    continue;
                }
                let local = self
                    .blocks
                    .get_by_height(block.height)?
                    .ok_or_else(|| StoreError::Corrupt(format!("missing block {}", block.height)))?;
                if *block == local {
                    rolling_prev = Some(local);
                    continue;
                }
                if i == 0 {
                    // mismatch at the very first received block; walk back
                    return Ok(BlockDelivery::NeedMoreShouldStore {
                        start: block.height.saturating_sub(CONFLICT_RESOLUTION_STEPS),
                    });
                }
                start_idx = Some(i);
                break;
            } else {
                // first block above our tip; everything below matched
                if block.previous_hash != latest.hash {
                    return Ok(BlockDelivery::NeedMoreShouldStore {
                        start: local_height.saturating_sub(CONFLICT_RESOLUTION_STEPS),
                    });
                }
                start_idx = Some(i);
                rolling_prev = Some(latest.clone());
                break;
            }
        }

        let Some(start_idx) = start_idx else {
            return Ok(BlockDelivery::NothingChanged);
        };
        let mut prev = rolling_prev.expect("divergence point has a predecessor");

        let mut received = HashMap::new();
        let mut spent = HashSet::new();
        for block in &delivery[start_idx..] {
            if let Err(reason) = self.validate_block(block, &prev, &mut received, &mut spent, now_ms)
            {
                debug!(height = block.height, %reason, "rejecting replacement batch");
                return Ok(BlockDelivery::RejectedInvalidMultiple);
            }
            prev = block.clone();
        }

        self.replace_blocks(start_idx, delivery)?;
        self.events
            .emit(ChainEvent::Blocks(delivery[start_idx..].to_vec()));
        Ok(BlockDelivery::ReplacedMultiple)
    }

    fn single_block(
        &mut self,
        block: &Block,
        peer_height: u64,
        local_height: u64,
        now_ms: u64,
    ) -> Result<BlockDelivery, StoreError> {
        let latest = self.blocks.latest().clone();

        if block.height == local_height && *block == latest {
            return Ok(BlockDelivery::NothingChanged);
        }

        if block.height == local_height + 1 {
            if block.previous_hash != latest.hash {
                return Ok(BlockDelivery::NeedMoreShouldStore {
                    start: local_height.saturating_sub(CONFLICT_RESOLUTION_STEPS),
                });
            }
            return match self.add_new_block(block, now_ms) {
                Ok(()) => Ok(BlockDelivery::AddedSingle),
                Err(ValidationError::Store(err)) => Err(err),
                Err(reason) => {
                    debug!(height = block.height, %reason, "rejecting single block");
                    Ok(BlockDelivery::RejectedInvalidSingle)
                }
            };
        }

        // a lone block at or below our tip that is not our tip
        if peer_height > local_height {
            return Ok(BlockDelivery::NeedMoreShouldStore {
                start: block.height + 1,
            });
        }
        Ok(BlockDelivery::RejectedShorterChain)
    }

    /// Two-phase mempool admission for a batch of pending transactions
    ///
    /// Hard failures (bad id, malformed parts, bad signature, unbalanced
    /// amounts) reject the whole batch. Transactions referencing parents we
    /// have never seen are silently ignored; they may describe state we have
    /// not synced yet. Duplicates are skipped.
    pub fn add_pending(
        &mut self,
        incoming: &[PendingTransaction],
    ) -> Result<MempoolAdmission, StoreError> {
        if incoming.is_empty() {
            return Ok(MempoolAdmission::Empty);
        }

        let mut accepted: Vec<PendingTransaction> = Vec::new();
        'next: for pending in incoming {
            let tx = &pending.transaction;
            if tx.compute_id() != tx.id {
                return Ok(MempoolAdmission::HardRejected);
            }
            if self.txs.has_tx(&tx.id)
                || self.txs.mempool_contains(&tx.id)
                || accepted.iter().any(|p| p.transaction.id == tx.id)
            {
                continue;
            }

            let mut input_total = 0i64;
            for input in &tx.inputs {
                let Some(referenced) = self.txs.get_tx(&input.prev_tx_id, &mut self.blocks)? else {
                    // unknown parent: ignore the transaction, not the batch
                    continue 'next;
                };
                let Some(output) = referenced.outputs.get(input.prev_out_index as usize) else {
                    return Ok(MempoolAdmission::HardRejected);
                };
                let Ok(signer) = signer_address(&input.signature) else {
                    return Ok(MempoolAdmission::HardRejected);
                };
                if signer != output.address || !verify_id(&tx.id, &input.signature) {
                    return Ok(MempoolAdmission::HardRejected);
                }
                input_total += output.amount;
            }
            if !tx.outputs_well_formed() {
                return Ok(MempoolAdmission::HardRejected);
            }
            if input_total != tx.total_output() + FEE_PER_TX {
                return Ok(MempoolAdmission::HardRejected);
            }

            accepted.push(pending.clone());
        }

        if !accepted.is_empty() {
            for pending in &accepted {
                self.txs.add_pending(pending.clone());
            }
            self.txs.flush()?;
            self.events.emit(ChainEvent::Mempool(accepted));
        }
        Ok(MempoolAdmission::Added)
    }

    /// Build, sign, and queue a spend from `from` to `to`
    pub fn send(
        &mut self,
        from: &str,
        to: &str,
        amount: i64,
        key: &KeyPair,
        now_ms: u64,
    ) -> Result<SendOutcome, StoreError> {
        if key.address() != from {
            return Ok(SendOutcome::InvalidKey);
        }

        let (spendable, _promised) = self.txs.collect_for_address(from, &mut self.blocks)?;

        let needed = amount + FEE_PER_TX;
        let mut selected = Vec::new();
        let mut gathered = 0i64;
        for candidate in spendable {
            if gathered >= needed {
                break;
            }
            gathered += candidate.output.amount;
            selected.push(candidate);
        }

        if selected.len() > MAX_TX_INPUTS {
            return Ok(SendOutcome::TooManyInputs);
        }
        if gathered < needed {
            return Ok(SendOutcome::Insufficient);
        }

        let mut outputs = Vec::new();
        let change = gathered - needed;
        if change > 0 {
            outputs.push(TxOut {
                amount: change,
                address: from.to_string(),
            });
        }
        outputs.push(TxOut {
            amount,
            address: to.to_string(),
        });

        let inputs: Vec<TxIn> = selected
            .iter()
            .map(|s| TxIn {
                prev_tx_id: s.tx_id.clone(),
                prev_out_index: s.out_index,
                signature: String::new(),
            })
            .collect();

        let mut tx = Transaction::new(inputs, outputs);
        let signature = match key.sign_id(&tx.id) {
            Ok(signature) => signature,
            Err(_) => return Ok(SendOutcome::InvalidKey),
        };
        for input in &mut tx.inputs {
            input.signature = signature.clone();
        }

        let pending = PendingTransaction::new(tx.clone(), now_ms);
        self.txs.add_pending(pending.clone());
        self.txs.flush()?;
        self.events.emit(ChainEvent::Mempool(vec![pending]));
        Ok(SendOutcome::Sent(tx))
    }
}
