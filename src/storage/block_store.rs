//! Persistent block store
//!
//! Blocks are grouped into buckets of 100 by floor(height / 100), one JSON
//! document per bucket (`blk00042.json`), plus an index document of
//! (height, hash) pairs. The index is dense: entry i has height i.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consensus::{genesis_block, Block, Network};
use crate::constants::BLOCKS_PER_BUCKET;
use crate::crypto::leading_zero_bits;

use super::StoreError;

const INDEX_FILE: &str = "index.json";

/// One (height, hash) pair of the block index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexEntry {
    #[serde(rename = "i")]
    pub height: u64,
    #[serde(rename = "h")]
    pub hash: String,
}

#[derive(Serialize, Deserialize)]
struct BlockIndexDoc {
    block_indices: Vec<BlockIndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    start_index: u64,
    end_index: u64,
    blocks: Vec<Block>,
}

/// Bucketed persistent block store
pub struct BlockStore {
    dir: PathBuf,
    network: Network,
    index: Vec<BlockIndexEntry>,
    buckets: HashMap<u64, Bucket>,
    dirty: BTreeSet<u64>,
    latest: Block,
}

fn bucket_of(height: u64) -> u64 {
    height / BLOCKS_PER_BUCKET
}

fn bucket_path(dir: &Path, bucket: u64) -> PathBuf {
    dir.join(format!("blk{bucket:05}.json"))
}

impl BlockStore {
    /// Open the store, initializing an empty chain with the genesis block
    ///
    /// Loading verifies that index entry i has height i and that every hash
    /// meets the difficulty for its height; any mismatch fails the load.
    pub fn open(dir: impl Into<PathBuf>, network: Network) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let mut store = BlockStore {
            dir,
            network,
            index: Vec::new(),
            buckets: HashMap::new(),
            dirty: BTreeSet::new(),
            latest: genesis_block(),
        };

        if index_path.exists() {
            let doc: BlockIndexDoc = serde_json::from_str(&fs::read_to_string(&index_path)?)?;
            for (pos, entry) in doc.block_indices.iter().enumerate() {
                if entry.height != pos as u64 {
                    return Err(StoreError::Corrupt(format!(
                        "index entry {} has height {}",
                        pos, entry.height
                    )));
                }
                let digest = hex::decode(&entry.hash)
                    .map_err(|_| StoreError::Corrupt(format!("bad hash at height {pos}")))?;
                if leading_zero_bits(&digest) < network.difficulty(entry.height) {
                    return Err(StoreError::Corrupt(format!(
                        "hash at height {pos} fails difficulty"
                    )));
                }
            }
            if doc.block_indices.is_empty() {
                return Err(StoreError::Corrupt("empty block index".into()));
            }
            store.index = doc.block_indices;
            let tip = store.index.len() as u64 - 1;
            store.latest = store
                .get_by_height(tip)?
                .ok_or_else(|| StoreError::Corrupt(format!("missing tip block {tip}")))?;
        } else {
            let genesis = genesis_block();
            store.index.push(BlockIndexEntry {
                height: 0,
                hash: genesis.hash.clone(),
            });
            store.buckets.insert(
                0,
                Bucket {
                    start_index: 0,
                    end_index: 0,
                    blocks: vec![genesis.clone()],
                },
            );
            store.dirty.insert(0);
            store.latest = genesis;
            store.flush()?;
        }

        Ok(store)
    }

    /// Chain length (tip height + 1)
    pub fn len(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Height of the tip
    pub fn height(&self) -> u64 {
        self.len() - 1
    }

    /// The tip block
    pub fn latest(&self) -> &Block {
        &self.latest
    }

    /// The index entries, dense in height
    pub fn index(&self) -> &[BlockIndexEntry] {
        &self.index
    }

    fn load_bucket(&mut self, bucket: u64) -> Result<&mut Bucket, StoreError> {
        if !self.buckets.contains_key(&bucket) {
            let path = bucket_path(&self.dir, bucket);
            let doc: Bucket = serde_json::from_str(&fs::read_to_string(&path)?)?;
            self.buckets.insert(bucket, doc);
        }
        Ok(self.buckets.get_mut(&bucket).expect("bucket just loaded"))
    }

    /// Fetch a block by height, loading its bucket if not cached
    pub fn get_by_height(&mut self, height: u64) -> Result<Option<Block>, StoreError> {
        if height >= self.len() {
            return Ok(None);
        }
        let bucket = self.load_bucket(bucket_of(height))?;
        let offset = (height - bucket.start_index) as usize;
        Ok(bucket.blocks.get(offset).cloned())
    }

    /// Fetch a block by hash via a linear scan of the index
    pub fn get_by_hash(&mut self, hash: &str) -> Result<Option<Block>, StoreError> {
        let height = match self.index.iter().find(|entry| entry.hash == hash) {
            Some(entry) => entry.height,
            None => return Ok(None),
        };
        self.get_by_height(height)
    }

    /// A continuous run of blocks starting at `start`, at most `max` long
    pub fn range(&mut self, start: u64, max: u64) -> Result<Vec<Block>, StoreError> {
        let mut blocks = Vec::new();
        let end = (start + max).min(self.len());
        for height in start..end {
            match self.get_by_height(height)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Append a block extending the tip
    pub fn add_block(&mut self, block: &Block, flush: bool) -> Result<(), StoreError> {
        if block.height != self.len() {
            return Err(StoreError::Corrupt(format!(
                "add_block at height {} but chain length is {}",
                block.height,
                self.len()
            )));
        }
        self.put(block)?;
        self.index.push(BlockIndexEntry {
            height: block.height,
            hash: block.hash.clone(),
        });
        self.latest = block.clone();
        if flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Route a block into its bucket slot, creating or extending the bucket
    fn put(&mut self, block: &Block) -> Result<(), StoreError> {
        let bucket_no = bucket_of(block.height);
        let exists = self.buckets.contains_key(&bucket_no)
            || bucket_path(&self.dir, bucket_no).exists();

        if exists {
            let bucket = self.load_bucket(bucket_no)?;
            let offset = (block.height - bucket.start_index) as usize;
            if offset < bucket.blocks.len() {
                bucket.blocks[offset] = block.clone();
            } else if offset == bucket.blocks.len() {
                bucket.blocks.push(block.clone());
                bucket.end_index = block.height;
            } else {
                return Err(StoreError::Corrupt(format!(
                    "gap in bucket {bucket_no} at height {}",
                    block.height
                )));
            }
        } else {
            if block.height % BLOCKS_PER_BUCKET != 0 {
                return Err(StoreError::Corrupt(format!(
                    "height {} cannot open bucket {bucket_no}",
                    block.height
                )));
            }
            self.buckets.insert(
                bucket_no,
                Bucket {
                    start_index: block.height,
                    end_index: block.height,
                    blocks: vec![block.clone()],
                },
            );
        }
        self.dirty.insert(bucket_no);
        Ok(())
    }

    /// Overwrite and extend the chain with `received[start_pos..]`
    ///
    /// Blocks below the current length replace their slot (the displaced
    /// block is pushed onto `removed`); blocks at the current length extend
    /// it. The index is rewritten to match and all dirty buckets flushed.
    pub fn replace_from(
        &mut self,
        start_pos: usize,
        received: &[Block],
        removed: &mut Vec<Block>,
    ) -> Result<(), StoreError> {
        for block in &received[start_pos..] {
            if block.height < self.len() {
                if let Some(existing) = self.get_by_height(block.height)? {
                    removed.push(existing);
                }
                self.put(block)?;
                self.index[block.height as usize] = BlockIndexEntry {
                    height: block.height,
                    hash: block.hash.clone(),
                };
            } else if block.height == self.len() {
                self.put(block)?;
                self.index.push(BlockIndexEntry {
                    height: block.height,
                    hash: block.hash.clone(),
                });
            } else {
                return Err(StoreError::Corrupt(format!(
                    "replace_from skipped to height {}",
                    block.height
                )));
            }
        }

        if let Some(last) = received.last() {
            let new_len = last.height + 1;
            while self.len() > new_len {
                let height = self.len() - 1;
                if let Some(existing) = self.get_by_height(height)? {
                    removed.push(existing);
                }
                let bucket_no = bucket_of(height);
                let bucket = self.load_bucket(bucket_no)?;
                bucket.blocks.pop();
                bucket.end_index = bucket.end_index.saturating_sub(1);
                self.dirty.insert(bucket_no);
                self.index.pop();
            }
        }

        let tip = self.height();
        self.latest = self
            .get_by_height(tip)?
            .ok_or_else(|| StoreError::Corrupt(format!("missing tip block {tip}")))?;
        self.flush()
    }

    /// Write the index and all dirty buckets to disk
    pub fn flush(&mut self) -> Result<(), StoreError> {
        for bucket_no in std::mem::take(&mut self.dirty) {
            if let Some(bucket) = self.buckets.get(&bucket_no) {
                let path = bucket_path(&self.dir, bucket_no);
                if bucket.blocks.is_empty() {
                    let _ = fs::remove_file(&path);
                } else {
                    fs::write(&path, serde_json::to_string(bucket)?)?;
                }
            }
        }
        let doc = BlockIndexDoc {
            block_indices: self.index.clone(),
        };
        fs::write(self.dir.join(INDEX_FILE), serde_json::to_string(&doc)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extend(store: &mut BlockStore, count: u64) {
        for _ in 0..count {
            let prev = store.latest().clone();
            let height = prev.height + 1;
            let mut block = Block {
                height,
                timestamp: prev.timestamp + 1000,
                transactions: Vec::new(),
                merkle_root: String::new(),
                previous_hash: prev.hash.clone(),
                hash: String::new(),
                nonce: 0,
            };
            block.hash = block.compute_hash();
            store.add_block(&block, false).unwrap();
        }
    }

    #[test]
    fn test_fresh_store_writes_genesis() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest().height, 0);
        assert_eq!(store.latest().hash, crate::constants::GENESIS_HASH);
        assert!(dir.path().join("blk00000.json").exists());
        assert!(dir.path().join(INDEX_FILE).exists());
    }

    #[test]
    fn test_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = BlockStore::open(dir.path(), Network::Regtest).unwrap();
            extend(&mut store, 5);
            store.flush().unwrap();
        }
        let mut store = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        assert_eq!(store.len(), 6);
        let third = store.get_by_height(3).unwrap().unwrap();
        assert_eq!(third.height, 3);
        let by_hash = store.get_by_hash(&third.hash).unwrap().unwrap();
        assert_eq!(by_hash, third);
    }

    #[test]
    fn test_bucket_rollover() {
        let dir = TempDir::new().unwrap();
        let mut store = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        extend(&mut store, 105);
        store.flush().unwrap();
        assert!(dir.path().join("blk00000.json").exists());
        assert!(dir.path().join("blk00001.json").exists());
        assert_eq!(store.get_by_height(100).unwrap().unwrap().height, 100);
    }

    #[test]
    fn test_add_block_requires_next_height() {
        let dir = TempDir::new().unwrap();
        let mut store = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        let mut block = store.latest().clone();
        block.height = 5;
        assert!(store.add_block(&block, false).is_err());
    }

    #[test]
    fn test_corrupt_index_fails_load() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = BlockStore::open(dir.path(), Network::Regtest).unwrap();
            extend(&mut store, 2);
            store.flush().unwrap();
        }
        let path = dir.path().join(INDEX_FILE);
        let doc = fs::read_to_string(&path).unwrap();
        // swap a height so the index is no longer dense
        fs::write(&path, doc.replace("\"i\":1", "\"i\":9")).unwrap();
        assert!(BlockStore::open(dir.path(), Network::Regtest).is_err());
    }

    #[test]
    fn test_replace_from_captures_removed() {
        let dir = TempDir::new().unwrap();
        let mut store = BlockStore::open(dir.path(), Network::Regtest).unwrap();
        extend(&mut store, 4);
        let old_3 = store.get_by_height(3).unwrap().unwrap();
        let old_4 = store.get_by_height(4).unwrap().unwrap();
        let prev = store.get_by_height(2).unwrap().unwrap();

        // competing branch from height 3, one block longer
        let mut branch = Vec::new();
        let mut parent = prev;
        for height in 3..=5 {
            let mut block = Block {
                height,
                timestamp: parent.timestamp + 2000,
                transactions: Vec::new(),
                merkle_root: String::new(),
                previous_hash: parent.hash.clone(),
                hash: String::new(),
                nonce: 7,
            };
            block.hash = block.compute_hash();
            branch.push(block.clone());
            parent = block;
        }

        let mut removed = Vec::new();
        store.replace_from(0, &branch, &mut removed).unwrap();
        assert_eq!(removed, vec![old_3, old_4]);
        assert_eq!(store.len(), 6);
        assert_eq!(store.latest().hash, branch[2].hash);
        assert_eq!(store.index()[4].hash, branch[1].hash);
    }

    #[test]
    fn test_bucket_routing() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(99), 0);
        assert_eq!(bucket_of(100), 1);
        let dir = PathBuf::from("/tmp");
        assert_eq!(
            bucket_path(&dir, 42).file_name().unwrap().to_str().unwrap(),
            "blk00042.json"
        );
    }
}
