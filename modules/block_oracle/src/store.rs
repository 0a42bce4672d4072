//! Shared facade over the persistent block store

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use obelisk_common::{BlockHandle, BlockHash, BlockLocation, Position};

/// Interface to the persistent block storage engine
pub trait BlockStore: Send + Sync {
    /// Look up locations for a batch of hashes. Absent blocks come back as
    /// `BlockLocation::Invalid`, in the same order as the input.
    fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockLocation>>;

    /// Accept raw block bytes for validation and storage
    fn receive(&self, raw: Vec<u8>) -> Result<()>;

    /// Persist the chain tip
    fn set_tip(&self, position: Position) -> Result<()>;

    /// Read the persisted chain tip
    fn tip(&self) -> Result<Position>;

    /// Release one unit of in-flight async work. This is admission-control
    /// bookkeeping on the store side, not mutual exclusion.
    fn finish_work(&self) {}
}

/// Thin facade pairing the store with the block download policy
pub struct SharedStore {
    store: Arc<dyn BlockStore>,
    download_blocks: bool,
}

impl SharedStore {
    pub fn new(store: Arc<dyn BlockStore>, download_blocks: bool) -> Self {
        Self {
            store,
            download_blocks,
        }
    }

    pub fn download_blocks(&self) -> bool {
        self.download_blocks
    }

    pub fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockLocation>> {
        self.store.get_blocks(hashes)
    }

    pub fn receive(&self, raw: Vec<u8>) -> Result<()> {
        self.store.receive(raw)
    }

    pub fn set_tip(&self, position: Position) -> Result<()> {
        self.store.set_tip(position)
    }

    pub fn tip(&self) -> Result<Position> {
        self.store.tip()
    }

    pub fn finish_work(&self) {
        self.store.finish_work()
    }
}

#[derive(Default)]
struct MemoryStoreInner {
    locations: HashMap<BlockHash, BlockHandle>,
    blocks: Vec<Vec<u8>>,
    tip: Position,
}

/// In-memory block store, used for tests and single-process runs
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<MemoryStoreInner>,
    finished: AtomicUsize,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of async work credits released so far
    pub fn finished_work(&self) -> usize {
        self.finished.load(Ordering::Relaxed)
    }
}

impl BlockStore for MemoryBlockStore {
    fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockLocation>> {
        let inner = self.inner.read().unwrap();
        Ok(hashes
            .iter()
            .map(|hash| match inner.locations.get(hash) {
                Some(handle) => BlockLocation::Valid(*handle),
                None => BlockLocation::Invalid,
            })
            .collect())
    }

    fn receive(&self, raw: Vec<u8>) -> Result<()> {
        let hash = BlockHash::digest(&raw);
        let mut inner = self.inner.write().unwrap();
        if inner.locations.contains_key(&hash) {
            return Ok(());
        }
        let handle = BlockHandle(inner.blocks.len() as u64);
        inner.blocks.push(raw);
        inner.locations.insert(hash, handle);
        Ok(())
    }

    fn set_tip(&self, position: Position) -> Result<()> {
        self.inner.write().unwrap().tip = position;
        Ok(())
    }

    fn tip(&self) -> Result<Position> {
        Ok(self.inner.read().unwrap().tip)
    }

    fn finish_work(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }
}
