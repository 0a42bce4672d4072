//! Interface to the header-chain oracle

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use obelisk_common::{BlockHash, Position};

/// Best-chain iteration as exposed by the header-chain oracle.
///
/// Reorg reconciliation is the header oracle's own responsibility - the
/// block oracle only ever asks for the current best chain.
pub trait HeaderChain: Send + Sync {
    /// The highest position on the current best chain. An empty chain
    /// reports the default (genesis) position.
    fn best(&self) -> Result<Position>;

    /// Hashes for `count` consecutive heights starting at `start`, all of
    /// which must be on the best chain
    fn hashes_in_range(&self, start: u64, count: usize) -> Result<Vec<BlockHash>>;
}

/// In-process header chain fed from header announcements
#[derive(Default)]
pub struct MemoryHeaderChain {
    headers: RwLock<BTreeMap<u64, BlockHash>>,
}

impl MemoryHeaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a header at the given height, replacing any competitor
    pub fn announce(&self, height: u64, hash: BlockHash) {
        self.headers.write().unwrap().insert(height, hash);
    }

    /// Drop all headers above the fork point
    pub fn rollback_to(&self, height: u64) {
        self.headers.write().unwrap().retain(|h, _| *h <= height);
    }
}

impl HeaderChain for MemoryHeaderChain {
    fn best(&self) -> Result<Position> {
        let headers = self.headers.read().unwrap();
        Ok(headers
            .iter()
            .next_back()
            .map(|(height, hash)| Position::new(*height, *hash))
            .unwrap_or_default())
    }

    fn hashes_in_range(&self, start: u64, count: usize) -> Result<Vec<BlockHash>> {
        let headers = self.headers.read().unwrap();
        let mut hashes = Vec::with_capacity(count);
        for height in start..start + count as u64 {
            match headers.get(&height) {
                Some(hash) => hashes.push(*hash),
                None => bail!("no header at height {height}"),
            }
        }
        Ok(hashes)
    }
}
