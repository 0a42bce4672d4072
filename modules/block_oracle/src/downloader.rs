//! Tip and queue tracking for block downloads.
//!
//! The downloader pulls hashes from the header-chain oracle in bounded
//! batches and tracks which of them have been materialized in the store.
//! Location lookups complete out of order, but the tip only ever advances
//! along the contiguous received prefix of the queue, so advancement is
//! gated on the queue head rather than on arrival order.

use std::collections::VecDeque;

use anyhow::Result;
use obelisk_common::{BlockHash, BlockLocation, Position};

use crate::header_chain::HeaderChain;

/// One batch of hashes still needed to reach the header tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Height of the first hash in the batch
    pub start_height: u64,

    /// Hashes to fetch, in ascending height order
    pub hashes: Vec<BlockHash>,

    /// Whether further batches remain beyond this one
    pub more: bool,
}

struct PendingBlock {
    height: u64,
    hash: BlockHash,
    // Set once the store has reported a valid location
    location: Option<BlockLocation>,
}

pub struct Downloader {
    tip: Position,
    queue: VecDeque<PendingBlock>,
    batch_size: usize,
}

impl Downloader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            tip: Position::default(),
            queue: VecDeque::new(),
            batch_size,
        }
    }

    /// The highest position whose block is confirmed present locally
    pub fn tip(&self) -> Position {
        self.tip
    }

    /// Unconditionally overwrite the tracked tip (startup load, or a
    /// confirmed reorg). Stale queue entries are the caller's problem -
    /// call `update` afterwards to compact them.
    pub fn set_tip(&mut self, position: Position) {
        self.tip = position;
    }

    /// Compute the next batch of hashes needed after everything already
    /// in flight, up to the batch bound. Never duplicates hashes queued
    /// by a prior call that have not yet been confirmed.
    pub fn add_blocks(&mut self, chain: &dyn HeaderChain) -> Result<BatchPlan> {
        let next = match self.queue.back() {
            Some(pending) => pending.height + 1,
            None => self.tip.height + 1,
        };

        let best = chain.best()?;
        if best.height < next {
            return Ok(BatchPlan {
                start_height: next,
                hashes: Vec::new(),
                more: false,
            });
        }

        let remaining = best.height - next + 1;
        let count = remaining.min(self.batch_size as u64) as usize;
        let hashes = chain.hashes_in_range(next, count)?;

        for (offset, hash) in hashes.iter().enumerate() {
            self.queue.push_back(PendingBlock {
                height: next + offset as u64,
                hash: *hash,
                location: None,
            });
        }

        Ok(BatchPlan {
            start_height: next,
            hashes,
            more: remaining > count as u64,
        })
    }

    /// Record that the storage location for a hash is now known.
    ///
    /// A valid location marks the entry received; if that completes a
    /// contiguous prefix at the head of the queue, the tip advances
    /// through it and the confirmed positions are returned in height
    /// order. An invalid location leaves the entry pending.
    pub fn receive_block(
        &mut self,
        hash: BlockHash,
        location: BlockLocation,
        height_hint: Option<u64>,
    ) -> Vec<(Position, BlockLocation)> {
        if !location.is_valid() {
            return Vec::new();
        }

        let entry = match height_hint {
            Some(height) => {
                self.queue.iter_mut().find(|p| p.height == height && p.hash == hash)
            }
            None => self.queue.iter_mut().find(|p| p.hash == hash),
        };
        let Some(entry) = entry else {
            // Not in flight - already confirmed, or never queued
            return Vec::new();
        };
        entry.location = Some(location);

        let mut confirmed = Vec::new();
        while let Some(front) = self.queue.front() {
            let Some(front_location) = front.location else {
                break;
            };
            let position = Position::new(front.height, front.hash);
            self.queue.pop_front();
            self.tip = position;
            confirmed.push((position, front_location));
        }
        confirmed
    }

    /// Reconcile bookkeeping after a batch of `receive_block` calls -
    /// drops entries the tip has already moved past
    pub fn update(&mut self) {
        let tip_height = self.tip.height;
        self.queue.retain(|pending| pending.height > tip_height);
    }
}
