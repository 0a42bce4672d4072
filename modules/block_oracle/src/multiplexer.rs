//! Request multiplexing: block hash to waiting requestors.
//!
//! Each hash maps to the set of requestors awaiting it. Delivery is
//! all-or-nothing per hash and at-most-once per registration - a
//! requestor that wants the block again must re-request it.

use std::collections::{HashMap, HashSet};

use obelisk_common::{BlockHash, BlockLocation, RequestorId};

/// Per-cycle accumulator of outbound reply content, one entry per
/// requestor. Built transiently, flushed, discarded.
#[derive(Debug, Default)]
pub struct NotificationBatch {
    replies: HashMap<RequestorId, Vec<(BlockHash, BlockLocation)>>,
}

impl NotificationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    fn append(&mut self, requestor: RequestorId, hash: BlockHash, location: BlockLocation) {
        self.replies.entry(requestor).or_default().push((hash, location));
    }

    /// Take every accumulated reply, leaving the batch empty. Within one
    /// requestor's reply, pairs keep the order they were appended;
    /// ordering across requestors is arbitrary.
    pub fn drain(&mut self) -> Vec<(RequestorId, Vec<(BlockHash, BlockLocation)>)> {
        self.replies.drain().collect()
    }
}

#[derive(Default)]
pub struct RequestMultiplexer {
    waiters: HashMap<BlockHash, HashSet<RequestorId>>,
}

impl RequestMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a requestor to the waiter set for a hash. Idempotent.
    pub fn register(&mut self, hash: BlockHash, requestor: RequestorId) {
        self.waiters.entry(hash).or_default().insert(requestor);
    }

    /// Number of requestors currently waiting across all hashes
    pub fn pending(&self) -> usize {
        self.waiters.values().map(|set| set.len()).sum()
    }

    /// Notify every waiter of a hash that its location is known.
    ///
    /// No-op when nobody is waiting, and no-op when the location is
    /// invalid - waiters stay registered across transient misses rather
    /// than being told about every failed lookup. On a valid location the
    /// whole waiter entry is removed, giving single delivery.
    pub fn notify_one(
        &mut self,
        hash: BlockHash,
        location: BlockLocation,
        batch: &mut NotificationBatch,
    ) {
        if !location.is_valid() {
            return;
        }
        let Some(requestors) = self.waiters.remove(&hash) else {
            return;
        };
        for requestor in requestors {
            batch.append(requestor, hash, location);
        }
    }

    /// `notify_one` applied pairwise. The slices must be the same length;
    /// a mismatch means a co-located component corrupted the pairing and
    /// there is nothing safe left to do.
    pub fn notify_many(
        &mut self,
        hashes: &[BlockHash],
        locations: &[BlockLocation],
        batch: &mut NotificationBatch,
    ) {
        assert_eq!(
            hashes.len(),
            locations.len(),
            "hash/location pair count mismatch"
        );
        for (hash, location) in hashes.iter().zip(locations) {
            self.notify_one(*hash, *location, batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obelisk_common::BlockHandle;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::new([byte; 32])
    }

    fn location(handle: u64) -> BlockLocation {
        BlockLocation::Valid(BlockHandle(handle))
    }

    fn requestor(name: &str) -> RequestorId {
        RequestorId::new(name)
    }

    #[test]
    fn delivers_exactly_once() {
        let mut mux = RequestMultiplexer::new();
        mux.register(hash(1), requestor("r1"));

        let mut batch = NotificationBatch::new();
        mux.notify_one(hash(1), location(10), &mut batch);
        let replies = batch.drain();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, requestor("r1"));
        assert_eq!(replies[0].1, vec![(hash(1), location(10))]);

        // Second notification without a new registration delivers nothing
        let mut batch = NotificationBatch::new();
        mux.notify_one(hash(1), location(10), &mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn registration_is_idempotent() {
        let mut mux = RequestMultiplexer::new();
        mux.register(hash(1), requestor("r1"));
        mux.register(hash(1), requestor("r1"));
        assert_eq!(mux.pending(), 1);

        let mut batch = NotificationBatch::new();
        mux.notify_one(hash(1), location(10), &mut batch);
        let replies = batch.drain();
        assert_eq!(replies[0].1.len(), 1);
    }

    #[test]
    fn invalid_location_leaves_waiters_registered() {
        let mut mux = RequestMultiplexer::new();
        mux.register(hash(1), requestor("r1"));
        mux.register(hash(1), requestor("r2"));

        let mut batch = NotificationBatch::new();
        mux.notify_one(hash(1), BlockLocation::Invalid, &mut batch);
        assert!(batch.is_empty());
        assert_eq!(mux.pending(), 2);
    }

    #[test]
    fn notifies_all_waiters_of_a_hash() {
        let mut mux = RequestMultiplexer::new();
        mux.register(hash(1), requestor("r1"));
        mux.register(hash(1), requestor("r2"));

        let mut batch = NotificationBatch::new();
        mux.notify_one(hash(1), location(10), &mut batch);
        let replies = batch.drain();
        assert_eq!(replies.len(), 2);
        assert_eq!(mux.pending(), 0);
    }

    #[test]
    fn unknown_hash_is_a_no_op() {
        let mut mux = RequestMultiplexer::new();
        let mut batch = NotificationBatch::new();
        mux.notify_one(hash(9), location(1), &mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn reply_preserves_append_order_per_requestor() {
        let mut mux = RequestMultiplexer::new();
        mux.register(hash(1), requestor("r1"));
        mux.register(hash(3), requestor("r1"));

        let mut batch = NotificationBatch::new();
        mux.notify_many(
            &[hash(1), hash(2), hash(3)],
            &[location(1), location(2), location(3)],
            &mut batch,
        );
        let replies = batch.drain();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].1,
            vec![(hash(1), location(1)), (hash(3), location(3))]
        );
    }

    #[test]
    #[should_panic(expected = "pair count mismatch")]
    fn pair_count_mismatch_aborts() {
        let mut mux = RequestMultiplexer::new();
        let mut batch = NotificationBatch::new();
        mux.notify_many(&[hash(1)], &[], &mut batch);
    }

    #[test]
    fn drain_empties_the_batch() {
        let mut mux = RequestMultiplexer::new();
        mux.register(hash(1), requestor("r1"));

        let mut batch = NotificationBatch::new();
        mux.notify_one(hash(1), location(10), &mut batch);
        assert!(!batch.is_empty());
        batch.drain();
        assert!(batch.is_empty());
    }
}
