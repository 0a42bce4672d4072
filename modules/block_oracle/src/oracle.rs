//! The block oracle state machine.
//!
//! Owns the downloader and the request multiplexer and reacts to inbound
//! events, returning the outbound messages each one produces. Keeping the
//! handlers free of any messaging runtime makes the whole control loop
//! testable in isolation; the module shell in `block_oracle.rs` maps bus
//! messages onto these calls and publishes whatever comes back.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use obelisk_common::{BlockHash, BlockLocation, Position, RequestorId};
use tracing::{debug, info};

use crate::downloader::Downloader;
use crate::header_chain::HeaderChain;
use crate::multiplexer::{NotificationBatch, RequestMultiplexer};
use crate::store::SharedStore;

/// Actor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initializing,
    Running,
    ShuttingDown,
    Terminated,
}

/// Outbound messages produced by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Blocks delivered to one requestor
    Reply {
        requestor: RequestorId,
        blocks: Vec<(BlockHash, BlockLocation)>,
    },

    /// External new-full-block signal
    TipUpdate(Position),

    /// Chain-scoped progress notification
    Progress { chain: String, position: Position },
}

/// Result of one work cycle
#[derive(Debug, Default)]
pub struct WorkOutcome {
    /// Whether another cycle should be scheduled rather than going idle
    pub more: bool,

    /// Messages to publish
    pub outbound: Vec<Outbound>,
}

pub struct Oracle {
    chain: String,
    state: Lifecycle,
    downloader: Downloader,
    multiplexer: RequestMultiplexer,
    // Collaborators outlive the oracle; handles are dropped on shutdown so
    // nothing can reach them afterwards
    store: Option<Arc<SharedStore>>,
    headers: Option<Arc<dyn HeaderChain>>,
}

impl Oracle {
    pub fn new(
        chain: impl Into<String>,
        store: Arc<SharedStore>,
        headers: Arc<dyn HeaderChain>,
        fetch_batch_size: usize,
    ) -> Self {
        Self {
            chain: chain.into(),
            state: Lifecycle::Initializing,
            downloader: Downloader::new(fetch_batch_size),
            multiplexer: RequestMultiplexer::new(),
            store: Some(store),
            headers: Some(headers),
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Current materialized tip
    pub fn tip(&self) -> Position {
        self.downloader.tip()
    }

    /// Number of requestors still waiting for a block
    pub fn pending_requests(&self) -> usize {
        self.multiplexer.pending()
    }

    fn store(&self) -> Result<Arc<SharedStore>> {
        self.store.clone().ok_or_else(|| anyhow!("block store handle released"))
    }

    fn headers(&self) -> Result<Arc<dyn HeaderChain>> {
        self.headers.clone().ok_or_else(|| anyhow!("header chain handle released"))
    }

    /// Enter the running state. When the download policy is active, the
    /// persisted tip is loaded into the downloader and one work cycle runs
    /// immediately; otherwise the oracle stays idle until triggered.
    pub fn start(&mut self) -> Result<Vec<Outbound>> {
        self.state = Lifecycle::Running;
        let store = self.store()?;
        if !store.download_blocks() {
            info!(chain = %self.chain, "block oracle running (downloads disabled)");
            return Ok(Vec::new());
        }
        let tip = store.tip()?;
        self.downloader.set_tip(tip);
        info!(chain = %self.chain, height = tip.height, hash = %tip.hash,
            "block oracle running");
        Ok(self.work()?.outbound)
    }

    /// A client wants blocks by hash. Registration always happens first -
    /// it is safe even when a block is already available, because the
    /// immediate lookup below resolves it in the same call. Hashes whose
    /// locations come back invalid leave the requestor registered for
    /// later delivery.
    pub fn handle_request_blocks(
        &mut self,
        requestor: &RequestorId,
        hashes: &[BlockHash],
    ) -> Result<Vec<Outbound>> {
        if self.state != Lifecycle::Running {
            debug!("dropping block request while not running");
            return Ok(Vec::new());
        }
        for hash in hashes {
            self.multiplexer.register(*hash, requestor.clone());
        }
        let store = self.store()?;
        let locations = store.get_blocks(hashes)?;

        let mut batch = NotificationBatch::new();
        self.multiplexer.notify_many(hashes, &locations, &mut batch);
        Ok(Self::replies(&mut batch))
    }

    /// The storage layer completed a batch of location lookups. Each pair
    /// runs through the downloader; whatever it confirms is persisted,
    /// delivered to waiters and announced. Finally the store gets its
    /// async-work credit back.
    pub fn handle_block_ready(
        &mut self,
        blocks: &[(BlockHash, BlockLocation)],
    ) -> Result<Vec<Outbound>> {
        if self.state != Lifecycle::Running {
            debug!("dropping block-ready while not running");
            return Ok(Vec::new());
        }
        let store = self.store()?;

        let mut batch = NotificationBatch::new();
        let mut outbound = Vec::new();
        for (hash, location) in blocks {
            let confirmed = self.downloader.receive_block(*hash, *location, None);
            self.process_confirmed(&store, confirmed, &mut batch, &mut outbound);
        }
        outbound.extend(Self::replies(&mut batch));
        store.finish_work();
        Ok(outbound)
    }

    /// Hand raw block bytes to the store for async validation and storage.
    /// No immediate reply - completion arrives later as block-ready.
    pub fn handle_submit_block(&mut self, raw: Vec<u8>) -> Result<()> {
        if self.state != Lifecycle::Running {
            debug!("dropping submitted block while not running");
            return Ok(());
        }
        self.store()?.receive(raw)
    }

    /// Broadcast the current tip on both the external and the internal
    /// progress channels
    pub fn report(&self) -> Vec<Outbound> {
        if self.state != Lifecycle::Running {
            return Vec::new();
        }
        let position = self.downloader.tip();
        vec![
            Outbound::TipUpdate(position),
            Outbound::Progress {
                chain: self.chain.clone(),
                position,
            },
        ]
    }

    /// One work cycle: pull the next batch of needed hashes from the
    /// header chain, look them up in the store, and feed whatever is
    /// already materialized through the downloader. Errors are transient -
    /// the caller logs them and retries on the next tick.
    pub fn work(&mut self) -> Result<WorkOutcome> {
        if self.state != Lifecycle::Running {
            return Ok(WorkOutcome::default());
        }
        let store = self.store()?;
        if !store.download_blocks() {
            return Ok(WorkOutcome::default());
        }
        let headers = self.headers()?;
        self.queue_blocks(&store, headers.as_ref())
    }

    fn queue_blocks(
        &mut self,
        store: &SharedStore,
        chain: &dyn HeaderChain,
    ) -> Result<WorkOutcome> {
        let plan = self.downloader.add_blocks(chain)?;
        if plan.hashes.is_empty() {
            self.downloader.update();
            return Ok(WorkOutcome {
                more: plan.more,
                outbound: Vec::new(),
            });
        }
        debug!(
            start = plan.start_height,
            count = plan.hashes.len(),
            more = plan.more,
            "queueing blocks"
        );
        let locations = store.get_blocks(&plan.hashes)?;

        let mut batch = NotificationBatch::new();
        let mut outbound = Vec::new();
        for (offset, (hash, location)) in plan.hashes.iter().zip(locations.iter()).enumerate() {
            if !location.is_valid() {
                continue;
            }
            let height = plan.start_height + offset as u64;
            let confirmed = self.downloader.receive_block(*hash, *location, Some(height));
            self.process_confirmed(store, confirmed, &mut batch, &mut outbound);
        }
        outbound.extend(Self::replies(&mut batch));
        self.downloader.update();

        Ok(WorkOutcome {
            more: plan.more,
            outbound,
        })
    }

    /// Release collaborator handles and stop. Later events are dropped.
    pub fn shutdown(&mut self) {
        info!(chain = %self.chain, "block oracle shutting down");
        self.state = Lifecycle::ShuttingDown;
        self.store = None;
        self.headers = None;
        self.state = Lifecycle::Terminated;
    }

    fn process_confirmed(
        &mut self,
        store: &SharedStore,
        confirmed: Vec<(Position, BlockLocation)>,
        batch: &mut NotificationBatch,
        outbound: &mut Vec<Outbound>,
    ) {
        for (position, location) in confirmed {
            // The in-memory tip and the persisted tip must never diverge -
            // a store that refuses the update leaves nothing safe to do
            if let Err(e) = store.set_tip(position) {
                panic!("block store rejected tip update at {position}: {e}");
            }
            self.multiplexer.notify_one(position.hash, location, batch);
            outbound.push(Outbound::TipUpdate(position));
            outbound.push(Outbound::Progress {
                chain: self.chain.clone(),
                position,
            });
        }
    }

    fn replies(batch: &mut NotificationBatch) -> Vec<Outbound> {
        batch
            .drain()
            .into_iter()
            .map(|(requestor, blocks)| Outbound::Reply { requestor, blocks })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header_chain::MemoryHeaderChain;
    use crate::store::{BlockStore, MemoryBlockStore};
    use anyhow::bail;
    use obelisk_common::BlockHandle;

    struct FailingChain;
    impl HeaderChain for FailingChain {
        fn best(&self) -> Result<Position> {
            bail!("header oracle unavailable");
        }
        fn hashes_in_range(&self, _start: u64, _count: usize) -> Result<Vec<BlockHash>> {
            bail!("header oracle unavailable");
        }
    }

    // Locates everything but refuses to persist the tip
    struct RejectingTipStore;
    impl BlockStore for RejectingTipStore {
        fn get_blocks(&self, hashes: &[BlockHash]) -> Result<Vec<BlockLocation>> {
            Ok(hashes
                .iter()
                .map(|_| BlockLocation::Valid(BlockHandle(0)))
                .collect())
        }
        fn receive(&self, _raw: Vec<u8>) -> Result<()> {
            Ok(())
        }
        fn set_tip(&self, _position: Position) -> Result<()> {
            bail!("store out of space");
        }
        fn tip(&self) -> Result<Position> {
            Ok(Position::default())
        }
    }

    struct Fixture {
        oracle: Oracle,
        store: Arc<MemoryBlockStore>,
        headers: Arc<MemoryHeaderChain>,
    }

    fn fixture(download_blocks: bool) -> Fixture {
        let store = Arc::new(MemoryBlockStore::new());
        let headers = Arc::new(MemoryHeaderChain::new());
        let shared = Arc::new(SharedStore::new(store.clone(), download_blocks));
        let oracle = Oracle::new("main", shared, headers.clone(), 500);
        Fixture {
            oracle,
            store,
            headers,
        }
    }

    fn raw_block(height: u64) -> Vec<u8> {
        format!("block at height {height}").into_bytes()
    }

    fn tip_heights(outbound: &[Outbound]) -> Vec<u64> {
        outbound
            .iter()
            .filter_map(|o| match o {
                Outbound::TipUpdate(p) => Some(p.height),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn end_to_end_request_then_download() {
        let mut f = fixture(true);

        // Persisted tip at height 100
        let tip = Position::new(100, BlockHash::digest(b"block 100"));
        f.store.set_tip(tip).unwrap();
        assert!(f.oracle.start().unwrap().is_empty());
        assert_eq!(f.oracle.tip(), tip);

        // Header chain announces three more blocks
        let raws: Vec<Vec<u8>> = (101..=103).map(raw_block).collect();
        let hashes: Vec<BlockHash> = raws.iter().map(|r| BlockHash::digest(r)).collect();
        for (offset, hash) in hashes.iter().enumerate() {
            f.headers.announce(101 + offset as u64, *hash);
        }

        // A requestor asks for 101 and 103 before anything is downloaded
        let r1 = RequestorId::new("wallet.replies");
        let outbound =
            f.oracle.handle_request_blocks(&r1, &[hashes[0], hashes[2]]).unwrap();
        assert!(outbound.is_empty());
        assert_eq!(f.oracle.pending_requests(), 2);

        // Blocks arrive in storage, then one work tick resolves everything
        for raw in raws {
            f.store.receive(raw).unwrap();
        }
        let outcome = f.oracle.work().unwrap();
        assert!(!outcome.more);

        assert_eq!(f.oracle.tip().height, 103);
        assert_eq!(f.oracle.tip().hash, hashes[2]);
        assert_eq!(tip_heights(&outcome.outbound), vec![101, 102, 103]);
        let progress: Vec<&Outbound> = outcome
            .outbound
            .iter()
            .filter(|o| matches!(o, Outbound::Progress { chain, .. } if chain == "main"))
            .collect();
        assert_eq!(progress.len(), 3);

        let replies: Vec<&Outbound> = outcome
            .outbound
            .iter()
            .filter(|o| matches!(o, Outbound::Reply { .. }))
            .collect();
        assert_eq!(replies.len(), 1);
        let Outbound::Reply { requestor, blocks } = replies[0] else {
            unreachable!();
        };
        assert_eq!(*requestor, r1);
        let replied: Vec<BlockHash> = blocks.iter().map(|(h, _)| *h).collect();
        assert_eq!(replied, vec![hashes[0], hashes[2]]);
        assert!(blocks.iter().all(|(_, l)| l.is_valid()));

        assert_eq!(f.oracle.pending_requests(), 0);
        assert_eq!(f.store.tip().unwrap().height, 103);
    }

    #[test]
    fn request_for_stored_block_replies_immediately() {
        let mut f = fixture(true);
        f.oracle.start().unwrap();

        let raw = raw_block(1);
        let hash = BlockHash::digest(&raw);
        f.store.receive(raw).unwrap();

        let r1 = RequestorId::new("wallet.replies");
        let outbound = f.oracle.handle_request_blocks(&r1, &[hash]).unwrap();
        assert_eq!(outbound.len(), 1);
        assert!(matches!(&outbound[0],
            Outbound::Reply { requestor, blocks }
                if *requestor == r1 && blocks.len() == 1));
        assert_eq!(f.oracle.pending_requests(), 0);
    }

    #[test]
    fn header_failure_is_transient() {
        let mut f = fixture(true);
        let tip = Position::new(50, BlockHash::digest(b"block 50"));
        f.store.set_tip(tip).unwrap();
        f.oracle.start().unwrap();

        let r1 = RequestorId::new("wallet.replies");
        f.oracle.handle_request_blocks(&r1, &[BlockHash::digest(b"wanted")]).unwrap();
        assert_eq!(f.oracle.pending_requests(), 1);

        // Swap in a failing header chain and run a cycle
        f.oracle.headers = Some(Arc::new(FailingChain));
        assert!(f.oracle.work().is_err());

        // Nothing moved - retry happens on the next tick
        assert_eq!(f.oracle.tip(), tip);
        assert_eq!(f.oracle.pending_requests(), 1);
    }

    #[test]
    fn block_ready_confirms_in_flight_blocks() {
        let mut f = fixture(true);
        let tip = Position::new(10, BlockHash::digest(b"block 10"));
        f.store.set_tip(tip).unwrap();
        f.oracle.start().unwrap();

        // Headers known but bodies not yet stored - work queues them
        let raws: Vec<Vec<u8>> = (11..=12).map(raw_block).collect();
        let hashes: Vec<BlockHash> = raws.iter().map(|r| BlockHash::digest(r)).collect();
        f.headers.announce(11, hashes[0]);
        f.headers.announce(12, hashes[1]);
        let outcome = f.oracle.work().unwrap();
        assert!(outcome.outbound.is_empty());
        assert_eq!(f.oracle.tip(), tip);

        // Storage completes the lookups asynchronously
        for raw in raws {
            f.store.receive(raw).unwrap();
        }
        let locations = f.store.get_blocks(&hashes).unwrap();
        let pairs: Vec<(BlockHash, BlockLocation)> =
            hashes.iter().copied().zip(locations).collect();
        let outbound = f.oracle.handle_block_ready(&pairs).unwrap();

        assert_eq!(f.oracle.tip().height, 12);
        assert_eq!(tip_heights(&outbound), vec![11, 12]);
        assert_eq!(f.store.finished_work(), 1);
    }

    #[test]
    #[should_panic(expected = "rejected tip update")]
    fn store_refusing_confirmed_tip_aborts() {
        let shared = Arc::new(SharedStore::new(Arc::new(RejectingTipStore), true));
        let headers = Arc::new(MemoryHeaderChain::new());
        let mut oracle = Oracle::new("main", shared, headers.clone(), 500);
        oracle.start().unwrap();

        // The lookup confirms the block but persisting the tip fails -
        // the in-memory and persisted tips would diverge, so no recovery
        headers.announce(1, BlockHash::digest(b"block 1"));
        let _ = oracle.work();
    }

    #[test]
    fn report_broadcasts_tip_on_both_channels() {
        let mut f = fixture(true);
        let tip = Position::new(7, BlockHash::digest(b"block 7"));
        f.store.set_tip(tip).unwrap();
        f.oracle.start().unwrap();

        let outbound = f.oracle.report();
        assert_eq!(outbound.len(), 2);
        assert_eq!(outbound[0], Outbound::TipUpdate(tip));
        assert_eq!(
            outbound[1],
            Outbound::Progress {
                chain: "main".into(),
                position: tip
            }
        );
    }

    #[test]
    fn downloads_disabled_stays_idle() {
        let mut f = fixture(false);
        f.headers.announce(1, BlockHash::digest(b"header 1"));

        assert!(f.oracle.start().unwrap().is_empty());
        let outcome = f.oracle.work().unwrap();
        assert!(!outcome.more);
        assert!(outcome.outbound.is_empty());
        assert_eq!(f.oracle.tip(), Position::default());
    }

    #[test]
    fn shutdown_releases_collaborators_and_drops_events() {
        let mut f = fixture(true);
        f.oracle.start().unwrap();
        f.oracle.shutdown();
        assert_eq!(f.oracle.state(), Lifecycle::Terminated);

        let r1 = RequestorId::new("wallet.replies");
        let outbound =
            f.oracle.handle_request_blocks(&r1, &[BlockHash::digest(b"late")]).unwrap();
        assert!(outbound.is_empty());
        assert_eq!(f.oracle.pending_requests(), 0);
        assert!(f.oracle.handle_submit_block(b"late block".to_vec()).is_ok());
        assert!(!f.oracle.work().unwrap().more);
    }
}
