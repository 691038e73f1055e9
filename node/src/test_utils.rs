use crate::chain::{Block, ChainError, ChainStore, MemoryChain, Receipts, SealedHeader};
use crate::cli::{SyncConfig, SyncMode};
use crate::p2p::{PeerId, PeerSet};
use crate::sim::SimStateSyncer;
use crate::state::StateSyncer;
use crate::sync::{Downloader, Queue, SyncContext, SyncStats};
use alloy_primitives::{B256, U256};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type DropLog = Arc<Mutex<Vec<PeerId>>>;

/// Millisecond-scale timings so runs finish quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        request_timeout_ms: 500,
        target_rtt_ms: 100,
        header_cont_check_ms: 20,
        backpressure_check_ms: 10,
        state_sync_check_ms: 20,
        fetch_check_interval_ms: 5,
        progress_log_interval_secs: 0,
        ..SyncConfig::default()
    }
}

pub fn peer_id(n: u8) -> PeerId {
    PeerId::repeat_byte(n)
}

pub fn run_context(mode: SyncMode, chain: Arc<dyn ChainStore>, config: SyncConfig) -> Arc<SyncContext> {
    run_context_with_drops(mode, chain, config).0
}

/// A run context whose dropped peers are recorded in the returned log.
pub fn run_context_with_drops(
    mode: SyncMode,
    chain: Arc<dyn ChainStore>,
    config: SyncConfig,
) -> (Arc<SyncContext>, DropLog) {
    let drops = DropLog::default();
    let log = drops.clone();
    let state: Arc<dyn StateSyncer> = Arc::new(SimStateSyncer::new(Duration::ZERO));
    let ctx = SyncContext {
        mode,
        chain,
        peers: Arc::new(PeerSet::new()),
        queue: Arc::new(Queue::new(config.result_cache_limit)),
        state,
        stats: Arc::new(SyncStats::new()),
        config,
        cancel: CancellationToken::new(),
        quit: CancellationToken::new(),
        pivot: Default::default(),
        committed: AtomicBool::new(true),
        ancient_limit: AtomicU64::new(0),
        on_drop: Arc::new(move |id: PeerId| log.lock().push(id)),
    };
    (Arc::new(ctx), drops)
}

pub fn downloader(chain: Arc<dyn ChainStore>, state: Arc<SimStateSyncer>) -> (Downloader, DropLog) {
    let drops = DropLog::default();
    let log = drops.clone();
    let downloader = Downloader::new(chain, state, fast_config(), move |id: PeerId| {
        log.lock().push(id)
    });
    (downloader, drops)
}

/// Chain store that loses local headers, as a concurrent rewind would.
///
/// Lost headers cannot be looked up by hash, and receipt batches built on
/// them are refused.
pub struct LossyChain {
    inner: Arc<MemoryChain>,
    lost: Mutex<HashSet<B256>>,
}

impl LossyChain {
    pub fn new(inner: Arc<MemoryChain>) -> Self {
        Self {
            inner,
            lost: Mutex::default(),
        }
    }

    pub fn lose(&self, hash: B256) {
        self.lost.lock().insert(hash);
    }
}

impl ChainStore for LossyChain {
    fn has_header(&self, hash: B256, number: u64) -> bool {
        self.inner.has_header(hash, number)
    }

    fn has_block(&self, hash: B256, number: u64) -> bool {
        self.inner.has_block(hash, number)
    }

    fn has_fast_block(&self, hash: B256, number: u64) -> bool {
        self.inner.has_fast_block(hash, number)
    }

    fn header_by_hash(&self, hash: B256) -> Option<SealedHeader> {
        if self.lost.lock().contains(&hash) {
            return None;
        }
        self.inner.header_by_hash(hash)
    }

    fn block_by_hash(&self, hash: B256) -> Option<Block> {
        self.inner.block_by_hash(hash)
    }

    fn td(&self, hash: B256, number: u64) -> Option<U256> {
        self.inner.td(hash, number)
    }

    fn current_header(&self) -> SealedHeader {
        self.inner.current_header()
    }

    fn current_block(&self) -> SealedHeader {
        self.inner.current_block()
    }

    fn current_snap_block(&self) -> SealedHeader {
        self.inner.current_snap_block()
    }

    fn insert_header_chain(&self, headers: &[SealedHeader]) -> Result<(), ChainError> {
        self.inner.insert_header_chain(headers)
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), ChainError> {
        self.inner.insert_chain(blocks)
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Receipts>,
        ancient_limit: u64,
    ) -> Result<(), ChainError> {
        let lost = self.lost.lock();
        if let Some(block) = blocks.iter().find(|b| lost.contains(&b.header.parent_hash)) {
            return Err(ChainError::HeaderNotFound {
                hash: block.header.parent_hash,
            });
        }
        drop(lost);
        self.inner.insert_receipt_chain(blocks, receipts, ancient_limit)
    }

    fn set_head(&self, number: u64) -> Result<(), ChainError> {
        self.inner.set_head(number)
    }

    fn snap_sync_commit_head(&self, hash: B256) -> Result<(), ChainError> {
        self.inner.snap_sync_commit_head(hash)
    }

    fn ancient_tail(&self) -> Result<u64, ChainError> {
        self.inner.ancient_tail()
    }

    fn ancients(&self) -> Result<u64, ChainError> {
        self.inner.ancients()
    }

    fn ancient_items(&self) -> Result<u64, ChainError> {
        self.inner.ancient_items()
    }

    fn pause_snapshots(&self) {
        self.inner.pause_snapshots()
    }

    fn resume_snapshots(&self) {
        self.inner.resume_snapshots()
    }

    fn write_last_pivot_number(&self, number: u64) {
        self.inner.write_last_pivot_number(number)
    }

    fn last_pivot_number(&self) -> Option<u64> {
        self.inner.last_pivot_number()
    }
}
