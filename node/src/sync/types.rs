//! Shared sync types.

use super::error::SyncError;
use crate::chain::{Block, Body, Receipts, SealedHeader};
use crate::cli::SyncMode;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::time::Instant;

/// Headers per skeleton segment and per direct header request.
pub const MAX_HEADER_FETCH: usize = 192;
pub const MAX_SKELETON_SIZE: usize = 128;
pub const MAX_BLOCK_FETCH: usize = 128;
pub const MAX_RECEIPT_FETCH: usize = 256;
/// Trie nodes per state request.
pub const MAX_STATE_FETCH: usize = 384;
/// Headers handed to the chain and scheduler per chunk.
pub const MAX_HEADERS_PROCESS: usize = 2048;
/// Content results handed to the importer per batch.
pub const MAX_RESULTS_PROCESS: usize = 2048;
/// Scheduler depth at which the header processor stops feeding it.
pub const MAX_QUEUED_HEADERS: usize = 32 * 1024;
/// Headers held back from the tip to avoid importing shallow reorgs.
pub const REORG_PROT_THRESHOLD: u64 = 48;
/// Headers withheld from the last delivered batch.
pub const REORG_PROT_HEADER_DELAY: u64 = 2;
/// Blocks above the pivot that are fully imported in snap mode.
pub const FS_MIN_FULL_BLOCKS: u64 = 64;
/// Minimum eth protocol version accepted for syncing.
pub const MIN_PROTOCOL_VERSION: u32 = 66;
/// Depth below the remote head past which snap-synced blocks go to the ancient store.
pub const FULL_MAX_FORK_ANCESTRY: u64 = 90_000;

/// Kind of data a fetcher downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Headers,
    Bodies,
    Receipts,
}

impl Category {
    pub const ALL: [Self; 3] = [Self::Headers, Self::Bodies, Self::Receipts];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::Bodies => "bodies",
            Self::Receipts => "receipts",
        }
    }

    /// Upper bound on items per request.
    pub fn max_fetch(self) -> usize {
        match self {
            Self::Headers => MAX_HEADER_FETCH,
            Self::Bodies => MAX_BLOCK_FETCH,
            Self::Receipts => MAX_RECEIPT_FETCH,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Headers => 0,
            Self::Bodies => 1,
            Self::Receipts => 2,
        }
    }
}

/// Headers scheduled for content retrieval, contiguous by number.
pub type HeaderBatch = Vec<SealedHeader>;

/// Assembly slot for one block: the header plus whatever content it still needs.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub header: SealedHeader,
    pub body: Option<Body>,
    pub receipts: Option<Receipts>,
    pending_body: bool,
    pending_receipts: bool,
}

impl FetchResult {
    pub fn new(header: SealedHeader, mode: SyncMode) -> Self {
        let pending_body = !header.has_empty_body();
        let pending_receipts = mode == SyncMode::Snap && !header.has_empty_receipts();
        Self {
            header,
            body: None,
            receipts: None,
            pending_body,
            pending_receipts,
        }
    }

    pub fn needs(&self, category: Category) -> bool {
        match category {
            Category::Headers => false,
            Category::Bodies => self.pending_body,
            Category::Receipts => self.pending_receipts,
        }
    }

    pub(crate) fn set_body(&mut self, body: Body) {
        self.body = Some(body);
        self.pending_body = false;
    }

    pub(crate) fn set_receipts(&mut self, receipts: Receipts) {
        self.receipts = Some(receipts);
        self.pending_receipts = false;
    }

    pub fn is_complete(&self) -> bool {
        !self.pending_body && !self.pending_receipts
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn into_block(self) -> Block {
        Block {
            header: self.header,
            body: self.body.unwrap_or_default(),
        }
    }

    pub fn into_parts(self) -> (Block, Receipts) {
        let receipts = self.receipts.clone().unwrap_or_default();
        (self.into_block(), receipts)
    }
}

/// Broadcast lifecycle notifications.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    Done { head: SealedHeader },
    Failed { error: SyncError },
}

/// Snapshot of download progress.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncProgress {
    pub mode: SyncMode,
    pub starting_block: u64,
    pub current_block: u64,
    pub highest_block: u64,
    pub pivot_block: u64,
    pub synced_accounts: u64,
    pub synced_account_bytes: u64,
    pub synced_bytecodes: u64,
    pub synced_bytecode_bytes: u64,
    pub synced_storage: u64,
    pub synced_storage_bytes: u64,
    pub healed_trienodes: u64,
    pub healed_trienode_bytes: u64,
    pub healed_bytecodes: u64,
    pub healed_bytecode_bytes: u64,
    pub healing_trienodes: u64,
    pub healing_bytecode: u64,
}

#[derive(Debug, Default)]
struct ReportClock {
    started: Option<Instant>,
    last_log: Option<Instant>,
}

/// Progress counters shared between the downloader and its run tasks.
#[derive(Debug, Default)]
pub struct SyncStats {
    /// Chain origin and target height of the current sync cycle.
    bounds: RwLock<(u64, u64)>,
    clock: Mutex<ReportClock>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the origin and target height of a run.
    ///
    /// The origin is kept across runs unless the previous target was reached
    /// or the new ancestor lies below it.
    pub fn update_bounds(&self, origin: u64, height: u64) {
        let mut bounds = self.bounds.write();
        if bounds.1 <= origin || bounds.0 > origin {
            bounds.0 = origin;
        }
        bounds.1 = height;
    }

    /// Raises the target height if headers arrived past it.
    pub fn raise_height(&self, height: u64) {
        let mut bounds = self.bounds.write();
        if bounds.1 < height {
            bounds.1 = height;
        }
    }

    pub fn origin(&self) -> u64 {
        self.bounds.read().0
    }

    pub fn height(&self) -> u64 {
        self.bounds.read().1
    }

    /// Returns the elapsed time since the first report if a log line is due.
    pub(crate) fn report_due(
        &self,
        force: bool,
        interval: std::time::Duration,
    ) -> Option<std::time::Duration> {
        let mut clock = self.clock.lock();
        let now = Instant::now();
        let started = *clock.started.get_or_insert(now);
        if let Some(last) = clock.last_log {
            if !force && now.duration_since(last) < interval {
                return None;
            }
        }
        clock.last_log = Some(now);
        Some(now.duration_since(started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Header, EMPTY_LIST_HASH};
    use alloy_primitives::B256;

    fn header(tx_root: B256, receipt_root: B256) -> SealedHeader {
        Header {
            number: 1,
            tx_root,
            receipt_root,
            ..Header::default()
        }
        .seal_slow()
    }

    #[test]
    fn empty_roots_need_no_fetch() {
        let empty = FetchResult::new(header(EMPTY_LIST_HASH, EMPTY_LIST_HASH), SyncMode::Snap);
        assert!(empty.is_complete());

        let full = FetchResult::new(
            header(B256::repeat_byte(1), B256::repeat_byte(2)),
            SyncMode::Full,
        );
        assert!(full.needs(Category::Bodies));
        assert!(!full.needs(Category::Receipts));

        let snap = FetchResult::new(
            header(EMPTY_LIST_HASH, B256::repeat_byte(2)),
            SyncMode::Snap,
        );
        assert!(!snap.needs(Category::Bodies));
        assert!(snap.needs(Category::Receipts));
    }

    #[test]
    fn stats_keep_origin_across_runs() {
        let stats = SyncStats::new();
        stats.update_bounds(10, 100);
        assert_eq!((stats.origin(), stats.height()), (10, 100));
        // New run from further along keeps the original origin.
        stats.update_bounds(50, 200);
        assert_eq!((stats.origin(), stats.height()), (10, 200));
        stats.raise_height(150);
        assert_eq!(stats.height(), 200);
        stats.raise_height(250);
        assert_eq!(stats.height(), 250);
    }
}
