//! Chain synchronisation against remote peers.
//!
//! A run locates the common ancestor with the chosen peer, then drives five
//! concurrent stages until the local chain reaches the peer's head: the
//! header fetcher, the body and receipt fetchers, the header processor and
//! the content importer (full import or snap commit around a pivot).

mod ancestor;
mod error;
mod fetch;
mod headers;
mod import;
mod pivot;
mod queue;
mod types;

pub use ancestor::{calculate_request_span, RequestSpan};
pub use error::{ErrorClass, SyncError};
pub use queue::{Queue, Reservation};
pub use types::{
    Category, FetchResult, HeaderBatch, SyncEvent, SyncProgress, SyncStats, FS_MIN_FULL_BLOCKS,
    FULL_MAX_FORK_ANCESTRY, MAX_BLOCK_FETCH, MAX_HEADERS_PROCESS, MAX_HEADER_FETCH,
    MAX_QUEUED_HEADERS, MAX_RECEIPT_FETCH, MAX_RESULTS_PROCESS, MAX_SKELETON_SIZE,
    MAX_STATE_FETCH, MIN_PROTOCOL_VERSION, REORG_PROT_HEADER_DELAY, REORG_PROT_THRESHOLD,
};

pub use crate::cli::SyncMode;

use crate::chain::ChainStore;
use crate::cli::SyncConfig;
use crate::p2p::{PeerConnection, PeerId, PeerSet, SyncPeer};
use crate::state::{SnapPacket, StateSyncer};
use alloy_primitives::{B256, U256};
use headers::ContentWakers;
use parking_lot::{Mutex, RwLock};
use pivot::PivotCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Callback asked to disconnect a misbehaving peer.
pub type DropPeerFn = Arc<dyn Fn(PeerId) + Send + Sync>;

/// Removes a peer from the registry, returns its work to the queue and
/// reports it. Peers that already left are not reported again.
fn drop_registered(peers: &PeerSet, queue: &Queue, on_drop: &DropPeerFn, id: PeerId) {
    if peers.unregister(&id).is_ok() {
        queue.revoke(&id);
        on_drop(id);
    }
}

/// State shared by the tasks of a single sync run.
pub(crate) struct SyncContext {
    pub(crate) mode: SyncMode,
    pub(crate) chain: Arc<dyn ChainStore>,
    pub(crate) peers: Arc<PeerSet>,
    pub(crate) queue: Arc<Queue>,
    pub(crate) state: Arc<dyn StateSyncer>,
    pub(crate) config: SyncConfig,
    pub(crate) stats: Arc<SyncStats>,
    /// Fires when the run must stop.
    pub(crate) cancel: CancellationToken,
    /// Fires when the downloader is terminated for good.
    pub(crate) quit: CancellationToken,
    pub(crate) pivot: PivotCell,
    pub(crate) committed: AtomicBool,
    pub(crate) ancient_limit: AtomicU64,
    pub(crate) on_drop: DropPeerFn,
}

impl SyncContext {
    /// Whether the snap pivot has been committed (always true in full sync).
    pub(crate) fn committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn ancient_limit(&self) -> u64 {
        self.ancient_limit.load(Ordering::Acquire)
    }

    pub(crate) fn drop_peer(&self, id: PeerId) {
        drop_registered(&self.peers, &self.queue, &self.on_drop, id);
    }

    /// Sleeps unless the run is cancelled first.
    pub(crate) async fn pause(&self, duration: Duration) -> Result<(), SyncError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(SyncError::Canceled),
        }
    }
}

struct ActiveRun {
    peer: PeerId,
    cancel: CancellationToken,
}

/// Marks the downloader busy for the lifetime of a run.
struct RunGuard<'a> {
    downloader: &'a Downloader,
}

impl<'a> RunGuard<'a> {
    fn acquire(downloader: &'a Downloader) -> Option<Self> {
        downloader
            .synchronising
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { downloader })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.downloader.active.lock().take() {
            active.cancel.cancel();
        }
        self.downloader.synchronising.store(false, Ordering::Release);
    }
}

type TaskOutcome = (&'static str, Result<(), SyncError>);

/// Synchronises the local chain with the best advertised remote chain.
pub struct Downloader {
    chain: Arc<dyn ChainStore>,
    state: Arc<dyn StateSyncer>,
    peers: Arc<PeerSet>,
    queue: Arc<Queue>,
    stats: Arc<SyncStats>,
    config: SyncConfig,
    on_drop: DropPeerFn,
    mode: RwLock<SyncMode>,
    synchronising: AtomicBool,
    notified: AtomicBool,
    active: Mutex<Option<ActiveRun>>,
    /// Held for the duration of a run so `cancel` can wait for it to exit.
    running: tokio::sync::Mutex<()>,
    quit: CancellationToken,
    events: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("mode", &*self.mode.read())
            .field("peers", &self.peers.len())
            .field("synchronising", &self.is_synchronising())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub fn new<F>(
        chain: Arc<dyn ChainStore>,
        state: Arc<dyn StateSyncer>,
        config: SyncConfig,
        on_drop: F,
    ) -> Self
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(64);
        Self {
            queue: Arc::new(Queue::new(config.result_cache_limit)),
            chain,
            state,
            peers: Arc::new(PeerSet::new()),
            stats: Arc::new(SyncStats::new()),
            config,
            on_drop: Arc::new(on_drop),
            mode: RwLock::new(SyncMode::Full),
            synchronising: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            active: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
            quit: CancellationToken::new(),
            events,
        }
    }

    /// Adds a peer to the set used for fetching.
    pub fn register_peer(
        &self,
        id: PeerId,
        version: u32,
        peer: Arc<dyn SyncPeer>,
    ) -> Result<(), SyncError> {
        trace!(peer_id = %id, version, "registering sync peer");
        self.peers
            .register(PeerConnection::new(id, version, peer))
            .inspect_err(|err| error!(peer_id = %id, error = %err, "failed to register sync peer"))
    }

    /// Removes a peer and returns its pending work to the queue. Losing the
    /// peer a run is anchored on cancels that run.
    pub fn unregister_peer(&self, id: &PeerId) -> Result<(), SyncError> {
        trace!(peer_id = %id, "unregistering sync peer");
        if let Err(err) = self.peers.unregister(id) {
            error!(peer_id = %id, error = %err, "failed to unregister sync peer");
            return Err(err);
        }
        self.queue.revoke(id);
        if let Some(active) = self.active.lock().as_ref() {
            if active.peer == *id {
                debug!(peer_id = %id, "master peer left, cancelling sync");
                active.cancel.cancel();
            }
        }
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_synchronising(&self) -> bool {
        self.synchronising.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Syncs with `id` and drops the peer when the failure is its fault.
    pub async fn synchronise(
        &self,
        id: PeerId,
        head: B256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        let result = self.sync(id, head, td, mode).await;
        if let Err(err) = &result {
            match err.class() {
                ErrorClass::Benign => {}
                ErrorClass::PeerFault => {
                    warn!(peer_id = %id, td = %td, error = %err, "synchronisation failed, dropping peer");
                    drop_registered(&self.peers, &self.queue, &self.on_drop, id);
                }
                ErrorClass::Fatal => {
                    if matches!(err, SyncError::HeaderNotFound(_)) {
                        info!(peer_id = %id, "skipping drop peer due to header not found");
                    }
                    warn!(peer_id = %id, error = %err, "synchronisation failed, retrying");
                }
            }
        }
        result
    }

    async fn sync(
        &self,
        id: PeerId,
        head: B256,
        td: U256,
        mode: SyncMode,
    ) -> Result<(), SyncError> {
        if self.quit.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let Some(_guard) = RunGuard::acquire(self) else {
            return Err(SyncError::Busy);
        };
        let _running = self.running.lock().await;

        if self
            .notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("block synchronisation started");
        }
        if mode == SyncMode::Snap {
            self.chain.pause_snapshots();
        }
        self.queue.reset();
        self.peers.reset();

        let cancel = self.quit.child_token();
        *self.active.lock() = Some(ActiveRun {
            peer: id,
            cancel: cancel.clone(),
        });
        *self.mode.write() = mode;

        let Some(peer) = self.peers.peer(&id) else {
            return Err(SyncError::UnknownPeer);
        };
        let ctx = Arc::new(SyncContext {
            mode,
            chain: self.chain.clone(),
            peers: self.peers.clone(),
            queue: self.queue.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
            cancel,
            quit: self.quit.clone(),
            pivot: PivotCell::default(),
            committed: AtomicBool::new(true),
            ancient_limit: AtomicU64::new(0),
            on_drop: self.on_drop.clone(),
        });
        self.sync_with_peer(ctx, peer, head, td).await
    }

    async fn sync_with_peer(
        &self,
        ctx: Arc<SyncContext>,
        peer: Arc<PeerConnection>,
        head: B256,
        td: U256,
    ) -> Result<(), SyncError> {
        let _ = self.events.send(SyncEvent::Started);
        debug!(
            peer_id = %peer.id(),
            eth = peer.version(),
            head = %head,
            td = %td,
            mode = %ctx.mode,
            "synchronising with the network"
        );
        let started = Instant::now();
        let result = run_sync(&ctx, &peer, td).await;
        debug!(elapsed = ?started.elapsed(), "synchronisation terminated");

        let event = match &result {
            Ok(()) => SyncEvent::Done {
                head: self.chain.current_header(),
            },
            Err(err) => SyncEvent::Failed { error: err.clone() },
        };
        let _ = self.events.send(event);
        result
    }

    /// Cancels the active run and waits for all of its tasks to exit.
    pub async fn cancel(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            active.cancel.cancel();
        }
        drop(self.running.lock().await);
    }

    /// Cancels any run and refuses all future ones.
    pub async fn terminate(&self) {
        self.quit.cancel();
        self.cancel().await;
    }

    /// Progress of the current or last sync cycle.
    pub fn progress(&self) -> SyncProgress {
        let mode = *self.mode.read();
        let current = match mode {
            SyncMode::Full => self.chain.current_block().number,
            SyncMode::Snap => self.chain.current_snap_block().number,
        };
        let state = self.state.progress();
        SyncProgress {
            mode,
            starting_block: self.stats.origin(),
            current_block: current,
            highest_block: self.stats.height(),
            pivot_block: self.chain.last_pivot_number().unwrap_or_default(),
            synced_accounts: state.accounts_synced,
            synced_account_bytes: state.accounts_bytes,
            synced_bytecodes: state.bytecodes_synced,
            synced_bytecode_bytes: state.bytecodes_bytes,
            synced_storage: state.storage_synced,
            synced_storage_bytes: state.storage_bytes,
            healed_trienodes: state.trienode_heal_synced,
            healed_trienode_bytes: state.trienode_heal_bytes,
            healed_bytecodes: state.bytecode_heal_synced,
            healed_bytecode_bytes: state.bytecode_heal_bytes,
            healing_trienodes: state.trienodes_pending,
            healing_bytecode: state.bytecodes_pending,
        }
    }

    /// Hands a snap protocol response to the state downloader.
    pub fn deliver_snap_packet(&self, peer: PeerId, packet: SnapPacket) -> Result<(), SyncError> {
        let (kind, id) = (packet.kind(), packet.id());
        packet.deliver(self.state.as_ref(), peer).map_err(|err| {
            debug!(peer_id = %peer, kind, id, error = %err, "failed to deliver snap packet");
            SyncError::from(err)
        })
    }
}

/// Resolves the sync boundaries with `peer` and runs the stage tasks.
async fn run_sync(
    ctx: &Arc<SyncContext>,
    peer: &Arc<PeerConnection>,
    td: U256,
) -> Result<(), SyncError> {
    let mode = ctx.mode;
    let (remote, pivot) = headers::fetch_head(ctx, peer).await?;
    // Below FS_MIN_FULL_BLOCKS there is no pivot; keep the local head in its place.
    let pivot = match (mode, pivot) {
        (SyncMode::Snap, None) => Some(ctx.chain.current_block()),
        (_, pivot) => pivot,
    };

    let remote_height = remote.number;
    let local_height = match mode {
        SyncMode::Full => ctx.chain.current_block().number,
        SyncMode::Snap => ctx.chain.current_snap_block().number,
    };
    let mut origin = ancestor::find_ancestor(ctx, peer, local_height, &remote).await?;

    if local_height >= remote_height && ctx.chain.block_by_hash(remote.hash).is_some() {
        warn!(peer_id = %peer.id(), local = local_height, remote = remote_height, mode = %mode, "peer is lagging behind");
        peer.peer().mark_lagging();
        return Err(SyncError::LaggingPeer);
    }
    debug!(peer_id = %peer.id(), local = local_height, remote = remote_height, "try sync chain from peer");
    ctx.stats.update_bounds(origin, remote_height);

    let mut committed = true;
    if mode == SyncMode::Snap {
        if let Some(pivot) = &pivot {
            if remote_height <= FS_MIN_FULL_BLOCKS {
                origin = 0;
            } else {
                if pivot.number <= origin {
                    origin = pivot.number.saturating_sub(1);
                }
                ctx.chain.write_last_pivot_number(pivot.number);
            }
            committed = pivot.number == 0;
        }
        prepare_ancient_limit(ctx, origin, remote_height)?;
    }
    ctx.committed.store(committed, Ordering::Release);
    if mode == SyncMode::Snap && committed {
        ctx.chain.resume_snapshots();
    }
    if let Some(pivot) = pivot {
        ctx.pivot.advance(pivot);
    }
    ctx.queue.prepare(origin + 1, mode);

    let (header_tx, header_rx) = mpsc::channel(1);
    let (bodies_tx, bodies_rx) = mpsc::channel(1);
    let (receipts_tx, receipts_rx) = mpsc::channel(1);
    let wakers = ContentWakers::new(bodies_tx, receipts_tx);

    let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
    {
        let (ctx, peer, wakers) = (ctx.clone(), peer.clone(), wakers.clone());
        tasks.spawn(async move {
            let result =
                headers::fetch_headers(&ctx, &peer, origin + 1, remote_height, header_tx, wakers)
                    .await;
            ("headers", result)
        });
    }
    {
        let ctx = ctx.clone();
        tasks.spawn(async move { ("bodies", fetch::fetch_bodies(&ctx, bodies_rx).await) });
    }
    {
        let ctx = ctx.clone();
        tasks.spawn(async move { ("receipts", fetch::fetch_receipts(&ctx, receipts_rx).await) });
    }
    {
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let result = headers::process_headers(&ctx, origin + 1, td, header_rx, wakers).await;
            ("processor", result)
        });
    }
    {
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let result = match ctx.mode {
                SyncMode::Full => import::process_full_sync_content(&ctx).await,
                SyncMode::Snap => pivot::process_snap_sync_content(&ctx).await,
            };
            ("content", result)
        });
    }
    spawn_sync(ctx, tasks).await
}

/// Sets the block number at or below which snap-synced data goes straight to
/// the ancient store, and rewinds the chain if the freezer ran past `origin`.
fn prepare_ancient_limit(ctx: &SyncContext, origin: u64, remote_height: u64) -> Result<(), SyncError> {
    let mut limit = remote_height
        .checked_sub(FULL_MAX_FORK_ANCESTRY + 1)
        .unwrap_or_default();
    let frozen = ctx.chain.ancients()?;
    let items = ctx.chain.ancient_items()?;
    if origin >= frozen && items != 0 {
        limit = 0;
        info!(origin, ancient = frozen.saturating_sub(1), "disabling direct-ancient mode");
    } else if limit > 0 {
        debug!(ancient = limit, "enabling direct-ancient mode");
    }
    ctx.ancient_limit.store(limit, Ordering::Release);

    if origin + 1 < frozen {
        ctx.chain.set_head(origin)?;
        info!(oldhead = frozen - 1, newhead = origin, "truncated excess ancient chain segment");
    }
    Ok(())
}

/// Waits for the stage tasks; the first error other than cancellation wins.
/// The queue is closed once all but the last task have exited so the
/// importer can drain it.
async fn spawn_sync(ctx: &SyncContext, mut tasks: JoinSet<TaskOutcome>) -> Result<(), SyncError> {
    let total = tasks.len();
    let mut outcome = Ok(());
    for finished in 0..total {
        if finished + 1 == total {
            ctx.queue.close();
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (task, result) =
            joined.unwrap_or_else(|err| ("task", Err(SyncError::Task(err.to_string()))));
        match result {
            Ok(()) => trace!(task, "sync task finished"),
            Err(err) => {
                debug!(task, error = %err, "sync task failed");
                let canceled = err.is_canceled();
                outcome = Err(err);
                if !canceled {
                    break;
                }
            }
        }
    }
    ctx.queue.close();
    ctx.cancel.cancel();
    while tasks.join_next().await.is_some() {}
    outcome
}
