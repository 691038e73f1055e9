//! Peer capability contract and the sync peer registry.

use crate::chain::{Body, Header, Receipts};
use crate::sync::{Category, SyncError, MIN_PROTOCOL_VERSION};
use alloy_primitives::{B256, B512, U256};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

/// Node identifier of a remote peer.
pub type PeerId = B512;

/// Weight of a new throughput sample in the moving average.
const THROUGHPUT_IMPACT: f64 = 0.1;
/// Throughput multiplier applied after a failed request.
const FAILURE_DECREASE: f64 = 0.5;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Remote endpoint able to serve chain data.
///
/// Replies may be shorter than requested; an empty reply means the peer has
/// nothing at the requested position.
#[async_trait]
pub trait SyncPeer: Send + Sync + 'static {
    /// Advertised head hash and total difficulty.
    fn head(&self) -> (B256, U256);

    async fn request_headers_by_hash(
        &self,
        origin: B256,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<Vec<Header>, RequestError>;

    async fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<Vec<Header>, RequestError>;

    async fn request_bodies(&self, hashes: Vec<B256>) -> Result<Vec<Body>, RequestError>;

    async fn request_receipts(&self, hashes: Vec<B256>) -> Result<Vec<Receipts>, RequestError>;

    /// Flags the peer as behind the local chain.
    fn mark_lagging(&self);
}

/// A registered peer plus the per-category delivery statistics used for sizing
/// reservations.
pub struct PeerConnection {
    id: PeerId,
    version: u32,
    peer: Arc<dyn SyncPeer>,
    throughput: Mutex<[f64; 3]>,
    consecutive_failures: AtomicU32,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("throughput", &*self.throughput.lock())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    pub fn new(id: PeerId, version: u32, peer: Arc<dyn SyncPeer>) -> Self {
        Self {
            id,
            version,
            peer,
            throughput: Mutex::new([0.0; 3]),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn peer(&self) -> &Arc<dyn SyncPeer> {
        &self.peer
    }

    /// Items per second for a category.
    pub fn throughput(&self, category: Category) -> f64 {
        self.throughput.lock()[category.index()]
    }

    /// Items to request so a reply arrives within `target_rtt`.
    pub fn capacity(&self, category: Category, target_rtt: Duration) -> usize {
        let estimate = 1.0 + self.throughput(category) * target_rtt.as_secs_f64();
        (estimate as usize).clamp(1, category.max_fetch())
    }

    /// Folds a delivery into the throughput average and clears the failure streak.
    pub fn record_delivery(&self, category: Category, items: usize, elapsed: Duration) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if items == 0 {
            return;
        }
        let seconds = elapsed.as_secs_f64().max(0.001);
        let measured = items as f64 / seconds;
        let mut throughput = self.throughput.lock();
        let slot = &mut throughput[category.index()];
        *slot = (1.0 - THROUGHPUT_IMPACT) * *slot + THROUGHPUT_IMPACT * measured;
    }

    /// Halves throughput for the category and returns the failure streak.
    pub fn record_failure(&self, category: Category) -> u32 {
        self.throughput.lock()[category.index()] *= FAILURE_DECREASE;
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        *self.throughput.lock() = [0.0; 3];
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

/// Registry of peers usable for syncing.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: PeerConnection) -> Result<(), SyncError> {
        if peer.version() < MIN_PROTOCOL_VERSION {
            return Err(SyncError::TooOld {
                version: peer.version(),
            });
        }
        let mut peers = self.peers.write();
        if peers.contains_key(&peer.id()) {
            return Err(SyncError::AlreadyRegistered);
        }
        peers.insert(peer.id(), Arc::new(peer));
        Ok(())
    }

    pub fn unregister(&self, id: &PeerId) -> Result<Arc<PeerConnection>, SyncError> {
        self.peers.write().remove(id).ok_or(SyncError::NotRegistered)
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    /// Peers ordered by descending throughput for the category.
    pub fn by_throughput(&self, category: Category) -> Vec<Arc<PeerConnection>> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| {
            b.throughput(category)
                .total_cmp(&a.throughput(category))
                .then_with(|| a.id().cmp(&b.id()))
        });
        peers
    }

    /// Forgets delivery statistics gathered in earlier runs.
    pub fn reset(&self) {
        for peer in self.peers.read().values() {
            peer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimChain, SimPeer};

    fn connection(id: u8, version: u32) -> PeerConnection {
        let chain = Arc::new(SimChain::new(4, 1));
        let peer_id = PeerId::repeat_byte(id);
        PeerConnection::new(peer_id, version, Arc::new(SimPeer::new(peer_id, chain)))
    }

    #[test]
    fn capacity_tracks_throughput() {
        let peer = connection(1, 68);
        let rtt = Duration::from_secs(1);
        assert_eq!(peer.capacity(Category::Bodies, rtt), 1);

        peer.record_delivery(Category::Bodies, 100, Duration::from_millis(100));
        // 0.1 * 1000 items/s
        assert_eq!(peer.capacity(Category::Bodies, rtt), 101);
        assert_eq!(peer.capacity(Category::Receipts, rtt), 1);

        for _ in 0..50 {
            peer.record_delivery(Category::Bodies, 128, Duration::from_millis(10));
        }
        assert_eq!(peer.capacity(Category::Bodies, rtt), Category::Bodies.max_fetch());
    }

    #[test]
    fn failures_halve_throughput_and_count_streak() {
        let peer = connection(1, 68);
        peer.record_delivery(Category::Headers, 100, Duration::from_millis(100));
        assert_eq!(peer.record_failure(Category::Headers), 1);
        assert_eq!(peer.record_failure(Category::Headers), 2);
        assert!((peer.throughput(Category::Headers) - 25.0).abs() < 1e-9);

        peer.record_delivery(Category::Headers, 1, Duration::from_millis(100));
        assert_eq!(peer.consecutive_failures(), 0);
    }

    #[test]
    fn registry_rejects_duplicates_and_old_versions() {
        let peers = PeerSet::new();
        peers.register(connection(1, 68)).expect("register");
        assert!(matches!(
            peers.register(connection(1, 68)),
            Err(SyncError::AlreadyRegistered)
        ));
        assert!(matches!(
            peers.register(connection(2, 65)),
            Err(SyncError::TooOld { version: 65 })
        ));
        assert_eq!(peers.len(), 1);

        peers.unregister(&PeerId::repeat_byte(1)).expect("unregister");
        assert!(peers.is_empty());
        assert!(matches!(
            peers.unregister(&PeerId::repeat_byte(1)),
            Err(SyncError::NotRegistered)
        ));
    }

    #[test]
    fn orders_peers_by_throughput() {
        let peers = PeerSet::new();
        peers.register(connection(1, 68)).expect("register");
        peers.register(connection(2, 68)).expect("register");
        peers
            .peer(&PeerId::repeat_byte(2))
            .expect("peer")
            .record_delivery(Category::Receipts, 10, Duration::from_millis(10));

        let ordered = peers.by_throughput(Category::Receipts);
        assert_eq!(ordered[0].id(), PeerId::repeat_byte(2));
        peers.reset();
        assert_eq!(
            peers.by_throughput(Category::Receipts)[0].id(),
            PeerId::repeat_byte(1)
        );
    }
}
