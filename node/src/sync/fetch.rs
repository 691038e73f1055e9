//! Concurrent content fetcher shared by the header fill, body and receipt
//! stages.
//!
//! Each idle peer gets one reservation sized to its measured throughput. A
//! request runs as its own task; the fetcher loop merges deliveries into the
//! queue, expires slow reservations, and drops peers that misbehave or keep
//! failing.

use super::error::SyncError;
use super::queue::Reservation;
use super::types::{Category, HeaderBatch, MAX_HEADER_FETCH};
use super::SyncContext;
use crate::chain::{Body, Header, Receipts, SealedHeader};
use crate::p2p::{PeerConnection, PeerId, RequestError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn, Instrument};

enum Payload {
    Headers(Vec<SealedHeader>),
    Bodies(Vec<Body>),
    Receipts(Vec<Receipts>),
}

impl Payload {
    fn len(&self) -> usize {
        match self {
            Self::Headers(headers) => headers.len(),
            Self::Bodies(bodies) => bodies.len(),
            Self::Receipts(receipts) => receipts.len(),
        }
    }
}

/// Outcome of one request task.
struct Delivery {
    peer: Arc<PeerConnection>,
    reservation: Reservation,
    elapsed: Duration,
    outcome: Result<Payload, RequestError>,
}

async fn request(
    peer: &PeerConnection,
    category: Category,
    reservation: &Reservation,
) -> Result<Payload, RequestError> {
    match category {
        Category::Headers => peer
            .peer()
            .request_headers_by_number(reservation.from, MAX_HEADER_FETCH, 0, false)
            .await
            .map(|headers| Payload::Headers(headers.into_iter().map(Header::seal_slow).collect())),
        Category::Bodies => peer
            .peer()
            .request_bodies(reservation.hashes())
            .await
            .map(Payload::Bodies),
        Category::Receipts => peer
            .peer()
            .request_receipts(reservation.hashes())
            .await
            .map(Payload::Receipts),
    }
}

async fn next_wake(wake: &mut Option<mpsc::Receiver<bool>>) -> Option<bool> {
    match wake {
        Some(wake) => wake.recv().await,
        None => std::future::pending().await,
    }
}

/// Runs the fetcher for `category` until its work is done.
///
/// Body and receipt fetchers finish once `wake` reports that no more headers
/// will be scheduled and their queues drain. The header fetcher finishes when
/// every skeleton segment is filled, forwarding contiguous prefixes to
/// `header_tx` as they complete.
pub(crate) async fn concurrent_fetch(
    ctx: &SyncContext,
    category: Category,
    mut wake: Option<mpsc::Receiver<bool>>,
    header_tx: Option<&mpsc::Sender<Option<HeaderBatch>>>,
) -> Result<(), SyncError> {
    let mut requests: JoinSet<Delivery> = JoinSet::new();
    let mut busy: HashSet<PeerId> = HashSet::new();
    let mut finished = wake.is_none();
    let mut ticker = tokio::time::interval(ctx.config.fetch_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        // A cancelled run may already have lost its peers.
        if ctx.cancel.is_cancelled() {
            break Err(SyncError::Canceled);
        }
        if let Some(done) = check_done(ctx, category, finished, requests.is_empty()) {
            break done;
        }
        assign(ctx, category, &mut requests, &mut busy);

        tokio::select! {
            _ = ctx.cancel.cancelled() => break Err(SyncError::Canceled),
            Some(joined) = requests.join_next() => {
                let delivery = match joined {
                    Ok(delivery) => delivery,
                    Err(err) => break Err(SyncError::Task(err.to_string())),
                };
                busy.remove(&delivery.peer.id());
                if let Err(err) = handle_delivery(ctx, category, delivery, header_tx).await {
                    break Err(err);
                }
            }
            signal = next_wake(&mut wake), if !finished => {
                if signal != Some(true) {
                    trace!(category = category.as_str(), "no more work will be scheduled");
                    finished = true;
                }
            }
            _ = ticker.tick() => expire(ctx, category),
        }
    };
    requests.shutdown().await;
    result
}

fn check_done(
    ctx: &SyncContext,
    category: Category,
    finished: bool,
    idle: bool,
) -> Option<Result<(), SyncError>> {
    match category {
        Category::Headers => {
            if ctx.queue.header_fill_complete() {
                return Some(Ok(()));
            }
            if idle && ctx.peers.is_empty() {
                return Some(Err(SyncError::NoPeers));
            }
            if idle && ctx.queue.header_fill_unavailable(&ctx.peers.ids()) {
                warn!("no peer can fill the remaining skeleton segments");
                return Some(Err(SyncError::PeersUnavailable));
            }
        }
        _ => {
            let pending = ctx.queue.pending(category);
            if finished && pending == 0 && idle && !ctx.queue.in_flight(category) {
                debug!(category = category.as_str(), "data fetching completed");
                return Some(Ok(()));
            }
            if idle && pending > 0 && ctx.peers.is_empty() {
                return Some(Err(SyncError::NoPeers));
            }
        }
    }
    None
}

/// Hands a reservation to every idle peer that can take one, fastest first.
fn assign(
    ctx: &SyncContext,
    category: Category,
    requests: &mut JoinSet<Delivery>,
    busy: &mut HashSet<PeerId>,
) {
    for peer in ctx.peers.by_throughput(category) {
        if busy.contains(&peer.id()) {
            continue;
        }
        let reservation = match category {
            Category::Headers => ctx.queue.reserve_headers(peer.id()),
            _ => {
                if ctx.queue.pending(category) == 0 {
                    break;
                }
                let capacity = peer.capacity(category, ctx.config.target_rtt());
                ctx.queue.reserve(category, peer.id(), capacity)
            }
        };
        let Some(reservation) = reservation else {
            continue;
        };
        busy.insert(peer.id());

        let span = tracing::trace_span!(
            "fetch_request",
            peer_id = %peer.id(),
            category = category.as_str(),
            id = reservation.id,
            from = reservation.from,
            items = reservation.expected_items()
        );
        // The queue revokes the reservation at the soft timeout; the task
        // itself is abandoned only at twice that.
        let deadline = ctx.config.request_timeout() * 2;
        requests.spawn(
            async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(deadline, request(&peer, category, &reservation))
                    .await
                    .unwrap_or(Err(RequestError::Timeout));
                Delivery {
                    peer,
                    reservation,
                    elapsed: started.elapsed(),
                    outcome,
                }
            }
            .instrument(span),
        );
    }
}

async fn handle_delivery(
    ctx: &SyncContext,
    category: Category,
    delivery: Delivery,
    header_tx: Option<&mpsc::Sender<Option<HeaderBatch>>>,
) -> Result<(), SyncError> {
    let Delivery {
        peer,
        reservation,
        elapsed,
        outcome,
    } = delivery;
    let peer_id = peer.id();

    let payload = match outcome {
        Ok(payload) => payload,
        Err(err) => {
            ctx.queue.cancel(category, peer_id, reservation.id);
            debug!(peer_id = %peer_id, category = category.as_str(), error = %err, "request failed");
            record_failure(ctx, &peer, category);
            return Ok(());
        }
    };

    let items = payload.len();
    let accepted = match payload {
        Payload::Headers(headers) => {
            match ctx.queue.deliver_headers(peer_id, reservation.id, headers) {
                Ok(ready) => {
                    let forwarded = !ready.is_empty();
                    if forwarded {
                        if let Some(header_tx) = header_tx {
                            tokio::select! {
                                sent = header_tx.send(Some(ready)) => {
                                    sent.map_err(|_| SyncError::Canceled)?
                                }
                                _ = ctx.cancel.cancelled() => return Err(SyncError::Canceled),
                            }
                        }
                    }
                    Ok(items)
                }
                Err(err) => Err(err),
            }
        }
        Payload::Bodies(bodies) => ctx.queue.deliver_bodies(peer_id, reservation.id, bodies),
        Payload::Receipts(receipts) => {
            ctx.queue
                .deliver_receipts(peer_id, reservation.id, receipts)
        }
    };

    match accepted {
        Ok(_) if items == 0 => {
            trace!(peer_id = %peer_id, category = category.as_str(), "peer returned no items");
            record_failure(ctx, &peer, category);
        }
        Ok(0) => {
            trace!(peer_id = %peer_id, id = reservation.id, "late delivery ignored");
        }
        Ok(accepted) => {
            trace!(peer_id = %peer_id, category = category.as_str(), accepted, elapsed_ms = elapsed.as_millis() as u64, "delivery accepted");
            peer.record_delivery(category, accepted, elapsed);
        }
        Err(err) => {
            warn!(peer_id = %peer_id, category = category.as_str(), error = %err, "invalid delivery, dropping peer");
            ctx.drop_peer(peer_id);
        }
    }
    Ok(())
}

fn record_failure(ctx: &SyncContext, peer: &PeerConnection, category: Category) {
    let failures = peer.record_failure(category);
    if failures >= ctx.config.peer_failure_threshold {
        warn!(peer_id = %peer.id(), failures, "peer keeps failing, dropping");
        ctx.drop_peer(peer.id());
    }
}

/// Revokes reservations past the request timeout and charges their peers.
fn expire(ctx: &SyncContext, category: Category) {
    for peer_id in ctx.queue.expire(category, ctx.config.request_timeout()) {
        debug!(peer_id = %peer_id, category = category.as_str(), "request timed out");
        if let Some(peer) = ctx.peers.peer(&peer_id) {
            record_failure(ctx, &peer, category);
        }
    }
}

/// Downloads block bodies for scheduled headers.
pub(crate) async fn fetch_bodies(
    ctx: &SyncContext,
    wake: mpsc::Receiver<bool>,
) -> Result<(), SyncError> {
    debug!("downloading block bodies");
    concurrent_fetch(ctx, Category::Bodies, Some(wake), None).await
}

/// Downloads receipts for scheduled headers; a no-op outside snap mode.
pub(crate) async fn fetch_receipts(
    ctx: &SyncContext,
    wake: mpsc::Receiver<bool>,
) -> Result<(), SyncError> {
    debug!("downloading receipts");
    concurrent_fetch(ctx, Category::Receipts, Some(wake), None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::SyncMode;
    use crate::sim::{SimChain, SimPeer};
    use crate::test_utils::{fast_config, peer_id, run_context_with_drops};
    use alloy_primitives::{B256, U256};
    use async_trait::async_trait;

    fn register(ctx: &SyncContext, n: u8, peer: Arc<dyn crate::p2p::SyncPeer>) {
        ctx.peers
            .register(PeerConnection::new(peer_id(n), 68, peer))
            .expect("register");
    }

    #[tokio::test]
    async fn bodies_fetched_across_peers() {
        let remote = Arc::new(SimChain::new(300, 1));
        let (ctx, _drops) =
            run_context_with_drops(SyncMode::Full, Arc::new(remote.to_store(0)), fast_config());
        for n in 1..=3 {
            register(&ctx, n, Arc::new(SimPeer::new(peer_id(n), remote.clone())));
        }
        ctx.queue.prepare(1, SyncMode::Full);
        let headers: Vec<_> = (1..=300).map(|n| remote.header(n).clone()).collect();
        assert_eq!(ctx.queue.schedule(&headers, 1).len(), 300);

        let (wake_tx, wake_rx) = mpsc::channel(1);
        wake_tx.send(false).await.expect("wake");
        fetch_bodies(&ctx, wake_rx).await.expect("fetch");

        let results = ctx.queue.results(false).await;
        assert_eq!(results.len(), 300);
        assert!(results.iter().all(|result| result.is_complete()));
        assert_eq!(results.last().map(|r| r.number()), Some(300));
    }

    #[tokio::test]
    async fn skeleton_fill_forwards_contiguous_headers() {
        let remote = Arc::new(SimChain::new(2 * MAX_HEADER_FETCH as u64, 1));
        let (ctx, _drops) =
            run_context_with_drops(SyncMode::Full, Arc::new(remote.to_store(0)), fast_config());
        register(&ctx, 1, Arc::new(SimPeer::new(peer_id(1), remote.clone())));
        register(&ctx, 2, Arc::new(SimPeer::new(peer_id(2), remote.clone())));
        let skeleton = vec![
            remote.header(MAX_HEADER_FETCH as u64).clone(),
            remote.header(2 * MAX_HEADER_FETCH as u64).clone(),
        ];
        ctx.queue.schedule_skeleton(1, skeleton);

        let (header_tx, mut header_rx) = mpsc::channel::<Option<HeaderBatch>>(1);
        let collector = tokio::spawn(async move {
            let mut numbers = Vec::new();
            while let Some(Some(batch)) = header_rx.recv().await {
                numbers.extend(batch.iter().map(|header| header.number));
            }
            numbers
        });
        concurrent_fetch(&ctx, Category::Headers, None, Some(&header_tx))
            .await
            .expect("fill");
        drop(header_tx);

        let numbers = collector.await.expect("join");
        assert_eq!(numbers, (1..=2 * MAX_HEADER_FETCH as u64).collect::<Vec<_>>());
        let (filled, proced) = ctx.queue.retrieve_headers();
        assert_eq!(proced, filled.len());
    }

    /// Serves bodies that never match the requested headers.
    struct GarbagePeer;

    #[async_trait]
    impl crate::p2p::SyncPeer for GarbagePeer {
        fn head(&self) -> (B256, U256) {
            (B256::ZERO, U256::ZERO)
        }

        async fn request_headers_by_hash(
            &self,
            _: B256,
            _: usize,
            _: usize,
            _: bool,
        ) -> Result<Vec<Header>, RequestError> {
            Ok(Vec::new())
        }

        async fn request_headers_by_number(
            &self,
            _: u64,
            _: usize,
            _: usize,
            _: bool,
        ) -> Result<Vec<Header>, RequestError> {
            Ok(Vec::new())
        }

        async fn request_bodies(&self, hashes: Vec<B256>) -> Result<Vec<Body>, RequestError> {
            Ok(hashes
                .iter()
                .map(|_| Body {
                    transactions: vec![alloy_primitives::Bytes::from_static(b"junk")],
                })
                .collect())
        }

        async fn request_receipts(&self, _: Vec<B256>) -> Result<Vec<Receipts>, RequestError> {
            Ok(Vec::new())
        }

        fn mark_lagging(&self) {}
    }

    #[tokio::test]
    async fn invalid_bodies_drop_the_peer() {
        let remote = Arc::new(SimChain::new(40, 1));
        let (ctx, drops) =
            run_context_with_drops(SyncMode::Full, Arc::new(remote.to_store(0)), fast_config());
        register(&ctx, 1, Arc::new(GarbagePeer));
        register(&ctx, 2, Arc::new(SimPeer::new(peer_id(2), remote.clone())));
        ctx.queue.prepare(1, SyncMode::Full);
        let headers: Vec<_> = (1..=40).map(|n| remote.header(n).clone()).collect();
        ctx.queue.schedule(&headers, 1);

        let (wake_tx, wake_rx) = mpsc::channel(1);
        wake_tx.send(false).await.expect("wake");
        fetch_bodies(&ctx, wake_rx).await.expect("fetch");

        assert_eq!(drops.lock().as_slice(), &[peer_id(1)]);
        assert_eq!(ctx.queue.results(false).await.len(), 40);
    }

    #[tokio::test]
    async fn pending_work_without_peers_fails() {
        let remote = Arc::new(SimChain::new(10, 1));
        let (ctx, _drops) =
            run_context_with_drops(SyncMode::Full, Arc::new(remote.to_store(0)), fast_config());
        ctx.queue.prepare(1, SyncMode::Full);
        let headers: Vec<_> = (1..=10).map(|n| remote.header(n).clone()).collect();
        ctx.queue.schedule(&headers, 1);

        let (_wake_tx, wake_rx) = mpsc::channel(1);
        let err = fetch_bodies(&ctx, wake_rx).await.expect_err("no peers");
        assert!(matches!(err, SyncError::NoPeers));
    }
}
