//! Common ancestor search against a remote peer.

use super::error::SyncError;
use super::headers::request_headers_by_number;
use super::types::MAX_HEADER_FETCH;
use super::SyncContext;
use crate::chain::SealedHeader;
use crate::cli::SyncMode;
use crate::p2p::PeerConnection;
use alloy_primitives::B256;
use tracing::{debug, error, trace, warn};

/// Sparse header request that probes the span between local and remote heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSpan {
    pub from: u64,
    pub count: usize,
    pub skip: usize,
    /// Highest number the request can return.
    pub max: u64,
}

/// Picks up to 12 evenly spaced headers ending just below the remote head,
/// reaching down to just below the local head.
pub fn calculate_request_span(remote_height: u64, local_height: u64) -> RequestSpan {
    let max_count = (MAX_HEADER_FETCH / 16) as u64;
    let request_head = remote_height.saturating_sub(1);
    let request_bottom = local_height.saturating_sub(1);
    let total_span = request_head.saturating_sub(request_bottom);

    let span = (1 + total_span / max_count).clamp(2, 16);
    let count = (1 + total_span / span).clamp(2, max_count);
    let from = request_head.saturating_sub((count - 1) * span);
    let max = from + (count - 1) * span;
    RequestSpan {
        from,
        count: count as usize,
        skip: (span - 1) as usize,
        max,
    }
}

/// Whether the local chain holds the block in the sense the sync mode needs.
fn is_known(ctx: &SyncContext, hash: B256, number: u64) -> bool {
    match ctx.mode {
        SyncMode::Full => ctx.chain.has_block(hash, number),
        SyncMode::Snap => ctx.chain.has_fast_block(hash, number),
    }
}

/// Lowest block number the ancestor may not be at or below; `-1` allows genesis.
fn ancestor_floor(ctx: &SyncContext, local_height: u64) -> Result<i64, SyncError> {
    let max_fork_ancestry = ctx.config.max_fork_ancestry;
    let mut floor = -1i64;
    if local_height >= max_fork_ancestry {
        floor = (local_height - max_fork_ancestry) as i64;
    }
    // Pruned history raises an existing floor; genesis stays reachable otherwise.
    let tail = ctx.chain.ancient_tail()?;
    if floor >= 0 && tail as i64 > floor {
        floor = tail as i64;
    }
    Ok(floor)
}

/// Finds the highest block shared by the local chain and `remote`'s chain.
pub(crate) async fn find_ancestor(
    ctx: &SyncContext,
    peer: &PeerConnection,
    local_height: u64,
    remote: &SealedHeader,
) -> Result<u64, SyncError> {
    let remote_height = remote.number;
    debug!(peer_id = %peer.id(), local = local_height, remote = remote_height, "looking for common ancestor");
    let floor = ancestor_floor(ctx, local_height)?;

    if (remote_height as i64) > floor && is_known(ctx, remote.hash, remote_height) {
        debug!(number = remote_height, hash = %remote.hash, "remote head already known locally");
        return Ok(remote_height);
    }

    match span_search(ctx, peer, remote_height, local_height, floor).await {
        Err(SyncError::NoAncestorFound) => binary_search(ctx, peer, remote_height, floor).await,
        other => other,
    }
}

async fn span_search(
    ctx: &SyncContext,
    peer: &PeerConnection,
    remote_height: u64,
    local_height: u64,
    floor: i64,
) -> Result<u64, SyncError> {
    let span = calculate_request_span(remote_height, local_height);
    trace!(count = span.count, from = span.from, skip = span.skip, "span searching for common ancestor");
    let headers = request_headers_by_number(ctx, peer, span.from, span.count, span.skip, false).await?;
    if headers.is_empty() {
        warn!(peer_id = %peer.id(), "empty head header set");
        return Err(SyncError::EmptyHeaderSet);
    }
    for (index, header) in headers.iter().enumerate() {
        let expected = span.from + (index * (span.skip + 1)) as u64;
        if header.number != expected {
            warn!(index, requested = expected, received = header.number, "head headers broke chain ordering");
            return Err(SyncError::InvalidChain(
                "head headers broke chain ordering".to_string(),
            ));
        }
    }

    let found = headers
        .iter()
        .rev()
        .filter(|header| header.number >= span.from && header.number <= span.max)
        .find(|header| is_known(ctx, header.hash, header.number));
    match found {
        Some(header) if (header.number as i64) <= floor => {
            warn!(number = header.number, hash = %header.hash, allowance = floor, "ancestor below allowance");
            Err(SyncError::InvalidAncestor)
        }
        Some(header) => {
            debug!(number = header.number, hash = %header.hash, "found common ancestor");
            Ok(header.number)
        }
        None => Err(SyncError::NoAncestorFound),
    }
}

async fn binary_search(
    ctx: &SyncContext,
    peer: &PeerConnection,
    remote_height: u64,
    floor: i64,
) -> Result<u64, SyncError> {
    let mut start = floor.max(0) as u64;
    let mut end = remote_height;
    let mut hash = B256::ZERO;
    trace!(start, end, "binary searching for common ancestor");

    while start + 1 < end {
        let check = (start + end) / 2;
        let headers = request_headers_by_number(ctx, peer, check, 1, 0, false).await?;
        if headers.len() != 1 {
            warn!(headers = headers.len(), "multiple headers for single request");
            return Err(SyncError::BadPeer(format!(
                "multiple headers ({}) for single request",
                headers.len()
            )));
        }
        let candidate = &headers[0];
        if !is_known(ctx, candidate.hash, candidate.number) {
            end = check;
            continue;
        }
        let Some(local) = ctx.chain.header_by_hash(candidate.hash) else {
            error!(hash = %candidate.hash, request = check, "header not found");
            return Err(SyncError::BadPeer(format!(
                "header not found ({})",
                candidate.hash
            )));
        };
        if local.number != check {
            warn!(number = local.number, hash = %local.hash, request = check, "received non requested header");
            return Err(SyncError::BadPeer(format!(
                "non-requested header ({})",
                local.number
            )));
        }
        start = check;
        hash = candidate.hash;
    }

    if (start as i64) <= floor {
        warn!(number = start, hash = %hash, allowance = floor, "ancestor below allowance");
        return Err(SyncError::InvalidAncestor);
    }
    debug!(number = start, hash = %hash, "found common ancestor");
    Ok(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Body, ChainStore, Header, Receipts};
    use crate::p2p::{PeerId, RequestError, SyncPeer};
    use crate::sim::{SimChain, SimPeer};
    use crate::test_utils::{fast_config, peer_id, run_context, LossyChain};
    use alloy_primitives::U256;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn connection(remote: &Arc<SimChain>) -> (PeerConnection, Arc<SimPeer>) {
        let sim = Arc::new(SimPeer::new(peer_id(1), remote.clone()));
        (PeerConnection::new(peer_id(1), 68, sim.clone()), sim)
    }

    #[test]
    fn request_span_matches_reference_values() {
        assert_eq!(
            calculate_request_span(1500, 1000),
            RequestSpan { from: 1323, count: 12, skip: 15, max: 1499 }
        );
        assert_eq!(
            calculate_request_span(15000, 13006),
            RequestSpan { from: 14823, count: 12, skip: 15, max: 14999 }
        );
        assert_eq!(
            calculate_request_span(1200, 1150),
            RequestSpan { from: 1149, count: 11, skip: 4, max: 1199 }
        );
        assert_eq!(
            calculate_request_span(1500, 1500),
            RequestSpan { from: 1497, count: 2, skip: 1, max: 1499 }
        );
        assert_eq!(
            calculate_request_span(3, 0),
            RequestSpan { from: 0, count: 2, skip: 1, max: 2 }
        );
    }

    #[tokio::test]
    async fn known_remote_head_short_circuits() {
        // Local already holds the remote head (remote is behind us).
        let local_chain = Arc::new(SimChain::new(100, 1));
        let remote = Arc::new(local_chain.truncated(60));
        let store = Arc::new(local_chain.to_store(100));
        let ctx = run_context(SyncMode::Full, store, fast_config());
        let (peer, sim) = connection(&remote);

        let ancestor = find_ancestor(&ctx, &peer, 100, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 60);
        assert_eq!(sim.header_requests(), 0);
    }

    #[tokio::test]
    async fn near_heads_resolve_with_single_span_request() {
        let remote = Arc::new(SimChain::new(52, 1));
        let store = Arc::new(remote.to_store(50));
        let ctx = run_context(SyncMode::Full, store, fast_config());
        let (peer, sim) = connection(&remote);

        let ancestor = find_ancestor(&ctx, &peer, 50, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 49);
        assert_eq!(sim.header_requests(), 1);
    }

    #[tokio::test]
    async fn span_miss_falls_back_to_binary_search() {
        let remote = Arc::new(SimChain::new(200, 1));
        let store = Arc::new(remote.to_store(50));
        let ctx = run_context(SyncMode::Full, store, fast_config());
        let (peer, sim) = connection(&remote);

        let ancestor = find_ancestor(&ctx, &peer, 50, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 50);
        assert!(sim.header_requests() > 1);

        // Repeating the search against the same state gives the same answer.
        let again = find_ancestor(&ctx, &peer, 50, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(again, ancestor);
    }

    #[tokio::test]
    async fn finds_fork_point() {
        let remote = Arc::new(SimChain::new(200, 1));
        let local = remote.fork(40, 100, 2);
        let store = Arc::new(local.to_store(100));
        let ctx = run_context(SyncMode::Full, store, fast_config());
        let (peer, _) = connection(&remote);

        let ancestor = find_ancestor(&ctx, &peer, 100, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 40);
    }

    #[tokio::test]
    async fn rejects_ancestor_below_fork_allowance() {
        let remote = Arc::new(SimChain::new(200, 1));
        let local = remote.fork(40, 100, 2);
        let store = Arc::new(local.to_store(100));
        let mut config = fast_config();
        config.max_fork_ancestry = 30;
        let ctx = run_context(SyncMode::Full, store, config);
        let (peer, _) = connection(&remote);

        let err = find_ancestor(&ctx, &peer, 100, remote.head())
            .await
            .expect_err("fork too deep");
        assert!(matches!(err, SyncError::InvalidAncestor));
    }

    #[tokio::test]
    async fn genesis_only_node_anchors_at_genesis() {
        let remote = Arc::new(SimChain::new(200, 1));
        let ctx = run_context(SyncMode::Full, Arc::new(remote.to_store(0)), fast_config());
        let (peer, _) = connection(&remote);

        let ancestor = find_ancestor(&ctx, &peer, 0, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 0);
    }

    #[tokio::test]
    async fn fork_back_to_genesis_is_allowed() {
        let remote = Arc::new(SimChain::new(200, 1));
        let local = remote.fork(0, 100, 2);
        let ctx = run_context(SyncMode::Full, Arc::new(local.to_store(100)), fast_config());
        let (peer, _) = connection(&remote);

        let ancestor = find_ancestor(&ctx, &peer, 100, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 0);
    }

    #[tokio::test]
    async fn pruned_tail_raises_fork_floor() {
        let remote = Arc::new(SimChain::new(200, 1));
        let local = remote.fork(50, 100, 2);
        let (peer, _) = connection(&remote);

        // Floor 10 from the fork allowance, lifted to the pruned tail.
        let store = Arc::new(local.to_store(100));
        store.prune(60);
        let mut config = fast_config();
        config.max_fork_ancestry = 90;
        let ctx = run_context(SyncMode::Full, store, config);
        let err = find_ancestor(&ctx, &peer, 100, remote.head())
            .await
            .expect_err("fork below tail");
        assert!(matches!(err, SyncError::InvalidAncestor));

        // Without a fork allowance floor the tail is not consulted.
        let store = Arc::new(local.to_store(100));
        store.prune(60);
        let ctx = run_context(SyncMode::Full, store, fast_config());
        let ancestor = find_ancestor(&ctx, &peer, 100, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 50);
    }

    #[tokio::test]
    async fn missing_local_header_blames_the_peer() {
        let remote = Arc::new(SimChain::new(200, 1));
        let chain = Arc::new(LossyChain::new(Arc::new(remote.to_store(50))));
        // Binary search checks 100, then 50.
        chain.lose(remote.header(50).hash);
        let ctx = run_context(SyncMode::Full, chain, fast_config());
        let (peer, _) = connection(&remote);

        let err = find_ancestor(&ctx, &peer, 50, remote.head())
            .await
            .expect_err("header gone");
        assert!(matches!(err, SyncError::BadPeer(ref msg) if msg.contains("header not found")));
        assert_eq!(err.class(), crate::sync::ErrorClass::PeerFault);
    }

    #[tokio::test]
    async fn snap_mode_uses_fast_blocks() {
        let remote = Arc::new(SimChain::new(120, 1));
        let store = Arc::new(remote.to_store(0));
        let blocks = (1..=80).map(|n| remote.block(n).clone()).collect();
        let receipts = (1..=80).map(|n| remote.receipts(n).clone()).collect();
        store
            .insert_receipt_chain(blocks, receipts, 0)
            .expect("receipts");
        let ctx = run_context(SyncMode::Snap, store, fast_config());
        let (peer, _) = connection(&remote);

        // The span probes 79, 83, ...; only 79 is held with receipts.
        let ancestor = find_ancestor(&ctx, &peer, 80, remote.head())
            .await
            .expect("ancestor");
        assert_eq!(ancestor, 79);
    }

    /// Serves a fixed header list regardless of the request.
    struct ScriptedPeer {
        headers: Vec<Header>,
    }

    #[async_trait]
    impl SyncPeer for ScriptedPeer {
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
            Ok(self.headers.clone())
        }

        async fn request_headers_by_number(
            &self,
            _: u64,
            _: usize,
            _: usize,
            _: bool,
        ) -> Result<Vec<Header>, RequestError> {
            Ok(self.headers.clone())
        }

        async fn request_bodies(&self, _: Vec<B256>) -> Result<Vec<Body>, RequestError> {
            Ok(Vec::new())
        }

        async fn request_receipts(&self, _: Vec<B256>) -> Result<Vec<Receipts>, RequestError> {
            Ok(Vec::new())
        }

        fn mark_lagging(&self) {}
    }

    fn scripted(headers: Vec<Header>) -> PeerConnection {
        PeerConnection::new(PeerId::repeat_byte(9), 68, Arc::new(ScriptedPeer { headers }))
    }

    #[tokio::test]
    async fn empty_span_reply_is_rejected() {
        let remote = SimChain::new(200, 1);
        let ctx = run_context(SyncMode::Full, Arc::new(remote.to_store(50)), fast_config());
        let err = find_ancestor(&ctx, &scripted(Vec::new()), 50, remote.head())
            .await
            .expect_err("empty");
        assert!(matches!(err, SyncError::EmptyHeaderSet));
    }

    #[tokio::test]
    async fn misnumbered_span_reply_is_rejected() {
        let remote = SimChain::new(200, 1);
        let ctx = run_context(SyncMode::Full, Arc::new(remote.to_store(50)), fast_config());
        let wrong = vec![remote.header(3).header.clone(), remote.header(4).header.clone()];
        let err = find_ancestor(&ctx, &scripted(wrong), 50, remote.head())
            .await
            .expect_err("ordering");
        assert!(matches!(err, SyncError::InvalidChain(_)));
    }

    #[tokio::test]
    async fn binary_search_rejects_multi_header_replies() {
        let remote = SimChain::new(200, 1);
        let local = remote.fork(10, 50, 2);
        let ctx = run_context(SyncMode::Full, Arc::new(local.to_store(50)), fast_config());
        let span = calculate_request_span(200, 50);
        // A valid but unknown span reply forces the binary phase, whose
        // single-header probes then get the same multi-header answer.
        let reply = (0..span.count as u64)
            .map(|i| remote.header(span.from + i * (span.skip as u64 + 1)).header.clone())
            .collect();
        let err = find_ancestor(&ctx, &scripted(reply), 50, remote.head())
            .await
            .expect_err("bad peer");
        assert!(matches!(err, SyncError::BadPeer(_)));
    }
}
