//! Header retrieval: remote head lookup, skeleton and direct fetching, and the
//! header processor feeding the scheduler.

use super::error::SyncError;
use super::fetch::concurrent_fetch;
use super::types::{
    Category, HeaderBatch, FS_MIN_FULL_BLOCKS, MAX_HEADERS_PROCESS, MAX_HEADER_FETCH,
    MAX_QUEUED_HEADERS, MAX_SKELETON_SIZE, REORG_PROT_HEADER_DELAY, REORG_PROT_THRESHOLD,
};
use super::SyncContext;
use crate::chain::{Header, SealedHeader};
use crate::cli::SyncMode;
use crate::p2p::{PeerConnection, RequestError};
use alloy_primitives::{B256, U256};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Wake channels of the body and receipt fetchers.
///
/// `true` announces newly scheduled work, `false` that no more will come.
#[derive(Debug, Clone)]
pub(crate) struct ContentWakers {
    bodies: mpsc::Sender<bool>,
    receipts: mpsc::Sender<bool>,
}

impl ContentWakers {
    pub(crate) fn new(bodies: mpsc::Sender<bool>, receipts: mpsc::Sender<bool>) -> Self {
        Self { bodies, receipts }
    }

    /// Nudges both fetchers; a wake already pending is enough.
    pub(crate) fn notify(&self) {
        let _ = self.bodies.try_send(true);
        let _ = self.receipts.try_send(true);
    }

    /// Tells both fetchers that scheduling is over.
    pub(crate) async fn finish(&self, cancel: &CancellationToken) {
        for wake in [&self.bodies, &self.receipts] {
            tokio::select! {
                _ = wake.send(false) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

async fn finish_header_request(
    ctx: &SyncContext,
    request: impl Future<Output = Result<Vec<Header>, RequestError>>,
) -> Result<Vec<SealedHeader>, SyncError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(SyncError::Canceled),
        reply = tokio::time::timeout(ctx.config.request_timeout(), request) => match reply {
            Err(_) | Ok(Err(RequestError::Timeout)) => Err(SyncError::Timeout),
            Ok(Err(err)) => Err(SyncError::BadPeer(format!("header request failed: {err}"))),
            Ok(Ok(headers)) => Ok(headers.into_iter().map(Header::seal_slow).collect()),
        },
    }
}

/// Requests headers by number from a single peer, bounded by the request timeout.
pub(crate) async fn request_headers_by_number(
    ctx: &SyncContext,
    peer: &PeerConnection,
    origin: u64,
    amount: usize,
    skip: usize,
    reverse: bool,
) -> Result<Vec<SealedHeader>, SyncError> {
    let request = peer
        .peer()
        .request_headers_by_number(origin, amount, skip, reverse);
    finish_header_request(ctx, request).await
}

pub(crate) async fn request_headers_by_hash(
    ctx: &SyncContext,
    peer: &PeerConnection,
    origin: B256,
    amount: usize,
    skip: usize,
    reverse: bool,
) -> Result<Vec<SealedHeader>, SyncError> {
    let request = peer
        .peer()
        .request_headers_by_hash(origin, amount, skip, reverse);
    finish_header_request(ctx, request).await
}

/// Retrieves the peer's announced head and, in snap mode, the pivot header
/// `FS_MIN_FULL_BLOCKS` below it.
pub(crate) async fn fetch_head(
    ctx: &SyncContext,
    peer: &PeerConnection,
) -> Result<(SealedHeader, Option<SealedHeader>), SyncError> {
    let (latest, _) = peer.peer().head();
    let fetch = match ctx.mode {
        SyncMode::Full => 1,
        SyncMode::Snap => 2,
    };
    debug!(peer_id = %peer.id(), head = %latest, "retrieving remote chain head");
    let headers = request_headers_by_hash(
        ctx,
        peer,
        latest,
        fetch,
        FS_MIN_FULL_BLOCKS as usize - 1,
        true,
    )
    .await?;
    if headers.is_empty() || headers.len() > fetch {
        return Err(SyncError::BadPeer(format!(
            "returned headers {} != requested {}",
            headers.len(),
            fetch
        )));
    }
    let mut headers = headers.into_iter();
    let Some(head) = headers.next() else {
        return Err(SyncError::BadPeer("no head header returned".to_string()));
    };
    if head.hash != latest {
        return Err(SyncError::BadPeer(format!(
            "head header hash mismatch: have {}, want {latest}",
            head.hash
        )));
    }
    match headers.next() {
        None => {
            if ctx.mode == SyncMode::Snap && head.number > FS_MIN_FULL_BLOCKS {
                return Err(SyncError::BadPeer(
                    "no pivot included along head header".to_string(),
                ));
            }
            Ok((head, None))
        }
        Some(pivot) => {
            let want = head.number.saturating_sub(FS_MIN_FULL_BLOCKS);
            if pivot.number != want {
                return Err(SyncError::InvalidChain(format!(
                    "remote pivot {} != requested {want}",
                    pivot.number
                )));
            }
            Ok((head, Some(pivot)))
        }
    }
}

async fn send_batch(
    ctx: &SyncContext,
    header_tx: &mpsc::Sender<Option<HeaderBatch>>,
    batch: Option<HeaderBatch>,
) -> Result<(), SyncError> {
    tokio::select! {
        sent = header_tx.send(batch) => sent.map_err(|_| SyncError::Canceled),
        _ = ctx.cancel.cancelled() => Err(SyncError::Canceled),
    }
}

/// Fetches the skeleton from the anchor peer, has all peers fill it, and
/// forwards contiguous batches to the header processor. Near the head it
/// switches to fetching headers directly from the anchor peer.
pub(crate) async fn fetch_headers(
    ctx: &SyncContext,
    peer: &PeerConnection,
    mut from: u64,
    head: u64,
    header_tx: mpsc::Sender<Option<HeaderBatch>>,
    wakers: ContentWakers,
) -> Result<(), SyncError> {
    debug!(peer_id = %peer.id(), origin = from, "directing header downloads");
    let ancestor = from;
    let mut skeleton = true;
    let mut pivoting = false;

    loop {
        let pivot = ctx.pivot.number();
        let reply = if pivoting {
            trace!(number = pivot + FS_MIN_FULL_BLOCKS, "fetching next pivot header");
            request_headers_by_number(
                ctx,
                peer,
                pivot + FS_MIN_FULL_BLOCKS,
                2,
                FS_MIN_FULL_BLOCKS as usize - 9,
                false,
            )
            .await
        } else if skeleton {
            trace!(count = MAX_HEADER_FETCH, from, "fetching skeleton headers");
            request_headers_by_number(
                ctx,
                peer,
                from + MAX_HEADER_FETCH as u64 - 1,
                MAX_SKELETON_SIZE,
                MAX_HEADER_FETCH - 1,
                false,
            )
            .await
        } else {
            trace!(count = MAX_HEADER_FETCH, from, "fetching full headers");
            request_headers_by_number(ctx, peer, from, MAX_HEADER_FETCH, 0, false).await
        };
        let mut headers = match reply {
            Ok(headers) => headers,
            Err(SyncError::Canceled) => return Err(SyncError::Canceled),
            Err(err) => {
                debug!(peer_id = %peer.id(), error = %err, "header request failed");
                ctx.drop_peer(peer.id());
                wakers.finish(&ctx.cancel).await;
                let _ = send_batch(ctx, &header_tx, None).await;
                return Err(SyncError::BadPeer(format!("header request failed: {err}")));
            }
        };

        if pivoting {
            if headers.len() == 2 {
                let want = pivot + FS_MIN_FULL_BLOCKS;
                if headers[0].number != want {
                    warn!(have = headers[0].number, want, "peer sent invalid next pivot");
                    return Err(SyncError::InvalidChain(format!(
                        "next pivot number {} != requested {want}",
                        headers[0].number
                    )));
                }
                let want = pivot + 2 * FS_MIN_FULL_BLOCKS - 8;
                if headers[1].number != want {
                    warn!(have = headers[1].number, want, "peer sent invalid pivot confirmer");
                    return Err(SyncError::InvalidChain(format!(
                        "next pivot confirmer number {} != requested {want}",
                        headers[1].number
                    )));
                }
                let next = headers.swap_remove(0);
                let number = next.number;
                warn!(old = pivot, new = number, "pivot seemingly stale, moving");
                if ctx.pivot.advance(next) {
                    ctx.chain.write_last_pivot_number(number);
                }
            }
            pivoting = false;
            continue;
        }

        if skeleton && headers.is_empty() {
            let withheld = from + MAX_HEADER_FETCH as u64 - 1;
            if withheld <= head {
                warn!(peer_id = %peer.id(), advertised = head, withheld, "peer withheld skeleton headers");
                return Err(SyncError::StallingPeer(format!(
                    "withheld skeleton headers: advertised {head}, withheld #{withheld}"
                )));
            }
            debug!(from, "no skeleton, fetching headers directly");
            skeleton = false;
            continue;
        }

        if headers.is_empty() {
            if !ctx.committed() && pivot <= from {
                debug!(pivot, from, "no headers, waiting for pivot commit");
                ctx.pause(ctx.config.header_cont_check()).await?;
                continue;
            }
            debug!(from, "no more headers available");
            return send_batch(ctx, &header_tx, None).await;
        }

        let mut progressed = false;
        if skeleton {
            let (filled, proced) = match fill_skeleton(ctx, from, headers, &header_tx).await {
                Ok(filled) => filled,
                Err(SyncError::Canceled) => return Err(SyncError::Canceled),
                Err(err) => {
                    debug!(error = %err, "skeleton chain invalid");
                    return Err(SyncError::InvalidChain(err.to_string()));
                }
            };
            headers = filled.into_iter().skip(proced).collect();
            progressed = proced > 0;
            from += proced as u64;
        } else {
            let count = headers.len();
            if let Some(last) = headers.last().map(|header| header.number) {
                if count < MAX_HEADER_FETCH && last < head {
                    warn!(peer_id = %peer.id(), advertised = head, delivered = last, "peer withheld headers");
                    return Err(SyncError::StallingPeer(format!(
                        "withheld headers: advertised {head}, delivered {last}"
                    )));
                }
                let local_head = ctx
                    .chain
                    .current_snap_block()
                    .number
                    .max(ctx.chain.current_block().number)
                    .max(ancestor);
                if local_head + REORG_PROT_THRESHOLD < last {
                    let delay = (REORG_PROT_HEADER_DELAY as usize).min(count);
                    headers.truncate(count - delay);
                }
            }
        }

        if headers.is_empty() && !progressed {
            trace!(from, "all headers delayed, waiting");
            ctx.pause(ctx.config.header_cont_check()).await?;
            continue;
        }
        if !headers.is_empty() {
            let count = headers.len() as u64;
            trace!(count, from, "scheduling new headers");
            send_batch(ctx, &header_tx, Some(headers)).await?;
            from += count;
        }
        if skeleton && pivot > 0 {
            pivoting = true;
        }
    }
}

/// Schedules the skeleton segments and runs the header fetcher until every
/// segment is filled. Returns all filled headers and how many were already
/// forwarded to the processor.
pub(crate) async fn fill_skeleton(
    ctx: &SyncContext,
    from: u64,
    skeleton: Vec<SealedHeader>,
    header_tx: &mpsc::Sender<Option<HeaderBatch>>,
) -> Result<(Vec<SealedHeader>, usize), SyncError> {
    debug!(from, segments = skeleton.len(), "filling up skeleton");
    ctx.queue.schedule_skeleton(from, skeleton);
    concurrent_fetch(ctx, Category::Headers, None, Some(header_tx)).await?;
    let (filled, proced) = ctx.queue.retrieve_headers();
    debug!(filled = filled.len(), proced, "skeleton fill terminated");
    Ok((filled, proced))
}

/// Consumes header batches: inserts them into the header chain in snap mode
/// and schedules their content, holding back while the content queues are full.
pub(crate) async fn process_headers(
    ctx: &SyncContext,
    mut origin: u64,
    td: U256,
    mut header_rx: mpsc::Receiver<Option<HeaderBatch>>,
    wakers: ContentWakers,
) -> Result<(), SyncError> {
    let mut got_headers = false;
    loop {
        let batch = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(SyncError::Canceled),
            batch = header_rx.recv() => batch,
        };
        let headers = match batch {
            Some(Some(headers)) if !headers.is_empty() => headers,
            Some(_) => {
                wakers.finish(&ctx.cancel).await;
                return check_delivered(ctx, got_headers, td);
            }
            None => {
                // The fetcher only exits without a terminal batch on error.
                ctx.cancel.cancelled().await;
                return Err(SyncError::Canceled);
            }
        };
        got_headers = true;

        for chunk in headers.chunks(MAX_HEADERS_PROCESS) {
            if ctx.cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            if ctx.mode == SyncMode::Snap {
                if let Err(err) = ctx.chain.insert_header_chain(chunk) {
                    let failed = err.index().and_then(|index| chunk.get(index));
                    warn!(
                        number = failed.map(|header| header.number),
                        error = %err,
                        "invalid header encountered"
                    );
                    return Err(SyncError::insertion(err));
                }
            }
            while ctx.queue.pending(Category::Bodies) >= MAX_QUEUED_HEADERS
                || ctx.queue.pending(Category::Receipts) >= MAX_QUEUED_HEADERS
            {
                ctx.pause(ctx.config.backpressure_check()).await?;
            }
            let inserted = ctx.queue.schedule(chunk, origin);
            if inserted.len() != chunk.len() {
                warn!(origin, inserted = inserted.len(), chunk = chunk.len(), "stale headers");
                return Err(SyncError::BadPeer("stale headers".to_string()));
            }
            origin += chunk.len() as u64;
        }
        ctx.stats.raise_height(origin.saturating_sub(1));
        wakers.notify();
    }
}

/// A peer that promised more difficulty than it delivered is stalling.
fn check_delivered(ctx: &SyncContext, got_headers: bool, td: U256) -> Result<(), SyncError> {
    let head = ctx.chain.current_block();
    let local = ctx.chain.td(head.hash, head.number).unwrap_or_default();
    if !got_headers && td > local {
        return Err(SyncError::StallingPeer(
            "no headers delivered despite higher total difficulty".to_string(),
        ));
    }
    if ctx.mode == SyncMode::Snap {
        let head = ctx.chain.current_header();
        let local = ctx.chain.td(head.hash, head.number).unwrap_or_default();
        if td > local {
            return Err(SyncError::StallingPeer(
                "promised headers not delivered".to_string(),
            ));
        }
    }
    Ok(())
}
