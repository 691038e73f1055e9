//! Reservation-based download scheduler.
//!
//! Tracks three kinds of work: skeleton header fills, block bodies, and
//! receipts. Peers reserve a batch, and deliveries are validated against the
//! reservation and merged into per-block results. Completed results are
//! released to the importer strictly in block-number order.

use super::error::SyncError;
use super::types::{Category, FetchResult, MAX_HEADER_FETCH, MAX_RESULTS_PROCESS};
use crate::chain::{receipts_root, Body, Receipts, SealedHeader};
use crate::cli::SyncMode;
use crate::p2p::PeerId;
use alloy_primitives::B256;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{trace, warn};

/// Work handed to a single peer.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Unique per reservation; deliveries must quote it.
    pub id: u64,
    pub peer_id: PeerId,
    /// Headers whose content was reserved. Empty for header fills.
    pub headers: Vec<SealedHeader>,
    /// First block number of a header fill.
    pub from: u64,
    pub started: Instant,
}

impl Reservation {
    pub fn hashes(&self) -> Vec<B256> {
        self.headers.iter().map(|header| header.hash).collect()
    }

    /// Items the request is expected to return.
    pub fn expected_items(&self) -> usize {
        if self.headers.is_empty() {
            MAX_HEADER_FETCH
        } else {
            self.headers.len()
        }
    }
}

#[derive(Debug, Default)]
struct TaskSet {
    pool: BTreeMap<u64, SealedHeader>,
    pending: HashMap<PeerId, Reservation>,
}

impl TaskSet {
    fn requeue(&mut self, reservation: Reservation) {
        for header in reservation.headers {
            self.pool.insert(header.number, header);
        }
    }

    fn take(&mut self, peer_id: &PeerId, id: u64) -> Option<Reservation> {
        match self.pending.get(peer_id) {
            Some(reservation) if reservation.id == id => self.pending.remove(peer_id),
            _ => None,
        }
    }
}

/// Skeleton fill bookkeeping.
#[derive(Debug, Default)]
struct HeaderFill {
    /// Segment start -> skeleton header closing the segment.
    tasks: HashMap<u64, SealedHeader>,
    queue: BinaryHeap<Reverse<u64>>,
    /// Segments each peer failed to deliver.
    peer_miss: HashMap<PeerId, HashSet<u64>>,
    pending: HashMap<PeerId, Reservation>,
    results: Vec<Option<SealedHeader>>,
    offset: u64,
    proced: usize,
}

#[derive(Debug)]
struct QueueState {
    mode: SyncMode,
    closed: bool,
    next_id: u64,
    header_head: Option<B256>,
    fill: HeaderFill,
    bodies: TaskSet,
    receipts: TaskSet,
    results: BTreeMap<u64, FetchResult>,
    result_offset: u64,
}

impl QueueState {
    fn new(mode: SyncMode, offset: u64) -> Self {
        Self {
            mode,
            closed: false,
            next_id: 0,
            header_head: None,
            fill: HeaderFill::default(),
            bodies: TaskSet::default(),
            receipts: TaskSet::default(),
            results: BTreeMap::new(),
            result_offset: offset,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn tasks(&mut self, category: Category) -> Option<&mut TaskSet> {
        match category {
            Category::Headers => None,
            Category::Bodies => Some(&mut self.bodies),
            Category::Receipts => Some(&mut self.receipts),
        }
    }

    fn ready(&self) -> bool {
        self.results
            .first_key_value()
            .is_some_and(|(number, result)| *number == self.result_offset && result.is_complete())
    }
}

#[derive(Debug)]
pub struct Queue {
    state: Mutex<QueueState>,
    ready: Notify,
    result_cache_limit: u64,
}

impl Queue {
    pub fn new(result_cache_limit: u64) -> Self {
        Self {
            state: Mutex::new(QueueState::new(SyncMode::Full, 0)),
            ready: Notify::new(),
            result_cache_limit: result_cache_limit.max(1),
        }
    }

    /// Clears all work from a previous run.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let mode = state.mode;
        *state = QueueState::new(mode, 0);
    }

    /// Sets the first block number results will be released from.
    pub fn prepare(&self, offset: u64, mode: SyncMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        state.result_offset = offset;
    }

    /// Marks the end of scheduling and wakes blocked result waiters.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Tasks waiting for a reservation.
    pub fn pending(&self, category: Category) -> usize {
        let state = self.state.lock();
        match category {
            Category::Headers => state.fill.queue.len(),
            Category::Bodies => state.bodies.pool.len(),
            Category::Receipts => state.receipts.pool.len(),
        }
    }

    pub fn in_flight(&self, category: Category) -> bool {
        let state = self.state.lock();
        match category {
            Category::Headers => !state.fill.pending.is_empty(),
            Category::Bodies => !state.bodies.pending.is_empty(),
            Category::Receipts => !state.receipts.pending.is_empty(),
        }
    }

    /// True if pool work exists but lies beyond the result cache window.
    pub fn throttled(&self, category: Category) -> bool {
        let state = self.state.lock();
        let limit = state.result_offset + self.result_cache_limit;
        let first = match category {
            Category::Headers => return false,
            Category::Bodies => state.bodies.pool.keys().next(),
            Category::Receipts => state.receipts.pool.keys().next(),
        };
        first.is_some_and(|number| *number >= limit)
    }

    /// Starts a skeleton fill: one task per skeleton header, each covering the
    /// `MAX_HEADER_FETCH` headers ending at it.
    pub fn schedule_skeleton(&self, from: u64, skeleton: Vec<SealedHeader>) {
        let mut state = self.state.lock();
        let fill = &mut state.fill;
        *fill = HeaderFill {
            offset: from,
            results: vec![None; skeleton.len() * MAX_HEADER_FETCH],
            ..HeaderFill::default()
        };
        for (index, header) in skeleton.into_iter().enumerate() {
            let start = from + (index * MAX_HEADER_FETCH) as u64;
            fill.tasks.insert(start, header);
            fill.queue.push(Reverse(start));
        }
        trace!(from, tasks = fill.tasks.len(), "scheduled skeleton fill");
    }

    /// True once every skeleton segment was delivered.
    pub fn header_fill_complete(&self) -> bool {
        self.state.lock().fill.tasks.is_empty()
    }

    /// True if queued segments remain that none of `peers` can be asked for.
    pub fn header_fill_unavailable(&self, peers: &[PeerId]) -> bool {
        let state = self.state.lock();
        let fill = &state.fill;
        if fill.queue.is_empty() || !fill.pending.is_empty() {
            return false;
        }
        peers.iter().all(|peer| {
            fill.peer_miss.get(peer).is_some_and(|misses| {
                fill.queue
                    .iter()
                    .all(|Reverse(from)| misses.contains(from))
            })
        })
    }

    /// Takes the filled headers and how many were already forwarded.
    pub fn retrieve_headers(&self) -> (Vec<SealedHeader>, usize) {
        let mut state = self.state.lock();
        let fill = std::mem::take(&mut state.fill);
        let filled = fill.results.into_iter().flatten().collect();
        (filled, fill.proced)
    }

    pub fn reserve_headers(&self, peer_id: PeerId) -> Option<Reservation> {
        let mut state = self.state.lock();
        if state.fill.pending.contains_key(&peer_id) {
            return None;
        }
        let fill = &mut state.fill;
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(Reverse(from)) = fill.queue.pop() {
            if fill
                .peer_miss
                .get(&peer_id)
                .is_some_and(|misses| misses.contains(&from))
            {
                skipped.push(from);
                continue;
            }
            found = Some(from);
            break;
        }
        for from in skipped {
            fill.queue.push(Reverse(from));
        }
        let from = found?;
        let reservation = Reservation {
            id: state.next_id(),
            peer_id,
            headers: Vec::new(),
            from,
            started: Instant::now(),
        };
        state.fill.pending.insert(peer_id, reservation.clone());
        Some(reservation)
    }

    /// Reserves up to `count` bodies or receipts for a peer, within the result
    /// cache window.
    pub fn reserve(&self, category: Category, peer_id: PeerId, count: usize) -> Option<Reservation> {
        let mut state = self.state.lock();
        let limit = state.result_offset + self.result_cache_limit;
        let id = state.next_id + 1;
        let tasks = state.tasks(category)?;
        if tasks.pending.contains_key(&peer_id) {
            return None;
        }
        let numbers: Vec<u64> = tasks.pool.range(..limit).take(count).map(|(n, _)| *n).collect();
        if numbers.is_empty() {
            return None;
        }
        let headers = numbers
            .iter()
            .filter_map(|number| tasks.pool.remove(number))
            .collect();
        let reservation = Reservation {
            id,
            peer_id,
            headers,
            from: numbers[0],
            started: Instant::now(),
        };
        tasks.pending.insert(peer_id, reservation.clone());
        state.next_id = id;
        Some(reservation)
    }

    /// Validates a skeleton fill and returns the newly contiguous prefix of
    /// filled headers.
    ///
    /// A fill must hold exactly one segment, link by parent hash, and end at
    /// the skeleton header. Stale deliveries are ignored.
    pub fn deliver_headers(
        &self,
        peer_id: PeerId,
        id: u64,
        headers: Vec<SealedHeader>,
    ) -> Result<Vec<SealedHeader>, SyncError> {
        let mut state = self.state.lock();
        let fill = &mut state.fill;
        match fill.pending.get(&peer_id) {
            Some(reservation) if reservation.id == id => {}
            _ => {
                trace!(peer_id = %peer_id, id, "ignoring stale header delivery");
                return Ok(Vec::new());
            }
        }
        let Some(reservation) = fill.pending.remove(&peer_id) else {
            return Ok(Vec::new());
        };
        let from = reservation.from;
        let Some(target) = fill.tasks.get(&from) else {
            return Ok(Vec::new());
        };
        if headers.is_empty() {
            trace!(peer_id = %peer_id, from, "peer has no headers for segment");
            fill.peer_miss.entry(peer_id).or_default().insert(from);
            fill.queue.push(Reverse(from));
            return Ok(Vec::new());
        }

        let valid = headers.len() == MAX_HEADER_FETCH
            && headers[0].number == from
            && headers.last().is_some_and(|last| last.hash == target.hash)
            && headers
                .windows(2)
                .all(|pair| pair[1].number == pair[0].number + 1 && pair[1].parent_hash == pair[0].hash);
        if !valid {
            fill.peer_miss.entry(peer_id).or_default().insert(from);
            fill.queue.push(Reverse(from));
            return Err(SyncError::BadPeer(format!(
                "invalid skeleton fill at #{from} ({} headers)",
                headers.len()
            )));
        }

        fill.tasks.remove(&from);
        let start = (from - fill.offset) as usize;
        for (index, header) in headers.into_iter().enumerate() {
            fill.results[start + index] = Some(header);
        }
        let mut ready = Vec::new();
        while let Some(Some(header)) = fill.results.get(fill.proced) {
            ready.push(header.clone());
            fill.proced += 1;
        }
        Ok(ready)
    }

    pub fn deliver_bodies(
        &self,
        peer_id: PeerId,
        id: u64,
        bodies: Vec<Body>,
    ) -> Result<usize, SyncError> {
        self.deliver_content(
            Category::Bodies,
            peer_id,
            id,
            bodies,
            |header, body| body.tx_root() == header.tx_root,
            FetchResult::set_body,
            SyncError::InvalidBody,
        )
    }

    pub fn deliver_receipts(
        &self,
        peer_id: PeerId,
        id: u64,
        receipts: Vec<Receipts>,
    ) -> Result<usize, SyncError> {
        self.deliver_content(
            Category::Receipts,
            peer_id,
            id,
            receipts,
            |header, receipts| receipts_root(receipts) == header.receipt_root,
            FetchResult::set_receipts,
            SyncError::InvalidReceipt,
        )
    }

    /// Merges a content delivery: items are matched to the reserved headers in
    /// order, unmatched headers go back to the pool.
    #[allow(clippy::too_many_arguments)]
    fn deliver_content<T>(
        &self,
        category: Category,
        peer_id: PeerId,
        id: u64,
        items: Vec<T>,
        verify: impl Fn(&SealedHeader, &T) -> bool,
        store: impl Fn(&mut FetchResult, T),
        invalid: impl Fn(String) -> SyncError,
    ) -> Result<usize, SyncError> {
        let mut state = self.state.lock();
        let QueueState {
            bodies,
            receipts,
            results,
            ..
        } = &mut *state;
        let tasks = match category {
            Category::Bodies => bodies,
            Category::Receipts => receipts,
            Category::Headers => return Ok(0),
        };
        let Some(reservation) = tasks.take(&peer_id, id) else {
            trace!(peer_id = %peer_id, id, category = category.as_str(), "ignoring stale delivery");
            return Ok(0);
        };

        let mut failure = None;
        let mut accepted = 0;
        if items.len() > reservation.headers.len() {
            failure = Some(invalid(format!(
                "{} items for {} requested",
                items.len(),
                reservation.headers.len()
            )));
        } else {
            for (header, item) in reservation.headers.iter().zip(items) {
                if !verify(header, &item) {
                    failure = Some(invalid(format!("root mismatch at #{}", header.number)));
                    break;
                }
                if let Some(result) = results.get_mut(&header.number) {
                    store(result, item);
                }
                accepted += 1;
            }
        }
        let missing: Vec<_> = reservation.headers[accepted..].to_vec();
        for header in missing {
            tasks.pool.insert(header.number, header);
        }
        let ready = state.ready();
        drop(state);
        if ready {
            self.ready.notify_waiters();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(accepted),
        }
    }

    /// Returns a reservation's work to the pool, e.g. after a failed request.
    pub fn cancel(&self, category: Category, peer_id: PeerId, id: u64) {
        let mut state = self.state.lock();
        match category {
            Category::Headers => {
                let fill = &mut state.fill;
                if fill.pending.get(&peer_id).is_some_and(|r| r.id == id) {
                    if let Some(reservation) = fill.pending.remove(&peer_id) {
                        fill.queue.push(Reverse(reservation.from));
                    }
                }
            }
            _ => {
                if let Some(tasks) = state.tasks(category) {
                    if let Some(reservation) = tasks.take(&peer_id, id) {
                        tasks.requeue(reservation);
                    }
                }
            }
        }
    }

    /// Revokes reservations older than `ttl` and returns the peers that held them.
    pub fn expire(&self, category: Category, ttl: Duration) -> Vec<PeerId> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired = |pending: &HashMap<PeerId, Reservation>| -> Vec<PeerId> {
            pending
                .iter()
                .filter(|(_, r)| now.duration_since(r.started) > ttl)
                .map(|(peer, _)| *peer)
                .collect()
        };
        match category {
            Category::Headers => {
                let fill = &mut state.fill;
                let peers = expired(&fill.pending);
                for peer in &peers {
                    if let Some(reservation) = fill.pending.remove(peer) {
                        fill.queue.push(Reverse(reservation.from));
                    }
                }
                peers
            }
            _ => {
                let Some(tasks) = state.tasks(category) else {
                    return Vec::new();
                };
                let peers = expired(&tasks.pending);
                for peer in &peers {
                    if let Some(reservation) = tasks.pending.remove(peer) {
                        tasks.requeue(reservation);
                    }
                }
                peers
            }
        }
    }

    /// Drops every reservation held by a departed peer.
    pub fn revoke(&self, peer_id: &PeerId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let fill = &mut state.fill;
        fill.peer_miss.remove(peer_id);
        if let Some(reservation) = fill.pending.remove(peer_id) {
            fill.queue.push(Reverse(reservation.from));
        }
        for tasks in [&mut state.bodies, &mut state.receipts] {
            if let Some(reservation) = tasks.pending.remove(peer_id) {
                tasks.requeue(reservation);
            }
        }
    }

    /// Schedules content retrieval for a contiguous header batch starting at
    /// `from`. Stops at the first header that breaks numbering, links to the
    /// wrong parent, or was already scheduled; returns the accepted prefix.
    pub fn schedule(&self, headers: &[SealedHeader], from: u64) -> Vec<SealedHeader> {
        let mut state = self.state.lock();
        let mut inserted = Vec::with_capacity(headers.len());
        for (index, header) in headers.iter().enumerate() {
            let want = from + index as u64;
            if header.number != want {
                warn!(number = header.number, want, "header broke chain ordering");
                break;
            }
            if let Some(head) = state.header_head {
                if header.parent_hash != head {
                    warn!(number = header.number, hash = %header.hash, "header broke chain ancestry");
                    break;
                }
            }
            if want < state.result_offset || state.results.contains_key(&want) {
                warn!(number = want, "header already scheduled");
                break;
            }
            let result = FetchResult::new(header.clone(), state.mode);
            if result.needs(Category::Bodies) {
                state.bodies.pool.insert(want, header.clone());
            }
            if result.needs(Category::Receipts) {
                state.receipts.pool.insert(want, header.clone());
            }
            state.results.insert(want, result);
            state.header_head = Some(header.hash);
            inserted.push(header.clone());
        }
        let ready = state.ready();
        drop(state);
        if ready {
            self.ready.notify_waiters();
        }
        inserted
    }

    /// Takes the longest complete prefix of results, up to `MAX_RESULTS_PROCESS`.
    ///
    /// With `block` set, waits until at least one result is ready or the queue
    /// is closed; an empty return then means no more results will come.
    pub async fn results(&self, block: bool) -> Vec<FetchResult> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                let taken = Self::take_ready(&mut state);
                if !taken.is_empty() || !block || state.closed {
                    return taken;
                }
            }
            notified.await;
        }
    }

    fn take_ready(state: &mut QueueState) -> Vec<FetchResult> {
        let mut taken = Vec::new();
        while taken.len() < MAX_RESULTS_PROCESS {
            let offset = state.result_offset;
            match state.results.first_entry() {
                Some(entry) if *entry.key() == offset && entry.get().is_complete() => {
                    taken.push(entry.remove());
                    state.result_offset += 1;
                }
                _ => break,
            }
        }
        taken
    }
}
