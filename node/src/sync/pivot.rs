//! Snap sync content processing around a moving pivot block.
//!
//! Blocks below the pivot are committed with their receipts only, the pivot
//! waits for its state download to finish, and everything above it is
//! imported in full.

use super::error::SyncError;
use super::import::import_block_results;
use super::types::{FetchResult, FS_MIN_FULL_BLOCKS, REORG_PROT_HEADER_DELAY};
use super::SyncContext;
use crate::chain::SealedHeader;
use crate::state::StateSync;
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// The current pivot header. It only ever moves forward.
#[derive(Debug, Default)]
pub(crate) struct PivotCell {
    inner: RwLock<Option<SealedHeader>>,
}

impl PivotCell {
    pub(crate) fn get(&self) -> Option<SealedHeader> {
        self.inner.read().clone()
    }

    /// Pivot block number, zero when there is none.
    pub(crate) fn number(&self) -> u64 {
        self.inner.read().as_ref().map_or(0, |pivot| pivot.number)
    }

    /// Replaces the pivot if `next` is higher; returns whether it moved.
    pub(crate) fn advance(&self, next: SealedHeader) -> bool {
        let mut pivot = self.inner.write();
        if pivot.as_ref().is_some_and(|current| current.number >= next.number) {
            return false;
        }
        *pivot = Some(next);
        true
    }
}

/// Index of the result that should become the new pivot, if the current one
/// has fallen too far behind the newest result.
pub(crate) fn stale_pivot_index(pivot: u64, results: &[FetchResult]) -> Option<usize> {
    let latest = results.last()?.number();
    if latest < pivot + 2 * FS_MIN_FULL_BLOCKS - REORG_PROT_HEADER_DELAY {
        return None;
    }
    results
        .len()
        .checked_sub(1 + (FS_MIN_FULL_BLOCKS - REORG_PROT_HEADER_DELAY) as usize)
}

/// Splits ordered results into those below, at, and above the pivot.
pub(crate) fn split_around_pivot(
    pivot: u64,
    results: Vec<FetchResult>,
) -> (Option<FetchResult>, Vec<FetchResult>, Vec<FetchResult>) {
    let mut at = None;
    let mut before = Vec::new();
    let mut after = Vec::new();
    for result in results {
        match result.number().cmp(&pivot) {
            std::cmp::Ordering::Less => before.push(result),
            std::cmp::Ordering::Equal => at = Some(result),
            std::cmp::Ordering::Greater => after.push(result),
        }
    }
    (at, before, after)
}

/// Starts a state download; a failure closes the queue so blocked result
/// waits return.
pub(crate) fn start_state_sync(ctx: &SyncContext, root: B256) -> StateSync {
    let queue = ctx.queue.clone();
    StateSync::start(ctx.state.clone(), root, &ctx.cancel, move |err| {
        warn!(root = %root, error = %err, "state sync failed");
        queue.close();
    })
}

async fn restart_state_sync(ctx: &SyncContext, sync: &mut StateSync, root: B256) {
    debug!(old = %sync.root(), new = %root, "restarting state sync for new pivot");
    let old = std::mem::replace(sync, start_state_sync(ctx, root));
    old.shutdown().await;
}

/// Drives snap sync content until the pivot is committed and every later
/// result is imported.
pub(crate) async fn process_snap_sync_content(ctx: &SyncContext) -> Result<(), SyncError> {
    let Some(pivot) = ctx.pivot.get() else {
        return Err(SyncError::InvalidChain("snap sync without pivot".to_string()));
    };
    let mut sync = start_state_sync(ctx, pivot.state_root);
    let result = snap_content_loop(ctx, &mut sync).await;
    sync.shutdown().await;
    result
}

async fn snap_content_loop(ctx: &SyncContext, sync: &mut StateSync) -> Result<(), SyncError> {
    let mut old_pivot: Option<FetchResult> = None;
    let mut old_tail: Vec<FetchResult> = Vec::new();

    loop {
        let mut results = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(SyncError::Canceled),
            results = ctx.queue.results(old_pivot.is_none()) => results,
        };
        if results.is_empty() {
            if ctx.committed() {
                report_snap_progress(ctx, true);
                return Ok(());
            }
            if ctx.cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }
        }

        let Some(mut pivot) = ctx.pivot.get() else {
            return Err(SyncError::InvalidChain("snap sync without pivot".to_string()));
        };
        match old_pivot.take() {
            None => {
                if !ctx.committed() && pivot.state_root != sync.root() {
                    restart_state_sync(ctx, sync, pivot.state_root).await;
                }
            }
            Some(parked) => {
                let mut merged = Vec::with_capacity(1 + old_tail.len() + results.len());
                merged.push(parked);
                merged.append(&mut old_tail);
                merged.append(&mut results);
                results = merged;
            }
        }
        if results.is_empty() {
            if let Some(Err(err)) = sync.finished() {
                return Err(err.into());
            }
            return Err(SyncError::InvalidChain(
                "content ended before pivot block".to_string(),
            ));
        }

        if !ctx.committed() {
            if let Some(index) = stale_pivot_index(pivot.number, &results) {
                let next = results[index].header.clone();
                warn!(old = pivot.number, new = next.number, "pivot became stale, moving");
                let number = next.number;
                if ctx.pivot.advance(next.clone()) {
                    ctx.chain.write_last_pivot_number(number);
                    pivot = next;
                }
            }
        }

        let (at, before, after) = split_around_pivot(pivot.number, results);
        commit_snap_sync_data(ctx, before, sync)?;
        report_snap_progress(ctx, false);

        if let Some(at) = at {
            if sync.root() != at.header.state_root {
                restart_state_sync(ctx, sync, at.header.state_root).await;
            }
            tokio::select! {
                outcome = sync.wait() => {
                    outcome?;
                    commit_pivot_block(ctx, at)?;
                }
                _ = tokio::time::sleep(ctx.config.state_sync_check()) => {
                    old_pivot = Some(at);
                    old_tail = after;
                    continue;
                }
                _ = ctx.cancel.cancelled() => return Err(SyncError::Canceled),
            }
        }
        import_block_results(ctx, after)?;
    }
}

/// Writes blocks below the pivot together with their receipts, without
/// executing them.
pub(crate) fn commit_snap_sync_data(
    ctx: &SyncContext,
    results: Vec<FetchResult>,
    sync: &StateSync,
) -> Result<(), SyncError> {
    let (Some(first), Some(last)) = (results.first(), results.last()) else {
        return Ok(());
    };
    if ctx.quit.is_cancelled() {
        return Err(SyncError::ContentProcessingCanceled);
    }
    if let Some(Err(err)) = sync.finished() {
        return Err(err.into());
    }
    debug!(
        items = results.len(),
        first_num = first.number(),
        first_hash = %first.header.hash,
        last_num = last.number(),
        last_hash = %last.header.hash,
        "inserting snap-sync blocks"
    );
    let (blocks, receipts) = results.into_iter().map(FetchResult::into_parts).unzip();
    ctx.chain
        .insert_receipt_chain(blocks, receipts, ctx.ancient_limit())
        .map_err(|err| {
            debug!(index = ?err.index(), error = %err, "downloaded item processing failed");
            SyncError::insertion(err)
        })
}

/// Writes the pivot block and makes it the chain head.
pub(crate) fn commit_pivot_block(ctx: &SyncContext, result: FetchResult) -> Result<(), SyncError> {
    let (block, receipts) = result.into_parts();
    let (number, hash) = (block.number(), block.hash());
    debug!(number, hash = %hash, "committing snap sync pivot as new head");
    ctx.chain
        .insert_receipt_chain(vec![block], vec![receipts], ctx.ancient_limit())?;
    ctx.chain.snap_sync_commit_head(hash)?;
    if ctx
        .committed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        ctx.chain.resume_snapshots();
    }
    Ok(())
}

/// Logs chain download progress at most once per report interval.
pub(crate) fn report_snap_progress(ctx: &SyncContext, force: bool) {
    let header = ctx.chain.current_header();
    let block = ctx.chain.current_snap_block();
    let origin = ctx.stats.origin();
    let synced = block.number.saturating_sub(origin);
    if synced == 0 {
        return;
    }
    let Some(elapsed) = ctx
        .stats
        .report_due(force, ctx.config.progress_log_interval())
    else {
        return;
    };
    let height = ctx.stats.height().max(block.number);
    let total = height.saturating_sub(origin).max(1);
    let left = height - block.number;
    let eta = elapsed.mul_f64(left as f64 / synced as f64);
    info!(
        synced = format!("{:.2}%", synced as f64 * 100.0 / total as f64),
        headers = header.number,
        bodies = block.number,
        pivot = ctx.pivot.number(),
        eta = ?eta,
        "syncing: chain download in progress"
    );
}
