//! Sequential block import for full sync.

use super::error::SyncError;
use super::types::FetchResult;
use super::SyncContext;
use crate::chain::ChainError;
use tracing::debug;

/// Imports completed results in order until the queue runs dry.
pub(crate) async fn process_full_sync_content(ctx: &SyncContext) -> Result<(), SyncError> {
    loop {
        let results = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(SyncError::Canceled),
            results = ctx.queue.results(true) => results,
        };
        if results.is_empty() {
            return Ok(());
        }
        import_block_results(ctx, results)?;
    }
}

/// Assembles results into blocks and inserts them into the chain.
pub(crate) fn import_block_results(
    ctx: &SyncContext,
    results: Vec<FetchResult>,
) -> Result<(), SyncError> {
    let (Some(first), Some(last)) = (results.first(), results.last()) else {
        return Ok(());
    };
    if ctx.quit.is_cancelled() {
        return Err(SyncError::ContentProcessingCanceled);
    }
    debug!(
        items = results.len(),
        first_num = first.number(),
        first_hash = %first.header.hash,
        last_num = last.number(),
        last_hash = %last.header.hash,
        "inserting downloaded chain"
    );
    let blocks = results.into_iter().map(FetchResult::into_block).collect();
    match ctx.chain.insert_chain(blocks) {
        Ok(()) => Ok(()),
        Err(err @ ChainError::AncestorNotVerified { .. }) => Err(err.into()),
        Err(err) => {
            debug!(index = ?err.index(), error = %err, "downloaded item processing failed");
            Err(SyncError::insertion(err))
        }
    }
}
