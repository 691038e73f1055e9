//! State download contract and the per-run state sync handle.

use crate::p2p::PeerId;
use alloy_primitives::{Bytes, B256};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StateSyncError {
    #[error("state sync cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error("unexpected response {id} from peer {peer}")]
    UnexpectedResponse { peer: PeerId, id: u64 },
}

/// Counters reported by the state downloader.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StateSyncProgress {
    pub accounts_synced: u64,
    pub accounts_bytes: u64,
    pub bytecodes_synced: u64,
    pub bytecodes_bytes: u64,
    pub storage_synced: u64,
    pub storage_bytes: u64,
    pub trienode_heal_synced: u64,
    pub trienode_heal_bytes: u64,
    pub bytecode_heal_synced: u64,
    pub bytecode_heal_bytes: u64,
    pub trienodes_pending: u64,
    pub bytecodes_pending: u64,
}

/// Downloads the state trie rooted at a pivot block.
#[async_trait]
pub trait StateSyncer: Send + Sync + 'static {
    /// Runs until the state at `root` is complete or `cancel` fires.
    async fn sync(&self, root: B256, cancel: CancellationToken) -> Result<(), StateSyncError>;

    fn progress(&self) -> StateSyncProgress;

    fn on_accounts(
        &self,
        peer: PeerId,
        id: u64,
        hashes: Vec<B256>,
        accounts: Vec<Bytes>,
        proof: Vec<Bytes>,
    ) -> Result<(), StateSyncError>;

    fn on_storage(
        &self,
        peer: PeerId,
        id: u64,
        hashes: Vec<Vec<B256>>,
        slots: Vec<Vec<Bytes>>,
        proof: Vec<Bytes>,
    ) -> Result<(), StateSyncError>;

    fn on_byte_codes(&self, peer: PeerId, id: u64, codes: Vec<Bytes>)
        -> Result<(), StateSyncError>;

    fn on_trie_nodes(&self, peer: PeerId, id: u64, nodes: Vec<Bytes>)
        -> Result<(), StateSyncError>;
}

/// Snap protocol response forwarded to the state downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapPacket {
    AccountRange {
        id: u64,
        accounts: Vec<(B256, Bytes)>,
        proof: Vec<Bytes>,
    },
    StorageRanges {
        id: u64,
        slots: Vec<Vec<(B256, Bytes)>>,
        proof: Vec<Bytes>,
    },
    ByteCodes {
        id: u64,
        codes: Vec<Bytes>,
    },
    TrieNodes {
        id: u64,
        nodes: Vec<Bytes>,
    },
}

impl SnapPacket {
    pub fn id(&self) -> u64 {
        match self {
            Self::AccountRange { id, .. }
            | Self::StorageRanges { id, .. }
            | Self::ByteCodes { id, .. }
            | Self::TrieNodes { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccountRange { .. } => "account_range",
            Self::StorageRanges { .. } => "storage_ranges",
            Self::ByteCodes { .. } => "byte_codes",
            Self::TrieNodes { .. } => "trie_nodes",
        }
    }

    /// Unpacks the packet and hands it to the matching syncer callback.
    pub fn deliver(self, syncer: &dyn StateSyncer, peer: PeerId) -> Result<(), StateSyncError> {
        match self {
            Self::AccountRange {
                id,
                accounts,
                proof,
            } => {
                let (hashes, accounts) = accounts.into_iter().unzip();
                syncer.on_accounts(peer, id, hashes, accounts, proof)
            }
            Self::StorageRanges { id, slots, proof } => {
                let (hashes, slots) = slots
                    .into_iter()
                    .map(|range| range.into_iter().unzip::<_, _, Vec<_>, Vec<_>>())
                    .unzip();
                syncer.on_storage(peer, id, hashes, slots, proof)
            }
            Self::ByteCodes { id, codes } => syncer.on_byte_codes(peer, id, codes),
            Self::TrieNodes { id, nodes } => syncer.on_trie_nodes(peer, id, nodes),
        }
    }
}

type Outcome = Option<Result<(), StateSyncError>>;

/// A running state download for one root.
#[derive(Debug)]
pub struct StateSync {
    root: B256,
    cancel: CancellationToken,
    done: watch::Receiver<Outcome>,
    task: JoinHandle<()>,
}

impl StateSync {
    /// Spawns `syncer` for `root`; `on_failure` runs if it fails for any
    /// reason other than cancellation.
    pub fn start<F>(
        syncer: Arc<dyn StateSyncer>,
        root: B256,
        parent: &CancellationToken,
        on_failure: F,
    ) -> Self
    where
        F: FnOnce(&StateSyncError) + Send + 'static,
    {
        let cancel = parent.child_token();
        let (done_tx, done) = watch::channel(None);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            debug!(root = %root, "state sync starting");
            let result = syncer.sync(root, token).await;
            debug!(root = %root, ok = result.is_ok(), "state sync finished");
            // Publish the outcome before the hook so woken waiters can read it.
            done_tx.send_replace(Some(result.clone()));
            if let Err(err) = &result {
                if *err != StateSyncError::Cancelled {
                    on_failure(err);
                }
            }
        });
        Self {
            root,
            cancel,
            done,
            task,
        }
    }

    pub fn root(&self) -> B256 {
        self.root
    }

    /// Outcome if the download already finished.
    pub fn finished(&self) -> Outcome {
        self.done.borrow().clone()
    }

    /// Waits for the download to finish.
    pub async fn wait(&mut self) -> Result<(), StateSyncError> {
        match self.done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(StateSyncError::Cancelled)),
            Err(_) => Err(StateSyncError::Cancelled),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the download and waits for its task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimStateSyncer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn completes_and_reports_outcome() {
        let syncer = Arc::new(SimStateSyncer::new(Duration::from_millis(5)));
        let parent = CancellationToken::new();
        let mut sync = StateSync::start(syncer.clone(), B256::repeat_byte(7), &parent, |_| {});
        assert_eq!(sync.wait().await, Ok(()));
        assert_eq!(sync.finished(), Some(Ok(())));
        assert_eq!(syncer.started_roots(), vec![B256::repeat_byte(7)]);
    }

    #[tokio::test]
    async fn parent_cancel_stops_sync_without_failure_hook() {
        let syncer = Arc::new(SimStateSyncer::new(Duration::from_secs(60)));
        let parent = CancellationToken::new();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let mut sync = StateSync::start(syncer, B256::ZERO, &parent, move |_| {
            flag.store(true, Ordering::SeqCst)
        });
        parent.cancel();
        assert_eq!(sync.wait().await, Err(StateSyncError::Cancelled));
        sync.shutdown().await;
        assert!(!failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failure_runs_hook() {
        let syncer = Arc::new(SimStateSyncer::new(Duration::ZERO));
        syncer.fail_root(B256::repeat_byte(1));
        let parent = CancellationToken::new();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let mut sync = StateSync::start(syncer, B256::repeat_byte(1), &parent, move |_| {
            flag.store(true, Ordering::SeqCst)
        });
        assert!(matches!(sync.wait().await, Err(StateSyncError::Failed(_))));
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn account_packets_unzip_into_callbacks() {
        let syncer = SimStateSyncer::new(Duration::ZERO);
        let packet = SnapPacket::AccountRange {
            id: 9,
            accounts: vec![
                (B256::repeat_byte(1), Bytes::from_static(b"a")),
                (B256::repeat_byte(2), Bytes::from_static(b"b")),
            ],
            proof: vec![],
        };
        assert_eq!(packet.id(), 9);
        packet
            .deliver(&syncer, PeerId::repeat_byte(3))
            .expect("deliver");
        assert_eq!(syncer.progress().accounts_synced, 2);
        assert_eq!(syncer.progress().accounts_bytes, 2);
    }
}
