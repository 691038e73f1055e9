//! Sync failure taxonomy.

use crate::{chain::ChainError, state::StateSyncError};
use alloy_primitives::B256;

/// How a failed run is treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Attributable to the sync peer; the peer gets dropped.
    PeerFault,
    /// Run failed for a reason not worth a drop.
    Fatal,
    /// Expected outcome (busy or cancelled).
    Benign,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("busy")]
    Busy,
    #[error("peer is unknown or unhealthy")]
    UnknownPeer,
    #[error("peer is lagging behind the local chain")]
    LaggingPeer,
    #[error("action from bad peer ignored: {0}")]
    BadPeer(String),
    #[error("peer is stalling: {0}")]
    StallingPeer(String),
    #[error("unsynced peer")]
    UnsyncedPeer,
    #[error("no peers to keep download active")]
    NoPeers,
    #[error("timeout")]
    Timeout,
    #[error("empty header set by peer")]
    EmptyHeaderSet,
    #[error("no peers available or all tried for download")]
    PeersUnavailable,
    #[error("retrieved ancestor is invalid")]
    InvalidAncestor,
    #[error("retrieved hash chain is invalid: {0}")]
    InvalidChain(String),
    #[error("retrieved block body is invalid: {0}")]
    InvalidBody(String),
    #[error("retrieved receipt is invalid: {0}")]
    InvalidReceipt(String),
    #[error("retrieved hash chain is invalid: header for hash not found ({0})")]
    HeaderNotFound(B256),
    #[error("content processing canceled (requested)")]
    ContentProcessingCanceled,
    #[error("syncing canceled (requested)")]
    Canceled,
    #[error("peer's protocol version too old: {version}")]
    TooOld { version: u32 },
    #[error("no common ancestor found")]
    NoAncestorFound,
    #[error("peer is already registered")]
    AlreadyRegistered,
    #[error("peer is not registered")]
    NotRegistered,
    #[error("state sync failed: {0}")]
    StateSync(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("sync task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Busy | Self::Canceled => ErrorClass::Benign,
            Self::BadPeer(_)
            | Self::StallingPeer(_)
            | Self::LaggingPeer
            | Self::UnknownPeer
            | Self::UnsyncedPeer
            | Self::Timeout
            | Self::InvalidChain(_)
            | Self::EmptyHeaderSet
            | Self::PeersUnavailable
            | Self::TooOld { .. }
            | Self::InvalidAncestor => ErrorClass::PeerFault,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Maps a rejected chain insertion. A vanished local header is a race on
    /// our side, not bad data, so it keeps its own variant.
    pub(crate) fn insertion(err: ChainError) -> Self {
        match err {
            ChainError::HeaderNotFound { hash } => Self::HeaderNotFound(hash),
            other => Self::InvalidChain(other.to_string()),
        }
    }
}

impl From<StateSyncError> for SyncError {
    fn from(err: StateSyncError) -> Self {
        match err {
            StateSyncError::Cancelled => Self::Canceled,
            other => Self::StateSync(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_peer_faults() {
        assert_eq!(
            SyncError::StallingPeer("no headers".into()).class(),
            ErrorClass::PeerFault
        );
        assert_eq!(SyncError::Timeout.class(), ErrorClass::PeerFault);
        assert_eq!(
            SyncError::InvalidChain("gap".into()).class(),
            ErrorClass::PeerFault
        );
        assert_eq!(SyncError::TooOld { version: 65 }.class(), ErrorClass::PeerFault);
    }

    #[test]
    fn missing_local_header_on_insert_is_not_a_drop() {
        let hash = B256::repeat_byte(1);
        let err = SyncError::insertion(ChainError::HeaderNotFound { hash });
        assert!(matches!(err, SyncError::HeaderNotFound(h) if h == hash));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.to_string().contains("header for hash not found"));

        let err = SyncError::insertion(ChainError::UnknownBlock { hash });
        assert!(matches!(err, SyncError::InvalidChain(_)));
        assert_eq!(err.class(), ErrorClass::PeerFault);
    }

    #[test]
    fn chain_errors_pass_through() {
        let err: SyncError = ChainError::AncestorNotVerified {
            index: 3,
            number: 10,
        }
        .into();
        assert!(matches!(
            err,
            SyncError::Chain(ChainError::AncestorNotVerified { index: 3, .. })
        ));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(SyncError::Canceled.class(), ErrorClass::Benign);
        assert!(SyncError::from(StateSyncError::Cancelled).is_canceled());
    }
}
