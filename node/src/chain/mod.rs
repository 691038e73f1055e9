//! Block data types and the local chain store contract.

pub mod memory;

use alloy_primitives::{b256, keccak256, Bytes, B256, U256};
use alloy_rlp::RlpEncodable;
use std::ops::Deref;

pub use memory::MemoryChain;

/// Hash of an RLP-encoded empty list: the root of an empty transaction or receipt set.
pub const EMPTY_LIST_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// Block header fields the synchroniser depends on.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable)]
pub struct Header {
    pub parent_hash: B256,
    pub number: u64,
    pub state_root: B256,
    pub tx_root: B256,
    pub receipt_root: B256,
    pub difficulty: U256,
    pub extra: Bytes,
}

impl Header {
    /// Keccak of the RLP encoding.
    pub fn hash_slow(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Hashes the header once and keeps the result.
    pub fn seal_slow(self) -> SealedHeader {
        let hash = self.hash_slow();
        SealedHeader { header: self, hash }
    }
}

/// Header paired with its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedHeader {
    pub header: Header,
    pub hash: B256,
}

impl SealedHeader {
    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// True when the header commits to no transactions.
    pub fn has_empty_body(&self) -> bool {
        self.header.tx_root == EMPTY_LIST_HASH
    }

    /// True when the header commits to no receipts.
    pub fn has_empty_receipts(&self) -> bool {
        self.header.receipt_root == EMPTY_LIST_HASH
    }
}

impl Deref for SealedHeader {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable)]
pub struct Body {
    pub transactions: Vec<Bytes>,
}

impl Body {
    pub fn tx_root(&self) -> B256 {
        keccak256(alloy_rlp::encode(&self.transactions))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable)]
pub struct Receipt {
    pub success: bool,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Bytes>,
}

pub type Receipts = Vec<Receipt>;

pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    let mut out = Vec::new();
    alloy_rlp::encode_list::<_, Receipt>(receipts, &mut out);
    keccak256(out)
}

/// A header together with the body it commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: SealedHeader,
    pub body: Body,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> B256 {
        self.header.hash
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("ancestor of block #{number} has not been verified yet")]
    AncestorNotVerified { index: usize, number: u64 },
    #[error("invalid block #{number} at index {index}: {reason}")]
    InvalidBlock {
        index: usize,
        number: u64,
        reason: String,
    },
    #[error("unknown block {hash}")]
    UnknownBlock { hash: B256 },
    /// A header the batch builds on vanished from the local chain mid-insert.
    #[error("header for hash not found ({hash})")]
    HeaderNotFound { hash: B256 },
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ChainError {
    /// Position of the offending block within the inserted batch.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::AncestorNotVerified { index, .. } | Self::InvalidBlock { index, .. } => {
                Some(*index)
            }
            _ => None,
        }
    }
}

/// Local chain database as seen by the synchroniser.
///
/// Three heads are tracked: the header chain, the full (state-executed) block
/// chain, and the snap chain of blocks stored with receipts but no state.
pub trait ChainStore: Send + Sync + 'static {
    fn has_header(&self, hash: B256, number: u64) -> bool;
    /// Body and state are both present.
    fn has_block(&self, hash: B256, number: u64) -> bool;
    /// Body and receipts are present, state may not be.
    fn has_fast_block(&self, hash: B256, number: u64) -> bool;
    fn header_by_hash(&self, hash: B256) -> Option<SealedHeader>;
    fn block_by_hash(&self, hash: B256) -> Option<Block>;
    /// Total difficulty up to and including the given block.
    fn td(&self, hash: B256, number: u64) -> Option<U256>;

    fn current_header(&self) -> SealedHeader;
    fn current_block(&self) -> SealedHeader;
    fn current_snap_block(&self) -> SealedHeader;

    fn insert_header_chain(&self, headers: &[SealedHeader]) -> Result<(), ChainError>;
    /// Executes and stores full blocks. The first block's parent must have state.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), ChainError>;
    /// Stores blocks with receipts and no state; blocks at or below
    /// `ancient_limit` go straight to the ancient store.
    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Receipts>,
        ancient_limit: u64,
    ) -> Result<(), ChainError>;
    /// Rewinds all heads to `number`.
    fn set_head(&self, number: u64) -> Result<(), ChainError>;
    /// Marks a snap-synced block as having full state and makes it the head.
    fn snap_sync_commit_head(&self, hash: B256) -> Result<(), ChainError>;

    /// First block still held in the ancient store.
    fn ancient_tail(&self) -> Result<u64, ChainError>;
    /// Number of the first block not yet frozen.
    fn ancients(&self) -> Result<u64, ChainError>;
    /// Count of items actually present in the ancient store.
    fn ancient_items(&self) -> Result<u64, ChainError>;

    fn pause_snapshots(&self);
    fn resume_snapshots(&self);

    fn write_last_pivot_number(&self, number: u64);
    fn last_pivot_number(&self) -> Option<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sets_hash_to_empty_list_root() {
        assert_eq!(Body::default().tx_root(), EMPTY_LIST_HASH);
        assert_eq!(receipts_root(&[]), EMPTY_LIST_HASH);
    }

    #[test]
    fn sealing_is_content_addressed() {
        let header = Header {
            number: 7,
            difficulty: U256::from(1),
            ..Header::default()
        };
        let sealed = header.clone().seal_slow();
        assert_eq!(sealed.hash(), header.hash_slow());

        let other = Header {
            extra: Bytes::from_static(b"fork"),
            ..header
        }
        .seal_slow();
        assert_ne!(sealed.hash(), other.hash());
        assert_eq!(other.number, 7);
    }
}
