//! In-memory chain store.

use super::{receipts_root, Block, Body, ChainError, ChainStore, Receipts, SealedHeader};
use alloy_primitives::{B256, U256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug)]
struct ChainState {
    headers: HashMap<B256, SealedHeader>,
    td: HashMap<B256, U256>,
    bodies: HashMap<B256, Body>,
    receipts: HashMap<B256, Receipts>,
    /// Blocks whose state is available locally.
    with_state: HashSet<B256>,
    canonical: BTreeMap<u64, B256>,
    head_header: B256,
    head_block: B256,
    head_snap: B256,
    frozen: u64,
    ancient_items: u64,
    ancient_tail: u64,
    snapshots_paused: bool,
    last_pivot: Option<u64>,
    imported: Vec<u64>,
    committed_heads: Vec<u64>,
}

impl ChainState {
    fn td_of(&self, hash: &B256) -> U256 {
        self.td.get(hash).copied().unwrap_or_default()
    }

    fn number_of(&self, hash: &B256) -> u64 {
        self.headers.get(hash).map_or(0, |header| header.number)
    }

    /// Rewrites the canonical index so that it ends at `hash`.
    fn set_canonical(&mut self, hash: B256) {
        let Some(head) = self.headers.get(&hash) else {
            return;
        };
        let head_number = head.number;
        let _ = self.canonical.split_off(&(head_number + 1));
        let mut cursor = Some(hash);
        while let Some(current) = cursor {
            let Some(header) = self.headers.get(&current) else {
                break;
            };
            if self.canonical.get(&header.number) == Some(&current) {
                break;
            }
            self.canonical.insert(header.number, current);
            cursor = (header.number > 0).then_some(header.parent_hash);
        }
    }

    fn store_header(&mut self, header: &SealedHeader) -> Result<U256, String> {
        if let Some(td) = self.td.get(&header.hash) {
            return Ok(*td);
        }
        let Some(parent) = self.headers.get(&header.parent_hash) else {
            return Err("unknown parent".to_string());
        };
        if parent.number + 1 != header.number {
            return Err(format!(
                "number {} does not follow parent {}",
                header.number, parent.number
            ));
        }
        let td = self.td_of(&header.parent_hash) + header.difficulty;
        self.headers.insert(header.hash, header.clone());
        self.td.insert(header.hash, td);
        Ok(td)
    }

    fn verify_body(block: &Block) -> Result<(), String> {
        if block.body.tx_root() != block.header.tx_root {
            return Err("transaction root mismatch".to_string());
        }
        Ok(())
    }
}

/// Chain store backed by hash maps.
///
/// Blocks are never executed: "importing" a full block records that its state
/// is present, so ancestry and head rules behave like a real database.
#[derive(Debug)]
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// Creates a store holding only `genesis`, with state.
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut canonical = BTreeMap::new();
        canonical.insert(genesis.number(), hash);
        let state = ChainState {
            headers: HashMap::from([(hash, genesis.header.clone())]),
            td: HashMap::from([(hash, genesis.header.difficulty)]),
            bodies: HashMap::from([(hash, genesis.body)]),
            receipts: HashMap::from([(hash, Receipts::new())]),
            with_state: HashSet::from([hash]),
            canonical,
            head_header: hash,
            head_block: hash,
            head_snap: hash,
            frozen: 0,
            ancient_items: 0,
            ancient_tail: 0,
            snapshots_paused: false,
            last_pivot: None,
            imported: Vec::new(),
            committed_heads: Vec::new(),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Seeds already-validated blocks with state, bypassing import bookkeeping.
    pub fn import_trusted(&self, blocks: Vec<(Block, Receipts)>) -> Result<(), ChainError> {
        let mut state = self.state.write();
        for (index, (block, receipts)) in blocks.into_iter().enumerate() {
            let td = state
                .store_header(&block.header)
                .map_err(|reason| ChainError::InvalidBlock {
                    index,
                    number: block.number(),
                    reason,
                })?;
            let hash = block.hash();
            state.bodies.insert(hash, block.body);
            state.receipts.insert(hash, receipts);
            state.with_state.insert(hash);
            if td > state.td_of(&state.head_block) {
                state.head_header = hash;
                state.head_block = hash;
                state.head_snap = hash;
                state.set_canonical(hash);
            }
        }
        Ok(())
    }

    /// Block numbers passed to the insert methods, in call order.
    pub fn imported_numbers(&self) -> Vec<u64> {
        self.state.read().imported.clone()
    }

    /// Blocks promoted via [`ChainStore::snap_sync_commit_head`].
    pub fn committed_heads(&self) -> Vec<u64> {
        self.state.read().committed_heads.clone()
    }

    pub fn snapshots_paused(&self) -> bool {
        self.state.read().snapshots_paused
    }

    pub fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.state.read().canonical.get(&number).copied()
    }

    /// Pretends blocks below `frozen` were moved to the ancient store.
    pub fn freeze(&self, frozen: u64) {
        let mut state = self.state.write();
        state.frozen = frozen;
        state.ancient_items = frozen;
    }

    /// Pretends history below `tail` was pruned away.
    pub fn prune(&self, tail: u64) {
        self.state.write().ancient_tail = tail;
    }
}

impl ChainStore for MemoryChain {
    fn has_header(&self, hash: B256, number: u64) -> bool {
        self.state
            .read()
            .headers
            .get(&hash)
            .is_some_and(|header| header.number == number)
    }

    fn has_block(&self, hash: B256, number: u64) -> bool {
        let state = self.state.read();
        state.with_state.contains(&hash)
            && state.headers.get(&hash).is_some_and(|h| h.number == number)
    }

    fn has_fast_block(&self, hash: B256, number: u64) -> bool {
        let state = self.state.read();
        state.receipts.contains_key(&hash)
            && state.headers.get(&hash).is_some_and(|h| h.number == number)
    }

    fn header_by_hash(&self, hash: B256) -> Option<SealedHeader> {
        self.state.read().headers.get(&hash).cloned()
    }

    fn block_by_hash(&self, hash: B256) -> Option<Block> {
        let state = self.state.read();
        let header = state.headers.get(&hash)?.clone();
        let body = state.bodies.get(&hash)?.clone();
        Some(Block { header, body })
    }

    fn td(&self, hash: B256, number: u64) -> Option<U256> {
        let state = self.state.read();
        let header = state.headers.get(&hash)?;
        if header.number != number {
            return None;
        }
        state.td.get(&hash).copied()
    }

    fn current_header(&self) -> SealedHeader {
        let state = self.state.read();
        state.headers[&state.head_header].clone()
    }

    fn current_block(&self) -> SealedHeader {
        let state = self.state.read();
        state.headers[&state.head_block].clone()
    }

    fn current_snap_block(&self) -> SealedHeader {
        let state = self.state.read();
        state.headers[&state.head_snap].clone()
    }

    fn insert_header_chain(&self, headers: &[SealedHeader]) -> Result<(), ChainError> {
        let mut state = self.state.write();
        for (index, header) in headers.iter().enumerate() {
            let td = state
                .store_header(header)
                .map_err(|reason| ChainError::InvalidBlock {
                    index,
                    number: header.number,
                    reason,
                })?;
            if td > state.td_of(&state.head_header) {
                state.head_header = header.hash;
                state.set_canonical(header.hash);
            }
        }
        Ok(())
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), ChainError> {
        let mut state = self.state.write();
        for (index, block) in blocks.into_iter().enumerate() {
            let number = block.number();
            let invalid = |reason: String| ChainError::InvalidBlock {
                index,
                number,
                reason,
            };
            let parent = block.header.parent_hash;
            if !state.headers.contains_key(&parent) {
                return Err(invalid("unknown ancestor".to_string()));
            }
            if !state.with_state.contains(&parent) {
                return Err(ChainError::AncestorNotVerified { index, number });
            }
            ChainState::verify_body(&block).map_err(invalid)?;
            let td = state.store_header(&block.header).map_err(invalid)?;

            let hash = block.hash();
            state.bodies.insert(hash, block.body);
            state.receipts.entry(hash).or_default();
            state.with_state.insert(hash);
            state.imported.push(number);

            if td > state.td_of(&state.head_block) {
                state.head_block = hash;
                if number > state.number_of(&state.head_snap) {
                    state.head_snap = hash;
                }
                if td >= state.td_of(&state.head_header) {
                    state.head_header = hash;
                }
                state.set_canonical(hash);
            }
        }
        Ok(())
    }

    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Receipts>,
        ancient_limit: u64,
    ) -> Result<(), ChainError> {
        if blocks.len() != receipts.len() {
            return Err(ChainError::Storage(format!(
                "{} blocks with {} receipt sets",
                blocks.len(),
                receipts.len()
            )));
        }
        let mut state = self.state.write();
        for (index, (block, receipts)) in blocks.into_iter().zip(receipts).enumerate() {
            let number = block.number();
            let invalid = |reason: String| ChainError::InvalidBlock {
                index,
                number,
                reason,
            };
            let parent = block.header.parent_hash;
            if number > 0 && !state.headers.contains_key(&parent) {
                return Err(ChainError::HeaderNotFound { hash: parent });
            }
            ChainState::verify_body(&block).map_err(invalid)?;
            if receipts_root(&receipts) != block.header.receipt_root {
                return Err(invalid("receipt root mismatch".to_string()));
            }
            state.store_header(&block.header).map_err(invalid)?;

            let hash = block.hash();
            if state.receipts.contains_key(&hash) {
                continue;
            }
            state.bodies.insert(hash, block.body);
            state.receipts.insert(hash, receipts);
            state.imported.push(number);
            if number <= ancient_limit {
                state.frozen = state.frozen.max(number + 1);
                state.ancient_items += 1;
            }
            if number > state.number_of(&state.head_snap) {
                state.head_snap = hash;
            }
        }
        Ok(())
    }

    fn set_head(&self, number: u64) -> Result<(), ChainError> {
        let mut state = self.state.write();
        let Some(target) = state.canonical.get(&number).copied() else {
            return Err(ChainError::Storage(format!("no canonical block #{number}")));
        };
        let _ = state.canonical.split_off(&(number + 1));
        let rewound: Vec<B256> = state
            .headers
            .values()
            .filter(|header| header.number > number)
            .map(|header| header.hash)
            .collect();
        for hash in &rewound {
            state.with_state.remove(hash);
        }
        if state.number_of(&state.head_header) > number {
            state.head_header = target;
        }
        if state.number_of(&state.head_snap) > number {
            state.head_snap = target;
        }
        if state.number_of(&state.head_block) > number {
            // Newest canonical block at or below the target that still has state.
            let mut head = target;
            while !state.with_state.contains(&head) {
                let Some(header) = state.headers.get(&head) else {
                    break;
                };
                if header.number == 0 {
                    break;
                }
                head = header.parent_hash;
            }
            state.head_block = head;
        }
        if state.frozen > number + 1 {
            state.ancient_items = state.ancient_items.saturating_sub(state.frozen - number - 1);
            state.frozen = number + 1;
        }
        Ok(())
    }

    fn snap_sync_commit_head(&self, hash: B256) -> Result<(), ChainError> {
        let mut state = self.state.write();
        if !state.bodies.contains_key(&hash) {
            return Err(ChainError::UnknownBlock { hash });
        }
        let number = state.number_of(&hash);
        state.with_state.insert(hash);
        state.head_block = hash;
        if number >= state.number_of(&state.head_snap) {
            state.head_snap = hash;
        }
        state.set_canonical(hash);
        state.committed_heads.push(number);
        Ok(())
    }

    fn ancient_tail(&self) -> Result<u64, ChainError> {
        Ok(self.state.read().ancient_tail)
    }

    fn ancients(&self) -> Result<u64, ChainError> {
        Ok(self.state.read().frozen)
    }

    fn ancient_items(&self) -> Result<u64, ChainError> {
        Ok(self.state.read().ancient_items)
    }

    fn pause_snapshots(&self) {
        self.state.write().snapshots_paused = true;
    }

    fn resume_snapshots(&self) {
        self.state.write().snapshots_paused = false;
    }

    fn write_last_pivot_number(&self, number: u64) {
        self.state.write().last_pivot = Some(number);
    }

    fn last_pivot_number(&self) -> Option<u64> {
        self.state.read().last_pivot
    }
}
