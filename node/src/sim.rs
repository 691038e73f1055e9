//! Deterministic simulated chains, peers and state downloads.

use crate::chain::{Block, Body, Header, MemoryChain, Receipt, Receipts, SealedHeader};
use crate::p2p::{PeerId, RequestError, SyncPeer};
use crate::state::{StateSyncError, StateSyncProgress, StateSyncer};
use alloy_primitives::{keccak256, Bytes, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

const BLOCK_DIFFICULTY: u64 = 2;
const TX_GAS: u64 = 21_000;

/// A linear chain of blocks with receipts, generated from a seed.
///
/// Chains built from different seeds share only the genesis block.
#[derive(Debug, Clone)]
pub struct SimChain {
    blocks: Vec<Block>,
    receipts: Vec<Receipts>,
    td: Vec<U256>,
    numbers: HashMap<B256, u64>,
}

impl SimChain {
    pub fn new(len: u64, seed: u64) -> Self {
        let genesis = Header {
            number: 0,
            state_root: keccak256(b"genesis"),
            tx_root: Body::default().tx_root(),
            receipt_root: crate::chain::receipts_root(&[]),
            difficulty: U256::from(BLOCK_DIFFICULTY),
            extra: Bytes::from_static(b"genesis"),
            ..Header::default()
        }
        .seal_slow();
        let mut chain = Self {
            blocks: Vec::new(),
            receipts: Vec::new(),
            td: Vec::new(),
            numbers: HashMap::new(),
        };
        chain.push(
            Block {
                header: genesis,
                body: Body::default(),
            },
            Receipts::new(),
        );
        chain.extend(len, seed);
        chain
    }

    /// Shares blocks `0..=at` with this chain, then continues to `len` from `seed`.
    pub fn fork(&self, at: u64, len: u64, seed: u64) -> Self {
        let mut chain = self.truncated(at);
        chain.extend(len, seed);
        chain
    }

    /// The prefix ending at block `len`.
    pub fn truncated(&self, len: u64) -> Self {
        let keep = (len as usize + 1).min(self.blocks.len());
        let blocks = self.blocks[..keep].to_vec();
        let numbers = blocks.iter().map(|block| (block.hash(), block.number())).collect();
        Self {
            receipts: self.receipts[..keep].to_vec(),
            td: self.td[..keep].to_vec(),
            blocks,
            numbers,
        }
    }

    fn extend(&mut self, len: u64, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        while self.height() < len {
            let parent = self.head().clone();
            let number = parent.number + 1;
            let (body, receipts) = if number % 5 == 0 {
                (Body::default(), Receipts::new())
            } else {
                random_content(&mut rng)
            };
            let header = Header {
                parent_hash: parent.hash,
                number,
                state_root: keccak256([seed.to_be_bytes(), number.to_be_bytes()].concat()),
                tx_root: body.tx_root(),
                receipt_root: crate::chain::receipts_root(&receipts),
                difficulty: U256::from(BLOCK_DIFFICULTY),
                extra: Bytes::copy_from_slice(&seed.to_be_bytes()),
            }
            .seal_slow();
            self.push(Block { header, body }, receipts);
        }
    }

    fn push(&mut self, block: Block, receipts: Receipts) {
        let td = self.td.last().copied().unwrap_or_default() + block.header.difficulty;
        self.numbers.insert(block.hash(), block.number());
        self.td.push(td);
        self.receipts.push(receipts);
        self.blocks.push(block);
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn head(&self) -> &SealedHeader {
        &self.blocks[self.blocks.len() - 1].header
    }

    pub fn block(&self, number: u64) -> &Block {
        &self.blocks[number as usize]
    }

    pub fn header(&self, number: u64) -> &SealedHeader {
        &self.block(number).header
    }

    pub fn receipts(&self, number: u64) -> &Receipts {
        &self.receipts[number as usize]
    }

    /// Total difficulty up to and including block `number`.
    pub fn td(&self, number: u64) -> U256 {
        self.td[number as usize]
    }

    pub fn number_of(&self, hash: &B256) -> Option<u64> {
        self.numbers.get(hash).copied()
    }

    fn get(&self, number: u64) -> Option<usize> {
        (number <= self.height()).then_some(number as usize)
    }

    /// A store holding blocks `0..=number` of this chain, all with state.
    pub fn to_store(&self, number: u64) -> MemoryChain {
        let store = MemoryChain::new(self.block(0).clone());
        let seeded = (1..=number.min(self.height()))
            .map(|n| (self.block(n).clone(), self.receipts(n).clone()))
            .collect();
        if let Err(err) = store.import_trusted(seeded) {
            error!(error = %err, "failed to seed simulated chain");
        }
        store
    }
}

fn random_content(rng: &mut StdRng) -> (Body, Receipts) {
    let count = rng.gen_range(1..=3);
    let transactions: Vec<Bytes> = (0..count)
        .map(|_| {
            let len = rng.gen_range(8..32);
            Bytes::from((0..len).map(|_| rng.gen()).collect::<Vec<u8>>())
        })
        .collect();
    let receipts = (1..=count as u64)
        .map(|index| Receipt {
            success: true,
            cumulative_gas_used: index * TX_GAS,
            logs: Vec::new(),
        })
        .collect();
    (Body { transactions }, receipts)
}

/// A well-behaved peer serving a [`SimChain`], with knobs for misbehaviour.
#[derive(Debug)]
pub struct SimPeer {
    id: PeerId,
    chain: Arc<SimChain>,
    announced: Option<u64>,
    withhold_above: Option<u64>,
    latency: Duration,
    header_requests: AtomicUsize,
    lagging: AtomicBool,
}

impl SimPeer {
    pub fn new(id: PeerId, chain: Arc<SimChain>) -> Self {
        Self {
            id,
            chain,
            announced: None,
            withhold_above: None,
            latency: Duration::ZERO,
            header_requests: AtomicUsize::new(0),
            lagging: AtomicBool::new(false),
        }
    }

    /// Advertises block `number` as head while still serving the whole chain.
    pub fn announce(mut self, number: u64) -> Self {
        self.announced = Some(number);
        self
    }

    /// Refuses by-number header requests above `number`.
    pub fn withhold_above(mut self, number: u64) -> Self {
        self.withhold_above = Some(number);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn header_requests(&self) -> usize {
        self.header_requests.load(Ordering::Relaxed)
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Relaxed)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn collect_headers(
        &self,
        origin: u64,
        amount: usize,
        skip: usize,
        reverse: bool,
        limit: u64,
    ) -> Vec<Header> {
        let step = skip as u64 + 1;
        let mut headers = Vec::with_capacity(amount);
        let mut next = Some(origin);
        while let Some(number) = next {
            if headers.len() == amount || number > limit {
                break;
            }
            let Some(index) = self.chain.get(number) else {
                break;
            };
            headers.push(self.chain.blocks[index].header.header.clone());
            next = if reverse {
                number.checked_sub(step)
            } else {
                number.checked_add(step)
            };
        }
        headers
    }
}

#[async_trait]
impl SyncPeer for SimPeer {
    fn head(&self) -> (B256, U256) {
        let number = self.announced.unwrap_or_else(|| self.chain.height());
        (self.chain.header(number).hash, self.chain.td(number))
    }

    async fn request_headers_by_hash(
        &self,
        origin: B256,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<Vec<Header>, RequestError> {
        self.header_requests.fetch_add(1, Ordering::Relaxed);
        self.delay().await;
        let Some(number) = self.chain.number_of(&origin) else {
            return Ok(Vec::new());
        };
        Ok(self.collect_headers(number, amount, skip, reverse, u64::MAX))
    }

    async fn request_headers_by_number(
        &self,
        origin: u64,
        amount: usize,
        skip: usize,
        reverse: bool,
    ) -> Result<Vec<Header>, RequestError> {
        self.header_requests.fetch_add(1, Ordering::Relaxed);
        self.delay().await;
        let limit = self.withhold_above.unwrap_or(u64::MAX);
        Ok(self.collect_headers(origin, amount, skip, reverse, limit))
    }

    async fn request_bodies(&self, hashes: Vec<B256>) -> Result<Vec<Body>, RequestError> {
        self.delay().await;
        Ok(hashes
            .iter()
            .map_while(|hash| self.chain.number_of(hash))
            .map(|number| self.chain.block(number).body.clone())
            .collect())
    }

    async fn request_receipts(&self, hashes: Vec<B256>) -> Result<Vec<Receipts>, RequestError> {
        self.delay().await;
        Ok(hashes
            .iter()
            .map_while(|hash| self.chain.number_of(hash))
            .map(|number| self.chain.receipts(number).clone())
            .collect())
    }

    fn mark_lagging(&self) {
        self.lagging.store(true, Ordering::Relaxed);
    }
}

/// State downloader that completes after a fixed delay unless told otherwise.
#[derive(Debug)]
pub struct SimStateSyncer {
    delay: Duration,
    failing: Mutex<HashSet<B256>>,
    hanging: Mutex<HashSet<B256>>,
    started: Mutex<Vec<B256>>,
    progress: Mutex<StateSyncProgress>,
}

impl SimStateSyncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing: Mutex::default(),
            hanging: Mutex::default(),
            started: Mutex::default(),
            progress: Mutex::default(),
        }
    }

    /// Makes downloads of `root` fail straight away.
    pub fn fail_root(&self, root: B256) {
        self.failing.lock().insert(root);
    }

    /// Makes downloads of `root` run until cancelled.
    pub fn hang_root(&self, root: B256) {
        self.hanging.lock().insert(root);
    }

    /// Roots passed to `sync`, in call order.
    pub fn started_roots(&self) -> Vec<B256> {
        self.started.lock().clone()
    }
}

fn byte_len(items: &[Bytes]) -> u64 {
    items.iter().map(|item| item.len() as u64).sum()
}

#[async_trait]
impl StateSyncer for SimStateSyncer {
    async fn sync(&self, root: B256, cancel: CancellationToken) -> Result<(), StateSyncError> {
        self.started.lock().push(root);
        if self.failing.lock().contains(&root) {
            return Err(StateSyncError::Failed(format!("state root {root} unavailable")));
        }
        if self.hanging.lock().contains(&root) {
            cancel.cancelled().await;
            return Err(StateSyncError::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(()),
            _ = cancel.cancelled() => Err(StateSyncError::Cancelled),
        }
    }

    fn progress(&self) -> StateSyncProgress {
        *self.progress.lock()
    }

    fn on_accounts(
        &self,
        _peer: PeerId,
        _id: u64,
        _hashes: Vec<B256>,
        accounts: Vec<Bytes>,
        _proof: Vec<Bytes>,
    ) -> Result<(), StateSyncError> {
        let mut progress = self.progress.lock();
        progress.accounts_synced += accounts.len() as u64;
        progress.accounts_bytes += byte_len(&accounts);
        Ok(())
    }

    fn on_storage(
        &self,
        _peer: PeerId,
        _id: u64,
        _hashes: Vec<Vec<B256>>,
        slots: Vec<Vec<Bytes>>,
        _proof: Vec<Bytes>,
    ) -> Result<(), StateSyncError> {
        let mut progress = self.progress.lock();
        for range in &slots {
            progress.storage_synced += range.len() as u64;
            progress.storage_bytes += byte_len(range);
        }
        Ok(())
    }

    fn on_byte_codes(
        &self,
        _peer: PeerId,
        _id: u64,
        codes: Vec<Bytes>,
    ) -> Result<(), StateSyncError> {
        let mut progress = self.progress.lock();
        progress.bytecodes_synced += codes.len() as u64;
        progress.bytecodes_bytes += byte_len(&codes);
        Ok(())
    }

    fn on_trie_nodes(
        &self,
        _peer: PeerId,
        _id: u64,
        nodes: Vec<Bytes>,
    ) -> Result<(), StateSyncError> {
        let mut progress = self.progress.lock();
        progress.trienode_heal_synced += nodes.len() as u64;
        progress.trienode_heal_bytes += byte_len(&nodes);
        Ok(())
    }
}
