//! Contiguous, hash-chained log of decided values.
//!
//! Instances may decide out of order. A decision is parked in `pending`
//! until every lower instance is decided, then published as a [`Block`]
//! chained to its predecessor. Readers only ever see the published prefix
//! `1..=len`, which never has holes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tessera_types::{Block, Hash, InstanceNumber, Value};
use tokio::sync::watch;

use crate::instrumentation::METRICS;

/// The replicated ledger as seen by one replica.
#[derive(Debug)]
pub struct Ledger {
    state: RwLock<LedgerState>,
    length: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    blocks: Vec<Block>,
    pending: BTreeMap<InstanceNumber, Value>,
    /// Value digest to the first published instance holding it.
    index: HashMap<Hash, InstanceNumber>,
}

impl LedgerState {
    fn len(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn tail_hash(&self) -> Hash {
        self.blocks.last().map_or(Hash::GENESIS, Block::hash)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        let (length, _) = watch::channel(0);
        Self {
            state: RwLock::new(LedgerState::default()),
            length,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of published, contiguous blocks.
    pub fn len(&self) -> u64 {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest instance that is neither published nor waiting to be.
    pub fn first_undecided(&self) -> InstanceNumber {
        let state = self.read();
        let mut next = InstanceNumber::new(state.len() + 1);
        while state.pending.contains_key(&next) {
            next = next.next();
        }
        next
    }

    /// Records the decision of `instance` and publishes every block that
    /// became contiguous. Returns how many blocks were published.
    ///
    /// Re-recording an instance is a no-op.
    pub fn record_decision(&self, instance: InstanceNumber, value: Value) -> u64 {
        let published = {
            let mut state = self.write();
            if instance.as_u64() <= state.len() {
                return 0;
            }
            if let Some(existing) = state.pending.get(&instance) {
                if *existing != value {
                    tracing::error!(
                        instance = %instance,
                        "instance decided twice with different values"
                    );
                }
                return 0;
            }
            state.pending.insert(instance, value);

            let before = state.len();
            loop {
                let next = InstanceNumber::new(state.len() + 1);
                let Some(value) = state.pending.remove(&next) else {
                    break;
                };
                let block = Block::new(next, state.tail_hash(), value);
                state.index.entry(block.value.digest()).or_insert(next);
                state.blocks.push(block);
            }
            state.len() - before
        };

        if published > 0 {
            let length = self.len();
            tracing::debug!(length, published, "ledger advanced");
            METRICS.set_ledger_length(length);
            self.length.send_replace(length);
        }
        published
    }

    /// Published blocks from `from` to the tail. Empty if `from` is past it.
    pub fn slice(&self, from: InstanceNumber) -> Vec<Block> {
        let state = self.read();
        let start = from.as_index().min(state.blocks.len());
        state.blocks[start..].to_vec()
    }

    pub fn block(&self, instance: InstanceNumber) -> Option<Block> {
        self.read().blocks.get(instance.as_index()).cloned()
    }

    /// First published instance holding a value with this digest.
    pub fn position_of(&self, digest: &Hash) -> Option<InstanceNumber> {
        self.read().index.get(digest).copied()
    }

    /// Instance holding this value, published or still waiting for a
    /// lower instance.
    pub fn decided_instance_of(&self, digest: &Hash) -> Option<InstanceNumber> {
        let state = self.read();
        state.index.get(digest).copied().or_else(|| {
            state
                .pending
                .iter()
                .find(|(_, value)| value.digest() == *digest)
                .map(|(instance, _)| *instance)
        })
    }

    /// Subscribes to the published length.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.length.subscribe()
    }

    /// Resolves once at least `length` blocks are published.
    pub async fn wait_for_length(&self, length: u64) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|published| *published >= length).await;
    }

    /// Resolves with the first published instance holding a value with
    /// this digest.
    pub async fn wait_for_value(&self, digest: &Hash) -> InstanceNumber {
        let mut rx = self.subscribe();
        loop {
            if let Some(instance) = self.position_of(digest) {
                return instance;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Checks the hash chain from genesis. Always true for a ledger built
    /// through [`Ledger::record_decision`].
    pub fn verify_chain(&self) -> bool {
        let state = self.read();
        let mut previous = Hash::GENESIS;
        for (index, block) in state.blocks.iter().enumerate() {
            if block.instance.as_index() != index || block.previous_hash != previous {
                return false;
            }
            previous = block.hash();
        }
        true
    }
}
