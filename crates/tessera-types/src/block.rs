//! Ledger blocks.

use serde::{Deserialize, Serialize};
use tessera_crypto::{Hash, Hasher};

use crate::{InstanceNumber, Value};

/// One slot of the ledger: the value decided by a consensus instance,
/// chained to the block before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Instance that decided this block (its 1-based ledger position).
    pub instance: InstanceNumber,
    /// Hash of the previous block, [`Hash::GENESIS`] for instance 1.
    pub previous_hash: Hash,
    /// The decided value.
    pub value: Value,
}

impl Block {
    pub fn new(instance: InstanceNumber, previous_hash: Hash, value: Value) -> Self {
        Self {
            instance,
            previous_hash,
            value,
        }
    }

    /// Hash of this block, covering position, link and content.
    pub fn hash(&self) -> Hash {
        Hasher::new()
            .update(b"tessera.block.v1")
            .update(&self.instance.as_u64().to_le_bytes())
            .update(self.previous_hash.as_bytes())
            .update(self.value.as_bytes())
            .finalize()
    }

    /// Returns true if `self` is a valid successor of `previous`.
    pub fn follows(&self, previous: &Block) -> bool {
        self.instance == previous.instance.next() && self.previous_hash == previous.hash()
    }
}
