//! Per-sender record of delivered message ids.

use std::collections::BTreeSet;

use tessera_types::MessageId;

/// Set of message ids already delivered from one sender.
///
/// Ids are allocated densely from 1, so the set is stored as a watermark
/// (every id at or below it was seen) plus the sparse ids above it. Memory
/// stays proportional to the number of gaps, not to traffic.
#[derive(Debug, Default, Clone)]
pub struct SeenWindow {
    watermark: u64,
    above: BTreeSet<u64>,
}

impl SeenWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        let id = id.as_u64();
        id <= self.watermark || self.above.contains(&id)
    }

    /// Records `id`. Returns `false` if it was already recorded.
    pub fn insert(&mut self, id: MessageId) -> bool {
        let id = id.as_u64();
        if id <= self.watermark || !self.above.insert(id) {
            return false;
        }

        while self.above.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
        true
    }

    /// Ids above the watermark still tracked individually.
    pub fn sparse_len(&self) -> usize {
        self.above.len()
    }
}
