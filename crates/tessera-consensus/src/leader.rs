//! Leader selection.
//!
//! The leader of `(instance, round)` must be a deterministic function of
//! its inputs so every correct replica agrees on it without communication.

use tessera_types::{InstanceNumber, Round};

/// Chooses the proposer for `(instance, round)` among `n` replicas.
pub trait LeaderPolicy: Send + Sync + 'static {
    /// Roster index of the leader. Must be `< n` for `n > 0`.
    fn leader_index(&self, instance: InstanceNumber, round: Round, n: usize) -> usize;
}

/// Rotates through the roster by instance, then by round.
///
/// `leader(i, r) = roster[(i - 1 + r - 1) mod n]`, so consecutive
/// instances start at different replicas and every round change hands
/// the proposal to the next one.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl LeaderPolicy for RoundRobin {
    fn leader_index(&self, instance: InstanceNumber, round: Round, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let offset = instance
            .as_u64()
            .saturating_sub(1)
            .wrapping_add(round.as_u64().saturating_sub(1));
        // n fits in u64 and the remainder is < n, so both casts are lossless.
        (offset % n as u64) as usize
    }
}
