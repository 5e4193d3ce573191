//! Consensus tuning knobs.

use std::time::Duration;

use tessera_types::Round;

/// Engine and state machine settings.
#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    /// Length of round 1. Round `r` lasts `round_timeout * 2^(r-1)`.
    pub round_timeout: Duration,

    /// Cap on the doubling round length.
    pub max_round_timeout: Duration,

    /// How many instances above the ledger tail a peer may open.
    pub max_pending_instances: u64,

    /// Messages for rounds further ahead of the local round are ignored.
    pub max_round_lookahead: u64,

    /// Rounds beyond this are reported as a quorum-unreachable warning.
    pub round_change_warn_threshold: u64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(2),
            max_round_timeout: Duration::from_secs(30),
            max_pending_instances: 64,
            max_round_lookahead: 256,
            round_change_warn_threshold: 5,
        }
    }
}

impl ConsensusSettings {
    /// Timer length for `round`.
    pub fn round_duration(&self, round: Round) -> Duration {
        let exponent = u32::try_from(round.as_u64().saturating_sub(1))
            .unwrap_or(u32::MAX)
            .min(31);
        self.round_timeout
            .saturating_mul(1u32 << exponent)
            .min(self.max_round_timeout)
    }
}
