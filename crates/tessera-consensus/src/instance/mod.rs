//! Per-instance consensus state machine.
//!
//! [`InstanceState`] is pure: no I/O, no clocks, no randomness. Every
//! handler takes the state by value and returns the new state together
//! with an [`InstanceOutput`] describing messages to send, a decision and
//! timer commands. The engine executes the output.
//!
//! ```text
//!   Idle ──PRE_PREPARE──► PrePrepared ──q PREPARE──► Prepared ──q COMMIT──► Committed
//!     ▲                        │                         │
//!     └──── round timer / ROUND_CHANGE (round + 1) ──────┘
//! ```
//!
//! Messages handed to the state machine must already be authenticated
//! and have well-formed certificates (see [`crate::verify`]).

mod normal;
mod round_change;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::time::Duration;

use tessera_types::{InstanceNumber, NodeId, Round, Value};

use crate::leader::LeaderPolicy;
use crate::message::{CommitCertificate, ConsensusMessage, PreparedCertificate, SignedConsensus};
use crate::quorum::{Quorum, QuorumTracker};
use crate::settings::ConsensusSettings;
use crate::validator::ValueValidator;

// ============================================================================
// Context and output
// ============================================================================

/// Read-only environment shared by every instance of one engine.
pub struct InstanceContext<'a> {
    /// This replica.
    pub local: &'a NodeId,
    /// Replicas in roster order. Never empty.
    pub replicas: &'a [NodeId],
    pub quorum: Quorum,
    pub leader_policy: &'a dyn LeaderPolicy,
    pub validator: &'a dyn ValueValidator,
    pub settings: &'a ConsensusSettings,
}

impl InstanceContext<'_> {
    /// Leader of `(instance, round)`.
    pub fn leader(&self, instance: InstanceNumber, round: Round) -> &NodeId {
        let n = self.replicas.len();
        let index = self.leader_policy.leader_index(instance, round, n);
        &self.replicas[index % n]
    }

    pub fn is_leader(&self, instance: InstanceNumber, round: Round) -> bool {
        self.leader(instance, round) == self.local
    }
}

/// A message the engine should sign and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// `None` broadcasts to every replica, this one included.
    pub to: Option<NodeId>,
    pub message: ConsensusMessage,
}

/// Round timer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// (Re)arm the instance timer; fire `on_timeout(round)` after `after`.
    Arm { round: Round, after: Duration },
    /// Stop the instance timer for good.
    Cancel,
}

/// Result of one state transition.
#[derive(Debug, Default)]
pub struct InstanceOutput {
    pub messages: Vec<Outbound>,

    /// Set when this transition decided the instance.
    pub decided: Option<CommitCertificate>,

    /// Latest timer instruction, if any.
    pub timer: Option<TimerCommand>,
}

impl InstanceOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn broadcast(&mut self, message: ConsensusMessage) {
        self.messages.push(Outbound { to: None, message });
    }

    pub fn send_to(&mut self, to: NodeId, message: ConsensusMessage) {
        self.messages.push(Outbound {
            to: Some(to),
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.decided.is_none() && self.timer.is_none()
    }

    /// Merges a later output into this one. Later timer commands win.
    pub fn merge(&mut self, other: InstanceOutput) {
        self.messages.extend(other.messages);
        if other.decided.is_some() {
            self.decided = other.decided;
        }
        if other.timer.is_some() {
            self.timer = other.timer;
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Progress within the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PrePrepared,
    Prepared,
    Committed,
}

/// State of one consensus instance at one replica.
#[derive(Debug, Clone)]
pub struct InstanceState {
    instance: InstanceNumber,
    round: Round,
    phase: Phase,

    /// Value this replica would propose as leader.
    input: Option<Value>,

    /// Proposal accepted in the current round.
    accepted: Option<Value>,

    /// Highest round with a prepare quorum, with its proof.
    prepared: Option<PreparedCertificate>,

    /// Round in which this replica already sent COMMIT.
    commit_sent: Option<Round>,

    /// Round in which this replica already proposed as leader.
    proposed: Option<Round>,

    /// Whether a round timer is running.
    timer_running: bool,

    prepares: QuorumTracker<SignedConsensus>,
    commits: QuorumTracker<SignedConsensus>,
    round_changes: BTreeMap<Round, BTreeMap<NodeId, SignedConsensus>>,

    decision: Option<CommitCertificate>,
}

impl InstanceState {
    pub fn new(instance: InstanceNumber, quorum: Quorum) -> Self {
        Self {
            instance,
            round: Round::FIRST,
            phase: Phase::Idle,
            input: None,
            accepted: None,
            prepared: None,
            commit_sent: None,
            proposed: None,
            timer_running: false,
            prepares: QuorumTracker::new(quorum),
            commits: QuorumTracker::new(quorum),
            round_changes: BTreeMap::new(),
            decision: None,
        }
    }

    pub fn instance(&self) -> InstanceNumber {
        self.instance
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn prepared(&self) -> Option<&PreparedCertificate> {
        self.prepared.as_ref()
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn decision(&self) -> Option<&CommitCertificate> {
        self.decision.as_ref()
    }

    pub fn decided_value(&self) -> Option<&Value> {
        self.decision.as_ref().map(|cert| &cert.value)
    }

    /// Routes a verified message to its handler.
    pub fn on_message(
        self,
        ctx: &InstanceContext<'_>,
        signed: SignedConsensus,
    ) -> (Self, InstanceOutput) {
        if signed.message.instance() != self.instance {
            tracing::debug!(
                instance = %self.instance,
                got = %signed.message.instance(),
                "message routed to the wrong instance"
            );
            return (self, InstanceOutput::empty());
        }

        let horizon = self
            .round
            .as_u64()
            .saturating_add(ctx.settings.max_round_lookahead);
        if !matches!(signed.message, ConsensusMessage::Decided(_))
            && signed.message.round().as_u64() > horizon
        {
            tracing::debug!(
                instance = %self.instance,
                round = %self.round,
                from = %signed.sender,
                msg_round = %signed.message.round(),
                "ignoring message too far ahead"
            );
            return (self, InstanceOutput::empty());
        }

        let sender = signed.sender.clone();
        match &signed.message {
            ConsensusMessage::PrePrepare(pp) => {
                let pp = pp.clone();
                self.on_pre_prepare(ctx, &sender, pp)
            }
            ConsensusMessage::Prepare(vote) => {
                let vote = vote.clone();
                self.on_prepare(ctx, sender, vote, signed)
            }
            ConsensusMessage::Commit(vote) => {
                let vote = vote.clone();
                self.on_commit(sender, vote, signed)
            }
            ConsensusMessage::RoundChange(rc) => {
                let round = rc.round;
                self.on_round_change(ctx, sender, round, signed)
            }
            ConsensusMessage::Decided(cert) => {
                let cert = cert.clone();
                self.on_decided(cert)
            }
        }
    }

    fn arm_timer(&mut self, ctx: &InstanceContext<'_>, output: &mut InstanceOutput) {
        self.timer_running = true;
        output.timer = Some(TimerCommand::Arm {
            round: self.round,
            after: ctx.settings.round_duration(self.round),
        });
    }

    /// Starts the round timer if this instance was idle so far.
    fn activate(&mut self, ctx: &InstanceContext<'_>, output: &mut InstanceOutput) {
        if !self.timer_running && !self.is_decided() {
            self.arm_timer(ctx, output);
        }
    }
}
