//! Round-change handlers: timeouts, ROUND_CHANGE, re-proposal.
//!
//! A round ends when its timer fires or when `f+1` replicas report being
//! in a later round. Either way this replica broadcasts ROUND_CHANGE with
//! its highest prepared certificate and moves on. The leader of the new
//! round proposes once it holds a quorum of ROUND_CHANGE messages,
//! re-proposing the highest prepared value among them if any.

use std::collections::BTreeSet;

use tessera_types::{NodeId, Round};

use crate::instrumentation::METRICS;
use crate::message::{
    ConsensusMessage, PrePrepare, RoundChange, SignedConsensus, highest_prepared,
};

use super::{InstanceContext, InstanceOutput, InstanceState, Phase};

impl InstanceState {
    // ========================================================================
    // Timeout
    // ========================================================================

    /// Round timer for `round` expired.
    ///
    /// Timers from earlier rounds are ignored; the engine may deliver them
    /// late after a rearm.
    pub fn on_timeout(mut self, ctx: &InstanceContext<'_>, round: Round) -> (Self, InstanceOutput) {
        let mut output = InstanceOutput::empty();
        if self.is_decided() || round != self.round || !self.timer_running {
            return (self, output);
        }

        tracing::info!(
            node = %ctx.local,
            instance = %self.instance,
            round = %self.round,
            phase = ?self.phase,
            "round timer expired"
        );

        let target = self.round.next();
        self.change_round(ctx, target, &mut output);
        self.try_propose(ctx, &mut output);
        (self, output)
    }

    /// Broadcasts ROUND_CHANGE for `target` and enters it.
    fn change_round(&mut self, ctx: &InstanceContext<'_>, target: Round, output: &mut InstanceOutput) {
        METRICS.increment_round_changes();

        if target.as_u64() > ctx.settings.round_change_warn_threshold {
            tracing::warn!(
                node = %ctx.local,
                instance = %self.instance,
                round = %target,
                "many consecutive round changes, a quorum may be unreachable"
            );
            METRICS.increment_quorum_unreachable_warnings();
        }

        output.broadcast(ConsensusMessage::RoundChange(RoundChange {
            instance: self.instance,
            round: target,
            prepared: self.prepared.clone(),
        }));
        self.enter_round(ctx, target, output);
    }

    // ========================================================================
    // RoundChange Handler
    // ========================================================================

    pub(crate) fn on_round_change(
        mut self,
        ctx: &InstanceContext<'_>,
        sender: NodeId,
        round: Round,
        signed: SignedConsensus,
    ) -> (Self, InstanceOutput) {
        let mut output = InstanceOutput::empty();

        if let Some(cert) = &self.decision {
            // A laggard is still trying; hand it the certificate.
            if sender != *ctx.local {
                tracing::debug!(
                    node = %ctx.local,
                    instance = %self.instance,
                    to = %sender,
                    "answering ROUND_CHANGE with DECIDED"
                );
                output.send_to(sender, ConsensusMessage::Decided(cert.clone()));
            }
            return (self, output);
        }

        if round < self.round {
            METRICS.increment_stale_messages();
            return (self, output);
        }

        let votes = self.round_changes.entry(round).or_default();
        if votes.contains_key(&sender) {
            return (self, output);
        }
        votes.insert(sender, signed);

        if round > self.round
            && let Some(target) = self.weak_round_quorum(ctx)
        {
            tracing::info!(
                node = %ctx.local,
                instance = %self.instance,
                from_round = %self.round,
                to_round = %target,
                "f+1 replicas moved ahead, joining them"
            );
            self.change_round(ctx, target, &mut output);
        }

        self.try_propose(ctx, &mut output);
        (self, output)
    }

    /// Smallest later round once `f+1` distinct replicas asked for rounds
    /// above ours.
    fn weak_round_quorum(&self, ctx: &InstanceContext<'_>) -> Option<Round> {
        let ahead = self.round_changes.range(self.round.next()..);
        let senders: BTreeSet<&NodeId> = ahead.clone().flat_map(|(_, votes)| votes.keys()).collect();
        if senders.len() < ctx.quorum.weak_size() {
            return None;
        }
        ahead
            .filter(|(_, votes)| !votes.is_empty())
            .map(|(round, _)| *round)
            .next()
    }

    // ========================================================================
    // Round entry and proposal
    // ========================================================================

    /// Moves to `round`, dropping proposal and prepare state from earlier
    /// rounds and rearming the timer. Commits are kept. A prepare quorum
    /// already collected for `round` takes effect immediately.
    pub(super) fn enter_round(
        &mut self,
        ctx: &InstanceContext<'_>,
        round: Round,
        output: &mut InstanceOutput,
    ) {
        debug_assert!(round > self.round, "rounds only move forward");

        self.round = round;
        self.accepted = None;
        if self.phase != Phase::Committed {
            self.phase = Phase::Idle;
        }

        self.round_changes = self.round_changes.split_off(&round);
        self.prepares.retain_from(round);
        self.arm_timer(ctx, output);

        let held = self
            .prepares
            .reached_in(round)
            .next()
            .map(|(_, prepares)| prepares.to_vec());
        if let Some(prepares) = held
            && let Some(value) = prepares
                .first()
                .and_then(SignedConsensus::as_prepare)
                .map(|vote| vote.value.clone())
        {
            self.on_prepare_quorum(ctx, round, value, prepares, output);
        }
    }

    /// Proposes if this replica leads the current round and has not yet.
    ///
    /// Round 1 proposes the input. Later rounds need a quorum of
    /// ROUND_CHANGE messages and propose the highest prepared value among
    /// them, falling back to the input.
    pub(super) fn try_propose(&mut self, ctx: &InstanceContext<'_>, output: &mut InstanceOutput) {
        if self.is_decided()
            || self.proposed == Some(self.round)
            || !ctx.is_leader(self.instance, self.round)
        {
            return;
        }

        let (value, justification) = if self.round == Round::FIRST {
            let Some(input) = &self.input else {
                return;
            };
            (input.clone(), Vec::new())
        } else {
            let Some(votes) = self.round_changes.get(&self.round) else {
                return;
            };
            if votes.len() < ctx.quorum.size() {
                return;
            }
            let justification: Vec<SignedConsensus> =
                votes.values().take(ctx.quorum.size()).cloned().collect();
            let value = match highest_prepared(&justification) {
                Some(cert) => cert.value.clone(),
                None => match &self.input {
                    Some(input) => input.clone(),
                    None => {
                        tracing::debug!(
                            node = %ctx.local,
                            instance = %self.instance,
                            round = %self.round,
                            "leading a round with nothing to propose"
                        );
                        return;
                    }
                },
            };
            (value, justification)
        };

        self.proposed = Some(self.round);
        tracing::info!(
            node = %ctx.local,
            instance = %self.instance,
            round = %self.round,
            value = ?value,
            justified_by = justification.len(),
            "proposing"
        );
        output.broadcast(ConsensusMessage::PrePrepare(PrePrepare {
            instance: self.instance,
            round: self.round,
            value,
            justification,
        }));
    }
}
