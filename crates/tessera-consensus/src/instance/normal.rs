//! Normal-case handlers: start, PRE_PREPARE, PREPARE, COMMIT.

use tessera_types::{NodeId, Round, Value};

use crate::instrumentation::METRICS;
use crate::message::{
    CommitCertificate, ConsensusMessage, PrePrepare, PreparedCertificate, SignedConsensus, Vote,
};
use crate::quorum::Tally;

use super::{InstanceContext, InstanceOutput, InstanceState, Phase, TimerCommand};

impl InstanceState {
    // ========================================================================
    // Start
    // ========================================================================

    /// Gives this replica an input value and starts the protocol.
    ///
    /// The first input sticks; later calls only (re)activate the instance.
    /// The round-1 leader proposes immediately.
    pub fn start(mut self, ctx: &InstanceContext<'_>, value: Value) -> (Self, InstanceOutput) {
        let mut output = InstanceOutput::empty();
        if self.is_decided() {
            return (self, output);
        }

        if self.input.is_none() {
            tracing::debug!(
                node = %ctx.local,
                instance = %self.instance,
                value = ?value,
                "starting instance"
            );
            self.input = Some(value);
            METRICS.increment_instances_started();
        }

        self.activate(ctx, &mut output);
        self.try_propose(ctx, &mut output);
        (self, output)
    }

    // ========================================================================
    // PrePrepare Handler
    // ========================================================================

    /// Handles a proposal.
    ///
    /// Accepted only from the leader of its round, only once per round and
    /// only for a value the validator accepts. A proposal for a later round
    /// carries its own justification and moves this replica there.
    pub(crate) fn on_pre_prepare(
        mut self,
        ctx: &InstanceContext<'_>,
        sender: &NodeId,
        pp: PrePrepare,
    ) -> (Self, InstanceOutput) {
        let mut output = InstanceOutput::empty();

        if self.is_decided() || pp.round < self.round {
            METRICS.increment_stale_messages();
            return (self, output);
        }

        if ctx.leader(self.instance, pp.round) != sender {
            tracing::warn!(
                node = %ctx.local,
                instance = %self.instance,
                round = %pp.round,
                from = %sender,
                leader = %ctx.leader(self.instance, pp.round),
                "rejecting PRE_PREPARE from a replica that does not lead this round"
            );
            METRICS.increment_non_leader_proposals();
            return (self, output);
        }

        if !ctx.validator.is_valid(&pp.value) {
            tracing::warn!(
                node = %ctx.local,
                instance = %self.instance,
                round = %pp.round,
                from = %sender,
                "rejecting PRE_PREPARE with an invalid value"
            );
            METRICS.increment_invalid_values();
            return (self, output);
        }

        if pp.round > self.round {
            tracing::info!(
                node = %ctx.local,
                instance = %self.instance,
                from_round = %self.round,
                to_round = %pp.round,
                "justified proposal for a later round, following leader"
            );
            self.enter_round(ctx, pp.round, &mut output);
        }

        if let Some(accepted) = &self.accepted {
            if *accepted != pp.value {
                tracing::warn!(
                    node = %ctx.local,
                    instance = %self.instance,
                    round = %self.round,
                    from = %sender,
                    "leader proposed two values in one round"
                );
                METRICS.increment_equivocations();
            }
            return (self, output);
        }

        self.accepted = Some(pp.value.clone());
        if self.phase == Phase::Idle {
            self.phase = Phase::PrePrepared;
        }
        self.activate(ctx, &mut output);

        tracing::debug!(
            node = %ctx.local,
            instance = %self.instance,
            round = %self.round,
            value = ?pp.value,
            "accepted PRE_PREPARE"
        );
        output.broadcast(ConsensusMessage::Prepare(Vote {
            instance: self.instance,
            round: self.round,
            value: pp.value,
        }));
        (self, output)
    }

    // ========================================================================
    // Prepare Handler
    // ========================================================================

    /// Counts a PREPARE. The first quorum for the current round prepares
    /// this replica and sends COMMIT.
    pub(crate) fn on_prepare(
        mut self,
        ctx: &InstanceContext<'_>,
        sender: NodeId,
        vote: Vote,
        signed: SignedConsensus,
    ) -> (Self, InstanceOutput) {
        let mut output = InstanceOutput::empty();

        if self.is_decided() || vote.round < self.round {
            METRICS.increment_stale_messages();
            return (self, output);
        }

        let tally = self
            .prepares
            .record(vote.round, vote.value.digest(), sender.clone(), signed);
        match tally {
            Tally::Reached(prepares) if vote.round == self.round => {
                self.on_prepare_quorum(ctx, vote.round, vote.value, prepares, &mut output);
            }
            Tally::Reached(_) => {
                tracing::debug!(
                    node = %ctx.local,
                    instance = %self.instance,
                    round = %vote.round,
                    "prepare quorum for a later round, held until we get there"
                );
            }
            Tally::Equivocation => {
                tracing::warn!(
                    node = %ctx.local,
                    instance = %self.instance,
                    round = %vote.round,
                    from = %sender,
                    "replica sent conflicting PREPAREs"
                );
                METRICS.increment_equivocations();
            }
            Tally::Pending(_) | Tally::AlreadyReached | Tally::Duplicate => {}
        }

        (self, output)
    }

    pub(super) fn on_prepare_quorum(
        &mut self,
        ctx: &InstanceContext<'_>,
        round: Round,
        value: Value,
        prepares: Vec<SignedConsensus>,
        output: &mut InstanceOutput,
    ) {
        if self.prepared.as_ref().is_none_or(|cert| cert.round < round) {
            self.prepared = Some(PreparedCertificate {
                round,
                value: value.clone(),
                prepares,
            });
        }
        if self.phase != Phase::Committed {
            self.phase = Phase::Prepared;
        }

        if self.commit_sent != Some(round) {
            self.commit_sent = Some(round);
            tracing::debug!(
                node = %ctx.local,
                instance = %self.instance,
                round = %round,
                "prepared, sending COMMIT"
            );
            output.broadcast(ConsensusMessage::Commit(Vote {
                instance: self.instance,
                round,
                value,
            }));
        }
        self.activate(ctx, output);
    }

    // ========================================================================
    // Commit Handler
    // ========================================================================

    /// Counts a COMMIT. A quorum for any round decides, including rounds
    /// this replica has already left: `q` signed COMMITs are the same
    /// evidence a DECIDED certificate carries.
    pub(crate) fn on_commit(
        mut self,
        sender: NodeId,
        vote: Vote,
        signed: SignedConsensus,
    ) -> (Self, InstanceOutput) {
        let mut output = InstanceOutput::empty();

        if self.is_decided() {
            METRICS.increment_stale_messages();
            return (self, output);
        }

        let tally = self
            .commits
            .record(vote.round, vote.value.digest(), sender.clone(), signed);
        match tally {
            Tally::Reached(commits) => {
                let cert = CommitCertificate {
                    instance: self.instance,
                    round: vote.round,
                    value: vote.value,
                    commits,
                };
                self.decide(cert, &mut output);
            }
            Tally::Equivocation => {
                tracing::warn!(
                    instance = %self.instance,
                    round = %vote.round,
                    from = %sender,
                    "replica sent conflicting COMMITs"
                );
                METRICS.increment_equivocations();
            }
            Tally::Pending(_) | Tally::AlreadyReached | Tally::Duplicate => {}
        }

        (self, output)
    }

    // ========================================================================
    // Decision
    // ========================================================================

    /// Terminal transition. The certificate is kept to answer laggards.
    pub(super) fn decide(&mut self, cert: CommitCertificate, output: &mut InstanceOutput) {
        tracing::info!(
            instance = %self.instance,
            round = %cert.round,
            value = ?cert.value,
            "instance decided"
        );

        self.phase = Phase::Committed;
        self.timer_running = false;
        output.decided = Some(cert.clone());
        output.timer = Some(TimerCommand::Cancel);
        self.decision = Some(cert);

        // Only the certificate is needed from here on.
        self.prepares.clear();
        self.commits.clear();
        self.round_changes.clear();

        METRICS.increment_decisions();
    }

    /// Adopts a peer's commit certificate.
    pub(crate) fn on_decided(mut self, cert: CommitCertificate) -> (Self, InstanceOutput) {
        let mut output = InstanceOutput::empty();
        if self.is_decided() {
            METRICS.increment_stale_messages();
            return (self, output);
        }

        tracing::info!(
            instance = %self.instance,
            round = %self.round,
            "catching up through a peer's commit certificate"
        );
        self.decide(cert, &mut output);
        (self, output)
    }
}
