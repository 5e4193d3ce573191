//! Authentication and certificate checks for inbound consensus messages.
//!
//! Everything that needs roster keys happens here, before a message
//! reaches the state machine. The state machine then only reasons about
//! protocol rules.

use std::collections::HashSet;

use tessera_types::{InstanceNumber, NodeId, Roster, Round, Value};

use crate::error::{ConsensusError, ConsensusResult};
use crate::message::{
    CommitCertificate, ConsensusMessage, PrePrepare, PreparedCertificate, SignedConsensus, Vote,
    highest_prepared,
};
use crate::quorum::Quorum;

/// Verifies signatures, embedded signatures and certificate structure.
pub struct MessageVerifier<'a> {
    roster: &'a Roster,
    quorum: Quorum,
}

impl<'a> MessageVerifier<'a> {
    pub fn new(roster: &'a Roster, quorum: Quorum) -> Self {
        Self { roster, quorum }
    }

    /// Full check of one inbound message.
    pub fn verify(&self, signed: &SignedConsensus) -> ConsensusResult<()> {
        self.verify_author(signed)?;
        match &signed.message {
            ConsensusMessage::PrePrepare(pp) => self.verify_pre_prepare(pp),
            ConsensusMessage::Prepare(_) | ConsensusMessage::Commit(_) => Ok(()),
            ConsensusMessage::RoundChange(rc) => match &rc.prepared {
                Some(cert) => self.verify_prepared(rc.instance, rc.round, cert),
                None => Ok(()),
            },
            ConsensusMessage::Decided(cert) => self.verify_commit_certificate(cert),
        }
    }

    /// Sender is a replica and the outer signature is valid.
    fn verify_author(&self, signed: &SignedConsensus) -> ConsensusResult<()> {
        let entry = self
            .roster
            .node(&signed.sender)
            .ok_or_else(|| ConsensusError::UnknownSender(signed.sender.clone()))?;
        signed.verify_signature(&entry.public_key)
    }

    fn verify_pre_prepare(&self, pp: &PrePrepare) -> ConsensusResult<()> {
        if pp.round == Round::FIRST {
            return if pp.justification.is_empty() {
                Ok(())
            } else {
                Err(ConsensusError::InvalidJustification(
                    "first-round proposal carries a justification",
                ))
            };
        }

        let mut senders = HashSet::new();
        for rc_signed in &pp.justification {
            let rc = rc_signed
                .as_round_change()
                .ok_or(ConsensusError::InvalidJustification(
                    "justification holds a non round-change message",
                ))?;
            if rc.instance != pp.instance || rc.round != pp.round {
                return Err(ConsensusError::InvalidJustification(
                    "round change does not match the proposal",
                ));
            }
            self.verify_author(rc_signed)?;
            if let Some(cert) = &rc.prepared {
                self.verify_prepared(rc.instance, rc.round, cert)?;
            }
            senders.insert(&rc_signed.sender);
        }
        if !self.quorum.is_reached(senders.len()) {
            return Err(ConsensusError::InvalidJustification(
                "round change justification below quorum",
            ));
        }

        if let Some(highest) = highest_prepared(&pp.justification)
            && highest.value != pp.value
        {
            return Err(ConsensusError::InvalidJustification(
                "proposal ignores the highest prepared value",
            ));
        }
        Ok(())
    }

    /// A prepared certificate attached to a ROUND_CHANGE for `rc_round`.
    fn verify_prepared(
        &self,
        instance: InstanceNumber,
        rc_round: Round,
        cert: &PreparedCertificate,
    ) -> ConsensusResult<()> {
        if cert.round >= rc_round {
            return Err(ConsensusError::InvalidJustification(
                "prepared round is not below the round change target",
            ));
        }
        self.verify_votes(
            &cert.prepares,
            instance,
            cert.round,
            &cert.value,
            SignedConsensus::as_prepare,
            "prepared certificate",
        )
    }

    fn verify_commit_certificate(&self, cert: &CommitCertificate) -> ConsensusResult<()> {
        self.verify_votes(
            &cert.commits,
            cert.instance,
            cert.round,
            &cert.value,
            SignedConsensus::as_commit,
            "commit certificate",
        )
    }

    /// A quorum of distinct, authentic votes of one kind for one
    /// (instance, round, value).
    fn verify_votes(
        &self,
        votes: &[SignedConsensus],
        instance: InstanceNumber,
        round: Round,
        value: &Value,
        extract: fn(&SignedConsensus) -> Option<&Vote>,
        what: &'static str,
    ) -> ConsensusResult<()> {
        let mut voters: HashSet<&NodeId> = HashSet::new();
        for signed in votes {
            let vote = extract(signed).ok_or(ConsensusError::InvalidJustification(
                "certificate holds the wrong vote kind",
            ))?;
            if vote.instance != instance || vote.round != round || vote.value != *value {
                return Err(ConsensusError::InvalidJustification(
                    "certificate vote does not match",
                ));
            }
            self.verify_author(signed)?;
            voters.insert(&signed.sender);
        }
        if self.quorum.is_reached(voters.len()) {
            Ok(())
        } else {
            tracing::debug!(what, voters = voters.len(), "certificate below quorum");
            Err(ConsensusError::InvalidJustification("certificate below quorum"))
        }
    }
}
