//! Consensus protocol messages.
//!
//! ## Normal case
//! - [`ConsensusMessage::PrePrepare`] - Leader → All: proposal for (instance, round)
//! - [`ConsensusMessage::Prepare`] - All → All: I accepted this proposal
//! - [`ConsensusMessage::Commit`] - All → All: I saw a prepare quorum
//!
//! ## Round change
//! - [`ConsensusMessage::RoundChange`] - All → All: move to this round, here is
//!   what I prepared so far
//! - [`ConsensusMessage::Decided`] - Replica → lagging replica: this instance
//!   is already decided, here is the commit certificate
//!
//! Every message travels as a [`SignedConsensus`]. The signature is
//! independent of the link envelope so votes can be forwarded inside
//! certificates and justifications and still be attributed to their author.

use serde::{Deserialize, Serialize};
use tessera_crypto::{SigningKey, VerifyingKey};
use tessera_types::{InstanceNumber, NodeId, Round, Value};

use crate::error::{ConsensusError, ConsensusResult};

/// Domain separator for consensus signatures.
const SIGNING_DOMAIN: &str = "tessera/consensus/v1";

// ============================================================================
// Message kinds
// ============================================================================

/// Message kind tag, used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    RoundChange,
    Decided,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::PrePrepare,
        MessageKind::Prepare,
        MessageKind::Commit,
        MessageKind::RoundChange,
        MessageKind::Decided,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::PrePrepare => "PRE_PREPARE",
            MessageKind::Prepare => "PREPARE",
            MessageKind::Commit => "COMMIT",
            MessageKind::RoundChange => "ROUND_CHANGE",
            MessageKind::Decided => "DECIDED",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Leader proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub instance: InstanceNumber,
    pub round: Round,
    pub value: Value,
    /// Empty in round 1. Otherwise a quorum of signed ROUND_CHANGE messages
    /// for `round`.
    pub justification: Vec<SignedConsensus>,
}

/// PREPARE or COMMIT vote. Carries the full value so a replica that missed
/// the proposal can still commit and decide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub instance: InstanceNumber,
    pub round: Round,
    pub value: Value,
}

/// Request to move `instance` to `round`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundChange {
    pub instance: InstanceNumber,
    pub round: Round,
    /// The sender's highest prepared round and value, with proof.
    pub prepared: Option<PreparedCertificate>,
}

/// Quorum of signed PREPAREs for one (instance, round, value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub round: Round,
    pub value: Value,
    pub prepares: Vec<SignedConsensus>,
}

/// Quorum of signed COMMITs for one (instance, round, value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCertificate {
    pub instance: InstanceNumber,
    pub round: Round,
    pub value: Value,
    pub commits: Vec<SignedConsensus>,
}

/// Closed set of consensus messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    PrePrepare(PrePrepare),
    Prepare(Vote),
    Commit(Vote),
    RoundChange(RoundChange),
    Decided(CommitCertificate),
}

impl ConsensusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConsensusMessage::PrePrepare(_) => MessageKind::PrePrepare,
            ConsensusMessage::Prepare(_) => MessageKind::Prepare,
            ConsensusMessage::Commit(_) => MessageKind::Commit,
            ConsensusMessage::RoundChange(_) => MessageKind::RoundChange,
            ConsensusMessage::Decided(_) => MessageKind::Decided,
        }
    }

    pub fn instance(&self) -> InstanceNumber {
        match self {
            ConsensusMessage::PrePrepare(pp) => pp.instance,
            ConsensusMessage::Prepare(vote) | ConsensusMessage::Commit(vote) => vote.instance,
            ConsensusMessage::RoundChange(rc) => rc.instance,
            ConsensusMessage::Decided(cert) => cert.instance,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            ConsensusMessage::PrePrepare(pp) => pp.round,
            ConsensusMessage::Prepare(vote) | ConsensusMessage::Commit(vote) => vote.round,
            ConsensusMessage::RoundChange(rc) => rc.round,
            ConsensusMessage::Decided(cert) => cert.round,
        }
    }
}

// ============================================================================
// Signed wrapper
// ============================================================================

/// A consensus message with its author's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConsensus {
    pub sender: NodeId,
    pub message: ConsensusMessage,
    pub signature: Vec<u8>,
}

impl SignedConsensus {
    /// Signs `message` as `sender`.
    pub fn sign(
        sender: NodeId,
        message: ConsensusMessage,
        key: &SigningKey,
    ) -> ConsensusResult<Self> {
        let bytes = signing_bytes(&sender, &message)?;
        let signature = key.sign(&bytes).to_vec();
        Ok(Self {
            sender,
            message,
            signature,
        })
    }

    /// Checks only this message's own signature, not embedded ones.
    pub fn verify_signature(&self, key: &VerifyingKey) -> ConsensusResult<()> {
        let bytes = signing_bytes(&self.sender, &self.message)?;
        key.verify_bytes(&bytes, &self.signature)
            .map_err(|_| ConsensusError::AuthenticationFailure(self.sender.clone()))
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// The vote, if this is a PREPARE.
    pub fn as_prepare(&self) -> Option<&Vote> {
        match &self.message {
            ConsensusMessage::Prepare(vote) => Some(vote),
            _ => None,
        }
    }

    /// The vote, if this is a COMMIT.
    pub fn as_commit(&self) -> Option<&Vote> {
        match &self.message {
            ConsensusMessage::Commit(vote) => Some(vote),
            _ => None,
        }
    }

    pub fn as_round_change(&self) -> Option<&RoundChange> {
        match &self.message {
            ConsensusMessage::RoundChange(rc) => Some(rc),
            _ => None,
        }
    }
}

fn signing_bytes(sender: &NodeId, message: &ConsensusMessage) -> ConsensusResult<Vec<u8>> {
    Ok(postcard::to_allocvec(&(SIGNING_DOMAIN, sender, message))?)
}

/// Highest prepared certificate carried by a set of ROUND_CHANGE messages.
///
/// Ties on round keep the first certificate seen. Quorum intersection
/// guarantees tied certificates carry the same value.
pub fn highest_prepared<'a>(
    round_changes: impl IntoIterator<Item = &'a SignedConsensus>,
) -> Option<&'a PreparedCertificate> {
    let mut highest: Option<&PreparedCertificate> = None;
    for cert in round_changes
        .into_iter()
        .filter_map(SignedConsensus::as_round_change)
        .filter_map(|rc| rc.prepared.as_ref())
    {
        if highest.is_none_or(|best| cert.round > best.round) {
            highest = Some(cert);
        }
    }
    highest
}
