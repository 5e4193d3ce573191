//! Consensus error types.
//!
//! Every variant describes why an inbound message was not applied. None of
//! them is fatal: the engine logs, counts and drops.

use tessera_types::{InstanceNumber, NodeId};
use thiserror::Error;

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Author is not a replica in the roster.
    #[error("unknown sender: {0}")]
    UnknownSender(NodeId),

    /// Signature on the message or on an embedded vote is invalid.
    #[error("authentication failure for message from {0}")]
    AuthenticationFailure(NodeId),

    /// Message for an instance that is already published to the ledger.
    #[error("stale message for decided instance {0}")]
    StaleMessage(InstanceNumber),

    /// Instance is zero or too far ahead of the ledger tail.
    #[error("instance {instance} outside window (ledger length {ledger_length}, window {window})")]
    OutsideWindow {
        instance: InstanceNumber,
        ledger_length: u64,
        window: u64,
    },

    /// A certificate or round-change justification is malformed.
    #[error("invalid justification: {0}")]
    InvalidJustification(&'static str),

    /// Local identity or key does not match the roster.
    #[error("local replica {0} is not in the roster or its key does not match")]
    NotAReplica(NodeId),

    /// The engine was built outside a tokio runtime.
    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("engine is shut down")]
    ShutDown,

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}
