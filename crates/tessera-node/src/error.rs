//! Node error types.

use tessera_consensus::ConsensusError;
use tessera_link::LinkError;
use tessera_types::ClientId;
use thiserror::Error;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Transport failure.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Engine refused the operation.
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Request from a client that is not in the roster.
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    /// Client signature does not verify.
    #[error("invalid signature on request from {0}")]
    InvalidSignature(ClientId),

    /// Link-authenticated sender differs from the identity in the message.
    #[error("sender {link} claims to be {claimed}")]
    SenderMismatch { link: String, claimed: String },

    /// Encoding a request as a consensus value failed.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}
