//! Client error types.

use tessera_link::LinkError;
use tessera_types::{InstanceNumber, Nonce};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// No `f+1` matching responses after every allowed attempt.
    #[error("no matching responses for nonce {nonce} after {attempts} attempts")]
    Timeout { nonce: Nonce, attempts: u32 },

    /// Accepted blocks do not extend the local view of the ledger.
    #[error("block {instance} does not extend the local ledger view")]
    ChainMismatch { instance: InstanceNumber },

    /// The link shut down while waiting.
    #[error("client link closed")]
    Closed,
}
