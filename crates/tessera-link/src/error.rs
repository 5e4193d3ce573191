//! Link error types.

use tessera_types::PeerId;
use thiserror::Error;

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors that can occur on a perfect link.
///
/// Inbound anomalies (`UnknownSender`, `AuthenticationFailure`, `Codec`)
/// are handled inside the listener: logged, counted and dropped. They are
/// only returned from the envelope helpers so the listener can classify.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Sender or destination is not in the roster.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Envelope signature did not verify against the sender's key.
    #[error("authentication failure for envelope from {0}")]
    AuthenticationFailure(PeerId),

    /// The signing key does not match the local roster entry.
    #[error("signing key does not match roster key of {0}")]
    KeyMismatch(PeerId),

    /// Encoded envelope does not fit in one datagram.
    #[error("envelope of {size} bytes exceeds datagram limit of {limit}")]
    Oversized { size: usize, limit: usize },

    /// I/O error from the datagram layer.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Link has been shut down.
    #[error("link closed")]
    Closed,
}
