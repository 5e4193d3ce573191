//! Crypto error types.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors produced while decoding key material or checking signatures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key or signature bytes have the wrong length.
    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Key bytes are all zero.
    #[error("degenerate {0}: all bytes are zero")]
    Degenerate(&'static str),

    /// Public key bytes are not a valid curve point.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature did not verify against the message and key.
    #[error("signature verification failed")]
    InvalidSignature,
}
