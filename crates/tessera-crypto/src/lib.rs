//! # tessera-crypto: signing and hashing for Tessera
//!
//! The consensus core treats cryptography as two black boxes:
//!
//! - `sign(bytes, key) -> signature` ([`SigningKey::sign`])
//! - `verify(bytes, signature, public_key) -> bool` ([`VerifyingKey::verify`])
//!
//! Both are Ed25519 (`ed25519-dalek`, strict RFC 8032 verification). Block
//! chaining and vote bucketing use BLAKE3 digests ([`Hash`]).
//!
//! Key generation exists for tests and local tooling only. Production keys
//! are supplied by configuration.

mod error;
mod hash;
mod signature;

pub use error::{CryptoError, CryptoResult};
pub use hash::{HASH_LENGTH, Hash, Hasher};
pub use signature::{SIGNATURE_LENGTH, Signature, SigningKey, VerifyingKey};
