//! BLAKE3 digests.
//!
//! Used to chain ledger blocks and to bucket consensus votes by value
//! without cloning whole values into every vote set.

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

/// Length of a digest in bytes.
pub const HASH_LENGTH: usize = 32;

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash, used as the previous hash of the first block.
    pub const GENESIS: Hash = Hash([0u8; HASH_LENGTH]);

    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Hashes `data` in one shot.
    pub fn digest(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Returns the digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Returns true for the genesis (all-zero) hash.
    pub fn is_genesis(&self) -> bool {
        self.0 == [0u8; HASH_LENGTH]
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// Incremental hasher for multi-part inputs.
///
/// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` produce
/// different digests.
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Hasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Feeds one length-prefixed part.
    pub fn update(&mut self, part: &[u8]) -> &mut Self {
        self.inner.update(&(part.len() as u64).to_le_bytes());
        self.inner.update(part);
        self
    }

    /// Finishes and returns the digest.
    pub fn finalize(&self) -> Hash {
        Hash(self.inner.finalize().into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
