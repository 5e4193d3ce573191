//! Ed25519 digital signatures.
//!
//! Thin wrappers around `ed25519-dalek` that keep key material out of
//! `Debug` output and report failures as [`CryptoError`] instead of
//! panicking on malformed input from the network.

use ed25519_dalek::Signer;
use rand::rngs::OsRng;

use crate::{CryptoError, CryptoResult};

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of an Ed25519 secret seed or public key in bytes.
const KEY_LENGTH: usize = 32;

// -----------------------------------------------------------------------------
// Signing key
// -----------------------------------------------------------------------------

/// Ed25519 signing (private) key.
#[derive(Clone)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

// Manual Debug implementation to avoid exposing key material
impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("inner", &"<redacted>")
            .finish()
    }
}

impl SigningKey {
    /// Generates a new signing key from system randomness.
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Creates a signing key from a 32-byte seed.
    ///
    /// Rejects the all-zero seed, which only ever shows up as a
    /// configuration mistake.
    pub fn from_bytes(bytes: &[u8; KEY_LENGTH]) -> CryptoResult<Self> {
        if bytes == &[0u8; KEY_LENGTH] {
            return Err(CryptoError::Degenerate("signing key seed"));
        }
        Ok(Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        })
    }

    /// Creates a signing key from a seed slice of unchecked length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let seed: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    what: "signing key seed",
                    expected: KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Self::from_bytes(&seed)
    }

    /// Returns the 32-byte seed.
    pub fn to_bytes(&self) -> [u8; KEY_LENGTH] {
        self.inner.to_bytes()
    }

    /// Derives the matching verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Signs `message`. Ed25519 signatures are deterministic.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.inner.sign(message),
        }
    }
}

// -----------------------------------------------------------------------------
// Verifying key
// -----------------------------------------------------------------------------

/// Ed25519 verifying (public) key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Creates a verifying key from a 32-byte compressed point.
    pub fn from_bytes(bytes: &[u8; KEY_LENGTH]) -> CryptoResult<Self> {
        if bytes == &[0u8; KEY_LENGTH] {
            return Err(CryptoError::Degenerate("public key"));
        }
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Creates a verifying key from a slice of unchecked length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let key: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    what: "public key",
                    expected: KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Self::from_bytes(&key)
    }

    /// Returns the compressed point bytes.
    pub fn to_bytes(&self) -> [u8; KEY_LENGTH] {
        self.inner.to_bytes()
    }

    /// Verifies `signature` over `message`.
    ///
    /// Uses strict verification, rejecting non-canonical signatures so a
    /// Byzantine sender cannot produce a second valid encoding of a vote.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        self.inner
            .verify_strict(message, &signature.inner)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Verifies a signature carried as raw bytes (as it arrives off the wire).
    pub fn verify_bytes(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let signature = Signature::from_slice(signature)?;
        self.verify(message, &signature)
    }
}

// -----------------------------------------------------------------------------
// Signature
// -----------------------------------------------------------------------------

/// Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl Signature {
    /// Creates a signature from its 64-byte encoding.
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LENGTH]) -> Self {
        Self {
            inner: ed25519_dalek::Signature::from_bytes(bytes),
        }
    }

    /// Creates a signature from a slice of unchecked length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let sig: [u8; SIGNATURE_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    what: "signature",
                    expected: SIGNATURE_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self::from_bytes(&sig))
    }

    /// Returns the 64-byte encoding.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.inner.to_bytes()
    }

    /// Returns the encoding as an owned vector, the shape carried in messages.
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}
