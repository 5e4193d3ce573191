//! # tessera-types: core types for Tessera
//!
//! Shared across the link, consensus, node and client crates:
//! - Identities ([`NodeId`], [`ClientId`], [`PeerId`])
//! - Protocol counters ([`InstanceNumber`], [`Round`], [`Nonce`], [`MessageId`])
//! - Decided data ([`Value`], [`Block`])
//! - Client wire contract ([`ClientRequest`], [`LedgerResponse`], [`PayloadKind`])
//! - The static membership list ([`Roster`])

use std::fmt::{Debug, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod block;
mod request;
mod roster;

pub use block::Block;
pub use request::{ClientRequest, LedgerResponse, PayloadKind};
pub use roster::{Roster, RosterEntry, RosterError};
pub use tessera_crypto::Hash;

// ============================================================================
// Identities - opaque strings assigned by static configuration
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a replica in the roster.
    NodeId
);

string_id!(
    /// Identifier of a registered client.
    ClientId
);

string_id!(
    /// Link-level identity of any process, replica or client.
    ///
    /// Node and client ids share one namespace on the wire; the roster
    /// rejects configurations where they collide.
    PeerId
);

impl From<&NodeId> for PeerId {
    fn from(id: &NodeId) -> Self {
        Self(id.0.clone())
    }
}

impl From<&ClientId> for PeerId {
    fn from(id: &ClientId) -> Self {
        Self(id.0.clone())
    }
}

impl From<&PeerId> for NodeId {
    fn from(id: &PeerId) -> Self {
        Self(id.0.clone())
    }
}

impl From<&PeerId> for ClientId {
    fn from(id: &PeerId) -> Self {
        Self(id.0.clone())
    }
}

// ============================================================================
// Protocol counters - all Copy
// ============================================================================

/// Index of a consensus instance, which is also the ledger slot it fills.
///
/// 1-based: the first block of the ledger is instance 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InstanceNumber(u64);

impl InstanceNumber {
    pub const FIRST: InstanceNumber = InstanceNumber(1);

    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Zero-based position of this instance in the ledger.
    pub fn as_index(&self) -> usize {
        debug_assert!(self.0 >= 1, "instance numbers are 1-based");
        self.0.saturating_sub(1) as usize
    }
}

impl Display for InstanceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InstanceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Attempt counter within one instance. Starts at 1, only grows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Round(u64);

impl Round {
    pub const FIRST: Round = Round(1);

    pub fn new(round: u64) -> Self {
        Self(round)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen request identity. `(ClientId, Nonce)` names one logical request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Nonce(u64);

impl Nonce {
    pub fn new(nonce: u64) -> Self {
        Self(nonce)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Link-level sequence number, monotonic per sender.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value - what one instance decides
// ============================================================================

/// Opaque bytes agreed on by one consensus instance.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Value(Bytes);

impl Value {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Digest used to bucket votes for this value.
    pub fn digest(&self) -> Hash {
        Hash::digest(&self.0)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if self.0.len() <= 64 => write!(f, "Value({s:?})"),
            _ => write!(f, "Value({} bytes, {})", self.0.len(), self.digest()),
        }
    }
}

impl From<&'static str> for Value {
    fn from(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_numbers_are_one_based() {
        assert_eq!(InstanceNumber::FIRST.as_index(), 0);
        assert_eq!(InstanceNumber::new(3).as_index(), 2);
        assert_eq!(InstanceNumber::FIRST.next(), InstanceNumber::new(2));
    }

    #[test]
    fn rounds_start_at_one() {
        assert_eq!(Round::FIRST.as_u64(), 1);
        assert!(Round::FIRST.next() > Round::FIRST);
    }

    #[test]
    fn peer_ids_share_namespace_with_nodes_and_clients() {
        let node = NodeId::new("R2");
        let peer = PeerId::from(&node);
        assert_eq!(peer.as_str(), "R2");
        assert_eq!(NodeId::from(&peer), node);
    }

    #[test]
    fn value_debug_is_readable_for_short_text() {
        assert_eq!(format!("{:?}", Value::from("tx1")), "Value(\"tx1\")");
    }

    #[test]
    fn value_digest_tracks_content() {
        assert_eq!(Value::from("a").digest(), Value::from(b"a".to_vec()).digest());
        assert_ne!(Value::from("a").digest(), Value::from("b").digest());
    }
}
