//! Client ⇄ node wire contract.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_crypto::{CryptoResult, Hasher, SigningKey, VerifyingKey};

use crate::{Block, ClientId, InstanceNumber, NodeId, Nonce};

/// Application-defined tag describing how to interpret a request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadKind(u16);

impl PayloadKind {
    /// Append the payload to the ledger.
    pub const APPEND: PayloadKind = PayloadKind(1);

    /// Read the ledger. Carries an empty payload but is still ordered
    /// through consensus, so a read observes every write decided before it.
    pub const READ: PayloadKind = PayloadKind(2);

    pub fn new(tag: u16) -> Self {
        Self(tag)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::APPEND => "APPEND",
            Self::READ => "READ",
            _ => "CUSTOM",
        }
    }
}

/// A signed request from a client.
///
/// The signature covers `(client_id, nonce, kind, payload)`.
/// `known_ledger_length` is a delivery hint telling the node how much of
/// the ledger the client already holds; it is not part of the request
/// identity and is not signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: ClientId,
    pub nonce: Nonce,
    pub kind: PayloadKind,
    pub payload: Bytes,
    pub known_ledger_length: u64,
    pub signature: Vec<u8>,
}

impl ClientRequest {
    /// Creates an unsigned request. Call [`ClientRequest::sign`] before sending.
    pub fn new(
        client_id: ClientId,
        nonce: Nonce,
        kind: PayloadKind,
        payload: impl Into<Bytes>,
        known_ledger_length: u64,
    ) -> Self {
        Self {
            client_id,
            nonce,
            kind,
            payload: payload.into(),
            known_ledger_length,
            signature: Vec::new(),
        }
    }

    /// Canonical bytes covered by the client signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut hasher = Hasher::new();
        hasher
            .update(b"tessera.client-request.v1")
            .update(self.client_id.as_str().as_bytes())
            .update(&self.nonce.as_u64().to_le_bytes())
            .update(&self.kind.as_u16().to_le_bytes())
            .update(&self.payload);
        hasher.finalize().as_bytes().to_vec()
    }

    /// Signs this request with the client's key.
    pub fn sign(mut self, key: &SigningKey) -> Self {
        self.signature = key.sign(&self.signing_bytes()).to_vec();
        self
    }

    /// Verifies the client signature.
    pub fn verify(&self, key: &VerifyingKey) -> CryptoResult<()> {
        key.verify_bytes(&self.signing_bytes(), &self.signature)
    }

    /// Returns true if this request only reads the ledger.
    pub fn is_read(&self) -> bool {
        self.kind == PayloadKind::READ
    }
}

/// A node's answer to one client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerResponse {
    /// The replica that produced this response.
    pub node_id: NodeId,
    /// Echo of the request nonce.
    pub nonce: Nonce,
    /// Instance the node allocated for the request.
    pub decided_instance: InstanceNumber,
    /// Ledger blocks from the client's known length up to the node's tail.
    pub slice: Vec<Block>,
}
