//! Payload carried by the perfect link between Tessera processes.

use serde::{Deserialize, Serialize};
use tessera_consensus::SignedConsensus;
use tessera_types::{ClientRequest, LedgerResponse};

/// Everything a node or client puts on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Client to every replica.
    Request(ClientRequest),
    /// Replica to the requesting client.
    Response(LedgerResponse),
    /// Replica to replica.
    Consensus(SignedConsensus),
}

impl NodeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Consensus(_) => "consensus",
        }
    }
}
