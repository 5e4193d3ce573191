//! Static membership: the replica set and the registered clients.
//!
//! The roster is fixed for the lifetime of a run. Replica order matters:
//! leader election indexes into it.

use std::collections::HashSet;
use std::net::SocketAddr;

use tessera_crypto::VerifyingKey;
use thiserror::Error;

use crate::{ClientId, NodeId, PeerId};

/// One member of the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry<I> {
    pub id: I,
    pub address: SocketAddr,
    pub public_key: VerifyingKey,
}

impl<I> RosterEntry<I> {
    pub fn new(id: I, address: SocketAddr, public_key: VerifyingKey) -> Self {
        Self {
            id,
            address,
            public_key,
        }
    }
}

/// Errors building a roster.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster has no replicas")]
    NoReplicas,

    #[error("duplicate roster id: {0}")]
    DuplicateId(String),

    #[error("duplicate roster address: {0}")]
    DuplicateAddress(SocketAddr),
}

/// The static replica and client set.
#[derive(Debug, Clone)]
pub struct Roster {
    nodes: Vec<RosterEntry<NodeId>>,
    clients: Vec<RosterEntry<ClientId>>,
}

impl Roster {
    /// Builds a roster, rejecting empty replica sets and id or address
    /// collisions across nodes and clients.
    pub fn new(
        nodes: Vec<RosterEntry<NodeId>>,
        clients: Vec<RosterEntry<ClientId>>,
    ) -> Result<Self, RosterError> {
        if nodes.is_empty() {
            return Err(RosterError::NoReplicas);
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        let members = nodes
            .iter()
            .map(|n| (n.id.as_str(), n.address))
            .chain(clients.iter().map(|c| (c.id.as_str(), c.address)));
        for (id, address) in members {
            if !ids.insert(id) {
                return Err(RosterError::DuplicateId(id.to_string()));
            }
            if !addresses.insert(address) {
                return Err(RosterError::DuplicateAddress(address));
            }
        }

        Ok(Self { nodes, clients })
    }

    /// Replicas in roster order.
    pub fn nodes(&self) -> &[RosterEntry<NodeId>] {
        &self.nodes
    }

    pub fn clients(&self) -> &[RosterEntry<ClientId>] {
        &self.clients
    }

    /// Number of replicas (`n`).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Position of a replica in roster order.
    pub fn node_index(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    /// Replica at a roster position.
    pub fn node_at(&self, index: usize) -> Option<&RosterEntry<NodeId>> {
        self.nodes.get(index)
    }

    pub fn node(&self, id: &NodeId) -> Option<&RosterEntry<NodeId>> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn client(&self, id: &ClientId) -> Option<&RosterEntry<ClientId>> {
        self.clients.iter().find(|c| &c.id == id)
    }

    pub fn is_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Looks up any process by link identity.
    pub fn peer(&self, id: &PeerId) -> Option<(SocketAddr, &VerifyingKey)> {
        self.nodes
            .iter()
            .find(|n| n.id.as_str() == id.as_str())
            .map(|n| (n.address, &n.public_key))
            .or_else(|| {
                self.clients
                    .iter()
                    .find(|c| c.id.as_str() == id.as_str())
                    .map(|c| (c.address, &c.public_key))
            })
    }

    /// Replica ids in roster order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }
}
