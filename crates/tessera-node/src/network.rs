//! Consensus traffic over the perfect link.

use tessera_consensus::{ConsensusNetwork, SignedConsensus};
use tessera_link::{Datagram, PerfectLink};
use tessera_types::{NodeId, PeerId};
use tracing::warn;

use crate::message::NodeMessage;

/// [`ConsensusNetwork`] backed by a node's [`PerfectLink`].
pub struct LinkNetwork<D> {
    link: PerfectLink<NodeMessage, D>,
}

impl<D> LinkNetwork<D> {
    pub fn new(link: PerfectLink<NodeMessage, D>) -> Self {
        Self { link }
    }
}

impl<D: Datagram> ConsensusNetwork for LinkNetwork<D> {
    fn broadcast(&self, message: &SignedConsensus) {
        if let Err(e) = self.link.broadcast(&NodeMessage::Consensus(message.clone())) {
            warn!(error = %e, "consensus broadcast failed");
        }
    }

    fn send(&self, to: &NodeId, message: &SignedConsensus) {
        if let Err(e) = self
            .link
            .send(&PeerId::from(to), NodeMessage::Consensus(message.clone()))
        {
            warn!(to = %to, error = %e, "consensus send failed");
        }
    }
}
