//! Ledger request handler.
//!
//! Turns one authenticated client request into at most one consensus
//! instance and answers with the instance that decided it plus the ledger
//! blocks the client has not seen yet. Duplicates never hold a worker.

use std::sync::Arc;

use tessera_consensus::ConsensusEngine;
use tessera_types::{ClientRequest, InstanceNumber, LedgerResponse, NodeId, Roster};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::dedup::{Admission, DedupTable, Ticket};
use crate::error::NodeResult;
use crate::request::{authenticate, to_value};

/// Handles client requests for one replica.
pub struct RequestHandler {
    engine: ConsensusEngine,
    roster: Arc<Roster>,
    dedup: DedupTable,
}

impl RequestHandler {
    pub fn new(engine: ConsensusEngine, roster: Arc<Roster>) -> Self {
        Self {
            engine,
            roster,
            dedup: DedupTable::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.engine.local_id()
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn dedup(&self) -> &DedupTable {
        &self.dedup
    }

    /// Authenticates `request` and records it in the dedup table.
    ///
    /// Cheap and non-blocking, so the receive loop calls it before deciding
    /// whether the request needs a worker at all.
    pub fn admit(&self, request: &ClientRequest) -> NodeResult<Admission> {
        authenticate(&self.roster, request)?;
        Ok(self.dedup.admit(&request.client_id, request.nonce))
    }

    /// Runs consensus for a newly admitted request and answers once its
    /// value is in the ledger.
    ///
    /// Returns `None` when consensus could not start; the ticket is then
    /// abandoned so a retry is admitted again.
    #[instrument(skip_all, fields(node = %self.node_id(), client = %request.client_id, nonce = %request.nonce))]
    pub async fn handle(&self, request: ClientRequest, ticket: Ticket) -> Option<LedgerResponse> {
        let value = match to_value(&request) {
            Ok(value) => value,
            Err(e) => {
                ticket.abandon();
                warn!(error = %e, "request dropped");
                return None;
            }
        };
        let digest = value.digest();
        match self.engine.start_consensus(value) {
            Ok(instance) => debug!(instance = %instance, kind = request.kind.name(), "consensus started"),
            Err(e) => {
                ticket.abandon();
                warn!(error = %e, "request dropped");
                return None;
            }
        }

        let decided = self.engine.wait_for_value(&digest).await;
        ticket.publish(decided);
        info!(instance = %decided, "request decided");
        Some(self.respond(&request, decided))
    }

    /// Answers a duplicate without waiting.
    ///
    /// Only a duplicate whose original already decided gets an answer, with
    /// the same instance. While the original is in flight its own answer
    /// reaches the same client, so the copy is dropped.
    pub fn answer_duplicate(
        &self,
        request: &ClientRequest,
        original: &watch::Receiver<Option<InstanceNumber>>,
    ) -> Option<LedgerResponse> {
        let decided = *original.borrow();
        match decided {
            Some(decided) => Some(self.respond(request, decided)),
            None => {
                debug!(
                    client = %request.client_id,
                    nonce = %request.nonce,
                    "duplicate of a request still in flight, dropped"
                );
                None
            }
        }
    }

    fn respond(&self, request: &ClientRequest, decided: InstanceNumber) -> LedgerResponse {
        let from = InstanceNumber::new(request.known_ledger_length.saturating_add(1));
        LedgerResponse {
            node_id: self.node_id().clone(),
            nonce: request.nonce,
            decided_instance: decided,
            slice: self.engine.ledger_slice(from),
        }
    }
}
