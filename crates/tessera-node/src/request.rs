//! Client requests as consensus values.
//!
//! The value a replica proposes for a request is the postcard encoding of
//! the signed request with the unsigned delivery hint cleared. Every
//! replica derives the same bytes from the same request, so copies of one
//! request proposed by different replicas have one digest.

use std::sync::Arc;

use tessera_consensus::ValueValidator;
use tessera_types::{ClientRequest, Roster, Value};

use crate::error::{NodeError, NodeResult};

/// Canonical consensus value for `request`.
pub fn to_value(request: &ClientRequest) -> NodeResult<Value> {
    let canonical = ClientRequest {
        known_ledger_length: 0,
        ..request.clone()
    };
    Ok(Value::from(postcard::to_allocvec(&canonical)?))
}

/// Decodes a value produced by [`to_value`].
pub fn from_value(value: &Value) -> Option<ClientRequest> {
    postcard::from_bytes(value.as_bytes()).ok()
}

/// Checks the client signature against the roster.
pub fn authenticate(roster: &Roster, request: &ClientRequest) -> NodeResult<()> {
    let entry = roster
        .client(&request.client_id)
        .ok_or_else(|| NodeError::UnknownClient(request.client_id.clone()))?;
    request
        .verify(&entry.public_key)
        .map_err(|_| NodeError::InvalidSignature(request.client_id.clone()))
}

/// Accepts only canonical values carrying a request signed by a roster
/// client, so a Byzantine leader cannot order forged requests.
#[derive(Debug, Clone)]
pub struct SignedRequestValidator {
    roster: Arc<Roster>,
}

impl SignedRequestValidator {
    pub fn new(roster: Arc<Roster>) -> Self {
        Self { roster }
    }
}

impl ValueValidator for SignedRequestValidator {
    fn is_valid(&self, value: &Value) -> bool {
        let Some(request) = from_value(value) else {
            return false;
        };
        request.known_ledger_length == 0 && authenticate(&self.roster, &request).is_ok()
    }
}
