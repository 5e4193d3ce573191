//! Acceptance of replica responses.
//!
//! Up to `f` replicas may lie, so a response is only trusted once `f+1`
//! distinct replicas sent the same decided instance and the same blocks up
//! to that instance. Blocks past the decided instance depend on how far
//! each replica's ledger had advanced and are not compared.

use std::collections::HashMap;

use tessera_types::{Block, InstanceNumber, LedgerResponse, NodeId};

/// What `f+1` replicas have to agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub decided_instance: InstanceNumber,
    pub blocks: Vec<Block>,
}

impl Answer {
    fn from_response(response: LedgerResponse) -> Self {
        let decided_instance = response.decided_instance;
        let mut blocks = response.slice;
        blocks.retain(|block| block.instance <= decided_instance);
        Self {
            decided_instance,
            blocks,
        }
    }
}

/// Collects responses to one request.
#[derive(Debug)]
pub struct ResponseTally {
    threshold: usize,
    /// One answer per replica; later answers from the same replica are ignored.
    answers: HashMap<NodeId, Answer>,
}

impl ResponseTally {
    /// `threshold` is `f+1`.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            answers: HashMap::new(),
        }
    }

    /// Records `response` and returns the answer once it is backed by the
    /// threshold.
    pub fn record(&mut self, response: LedgerResponse) -> Option<Answer> {
        let node = response.node_id.clone();
        if self.answers.contains_key(&node) {
            return None;
        }
        let answer = Answer::from_response(response);
        self.answers.insert(node, answer.clone());

        let backing = self.answers.values().filter(|a| **a == answer).count();
        (backing >= self.threshold).then_some(answer)
    }

    /// Distinct replicas heard from.
    pub fn responders(&self) -> usize {
        self.answers.len()
    }
}
