//! # tessera-node: a Tessera replica
//!
//! Wires the perfect link, the consensus engine and the client-facing
//! request handler into one process.
//!
//! ```text
//!  PerfectLink::receive ──► receive loop ──Consensus──► ConsensusEngine::handle_message
//!                                │
//!                                └──Request──► RequestHandler::admit (DedupTable)
//!                                               │ new            │ duplicate
//!                                               ▼                ▼
//!                                  worker (semaphore)      answer if already decided
//!                                  RequestHandler::handle        │
//!                                  start_consensus / wait        │
//!                                               ▼                ▼
//!                                          PerfectLink::send(Response)
//! ```
//!
//! Every message on the link is a [`NodeMessage`]; clients use the same
//! type through `tessera-client`.

pub mod dedup;
pub mod error;
pub mod handler;
pub mod message;
pub mod network;
pub mod node;
pub mod request;

pub use dedup::{Admission, DedupTable, Ticket};
pub use error::{NodeError, NodeResult};
pub use handler::RequestHandler;
pub use message::NodeMessage;
pub use network::LinkNetwork;
pub use node::{Node, NodeSettings};
pub use request::SignedRequestValidator;
