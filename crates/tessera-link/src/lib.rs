//! # tessera-link: authenticated perfect links
//!
//! Reliable, deduplicated, authenticated point-to-point delivery over an
//! unreliable datagram channel.
//!
//! ```text
//!  sender                                     receiver
//!  ──────                                     ────────
//!  send(peer, p) ──Data(id, p, sig)──►  verify sig ─► seen(id)? ─yes─► re-Ack, drop
//!       │          (retransmit with           │                 no
//!       │           backoff until Ack)        ▼
//!       │                              mark seen, Ack(id), queue for receive()
//!       ◄────────────Ack(id, sig)──────────────┘
//!  cancel retransmission
//! ```
//!
//! Guarantees:
//! - Every `(sender, message_id)` pair is surfaced by [`PerfectLink::receive`]
//!   at most once, and exactly once if the sender stays correct and
//!   reachable.
//! - Nothing unauthenticated reaches the application. Envelopes from
//!   unknown senders or with bad signatures are dropped and counted.
//! - `Ack` frames and duplicate deliveries (the `IGNORE` classification)
//!   never leave this crate.
//!
//! The link is generic over the application payload and the datagram
//! transport ([`Datagram`]): UDP in production, [`MemoryNetwork`] with
//! seeded fault injection in tests.

mod datagram;
mod envelope;
mod error;
mod link;
mod memory;
mod metrics;
mod seen;
mod settings;

pub use datagram::Datagram;
pub use envelope::{Envelope, Frame, Payload};
pub use error::{LinkError, LinkResult};
pub use link::{Delivery, PerfectLink};
pub use memory::{FaultConfig, MemoryNetwork, MemorySocket};
pub use metrics::{LinkMetrics, LinkMetricsSnapshot};
pub use seen::SeenWindow;
pub use settings::LinkSettings;
