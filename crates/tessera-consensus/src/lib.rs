//! # tessera-consensus: Byzantine agreement for the Tessera ledger
//!
//! One consensus instance per ledger slot. Each instance runs a
//! leader-based three-phase protocol with round changes, tolerating
//! `f = ⌊(n-1)/3⌋` Byzantine replicas among `n`.
//!
//! ## Protocol
//!
//! ```text
//!  leader(i, r)        all replicas                 all replicas
//!  ────────────        ────────────                 ────────────
//!  PRE_PREPARE ──────► accept, PREPARE ──────────►  q PREPAREs: prepared, COMMIT
//!                                                   q COMMITs:  decide
//!
//!  round timer expires ─► ROUND_CHANGE(r+1, prepared certificate?)
//!  q ROUND_CHANGEs ─────► leader(i, r+1) re-proposes the highest prepared value
//! ```
//!
//! ## Modules
//!
//! - [`quorum`]: fault threshold arithmetic and vote counting
//! - [`message`]: the closed set of signed protocol messages
//! - [`instance`]: the pure per-instance state machine
//! - [`verify`]: signature and certificate checks on inbound messages
//! - [`engine`]: instance table, timers, proposal queue, networking seam
//! - [`ledger`]: contiguous, hash-chained log of decided values
//!
//! ## Example
//!
//! ```ignore
//! let engine = ConsensusEngine::builder(local, signing_key, roster, network)
//!     .validator(|value: &Value| !value.is_empty())
//!     .build()?;
//!
//! engine.start_consensus(Value::from("tx1"))?;
//! let instance = engine.wait_for_value(&Value::from("tx1").digest()).await;
//! let blocks = engine.ledger_slice(instance);
//! ```

pub mod engine;
pub mod error;
pub mod instance;
pub mod instrumentation;
pub mod leader;
pub mod ledger;
pub mod message;
pub mod quorum;
pub mod settings;
pub mod validator;
pub mod verify;

pub use engine::{ConsensusEngine, ConsensusEngineBuilder, ConsensusNetwork};
pub use error::{ConsensusError, ConsensusResult};
pub use instance::{InstanceContext, InstanceOutput, InstanceState, Outbound, Phase, TimerCommand};
pub use instrumentation::{METRICS, Metrics, MetricsSnapshot};
pub use leader::{LeaderPolicy, RoundRobin};
pub use ledger::Ledger;
pub use message::{
    CommitCertificate, ConsensusMessage, MessageKind, PrePrepare, PreparedCertificate, RoundChange,
    SignedConsensus, Vote,
};
pub use quorum::{Quorum, QuorumTracker, Tally};
pub use settings::ConsensusSettings;
pub use validator::{AcceptAll, ValueValidator};
pub use verify::MessageVerifier;
