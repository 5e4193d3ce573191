//! Consensus metrics.
//!
//! Lock-free counters shared by every engine in the process:
//!
//! ```ignore
//! use tessera_consensus::instrumentation::METRICS;
//!
//! METRICS.increment_decisions();
//! let snapshot = METRICS.snapshot();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::MessageKind;

/// Global consensus metrics.
pub static METRICS: Metrics = Metrics::new();

#[derive(Debug)]
pub struct Metrics {
    // === Traffic, indexed by MessageKind ===
    messages_sent: [AtomicU64; 5],
    messages_received: [AtomicU64; 5],

    // === Rejections ===
    authentication_failures: AtomicU64,
    unknown_senders: AtomicU64,
    invalid_justifications: AtomicU64,
    outside_window: AtomicU64,
    stale_messages: AtomicU64,
    equivocations: AtomicU64,
    non_leader_proposals: AtomicU64,
    invalid_values: AtomicU64,

    // === Progress ===
    instances_started: AtomicU64,
    decisions: AtomicU64,
    round_changes: AtomicU64,
    quorum_unreachable_warnings: AtomicU64,
    ledger_length: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            messages_sent: [const { AtomicU64::new(0) }; 5],
            messages_received: [const { AtomicU64::new(0) }; 5],
            authentication_failures: AtomicU64::new(0),
            unknown_senders: AtomicU64::new(0),
            invalid_justifications: AtomicU64::new(0),
            outside_window: AtomicU64::new(0),
            stale_messages: AtomicU64::new(0),
            equivocations: AtomicU64::new(0),
            non_leader_proposals: AtomicU64::new(0),
            invalid_values: AtomicU64::new(0),
            instances_started: AtomicU64::new(0),
            decisions: AtomicU64::new(0),
            round_changes: AtomicU64::new(0),
            quorum_unreachable_warnings: AtomicU64::new(0),
            ledger_length: AtomicU64::new(0),
        }
    }

    fn kind_index(kind: MessageKind) -> usize {
        match kind {
            MessageKind::PrePrepare => 0,
            MessageKind::Prepare => 1,
            MessageKind::Commit => 2,
            MessageKind::RoundChange => 3,
            MessageKind::Decided => 4,
        }
    }

    pub fn increment_messages_sent(&self, kind: MessageKind) {
        self.messages_sent[Self::kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_messages_received(&self, kind: MessageKind) {
        self.messages_received[Self::kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_authentication_failures(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unknown_senders(&self) {
        self.unknown_senders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalid_justifications(&self) {
        self.invalid_justifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_outside_window(&self) {
        self.outside_window.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stale_messages(&self) {
        self.stale_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_equivocations(&self) {
        self.equivocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_non_leader_proposals(&self) {
        self.non_leader_proposals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalid_values(&self) {
        self.invalid_values.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_instances_started(&self) {
        self.instances_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_decisions(&self) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_round_changes(&self) {
        self.round_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_quorum_unreachable_warnings(&self) {
        self.quorum_unreachable_warnings
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ledger_length(&self, length: u64) {
        self.ledger_length.fetch_max(length, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_sent: self.messages_sent.each_ref().map(load),
            messages_received: self.messages_received.each_ref().map(load),
            authentication_failures: load(&self.authentication_failures),
            unknown_senders: load(&self.unknown_senders),
            invalid_justifications: load(&self.invalid_justifications),
            outside_window: load(&self.outside_window),
            stale_messages: load(&self.stale_messages),
            equivocations: load(&self.equivocations),
            non_leader_proposals: load(&self.non_leader_proposals),
            invalid_values: load(&self.invalid_values),
            instances_started: load(&self.instances_started),
            decisions: load(&self.decisions),
            round_changes: load(&self.round_changes),
            quorum_unreachable_warnings: load(&self.quorum_unreachable_warnings),
            ledger_length: load(&self.ledger_length),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: [u64; 5],
    pub messages_received: [u64; 5],
    pub authentication_failures: u64,
    pub unknown_senders: u64,
    pub invalid_justifications: u64,
    pub outside_window: u64,
    pub stale_messages: u64,
    pub equivocations: u64,
    pub non_leader_proposals: u64,
    pub invalid_values: u64,
    pub instances_started: u64,
    pub decisions: u64,
    pub round_changes: u64,
    pub quorum_unreachable_warnings: u64,
    pub ledger_length: u64,
}

impl MetricsSnapshot {
    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.messages_sent[Metrics::kind_index(kind)]
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.messages_received[Metrics::kind_index(kind)]
    }
}
