//! Per-link counters.
//!
//! Each [`PerfectLink`](crate::PerfectLink) owns one [`LinkMetrics`]; every
//! dropped or ignored envelope bumps a counter so silent drops stay
//! observable.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic link counters.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    data_sent: AtomicU64,
    retransmissions: AtomicU64,
    retransmissions_abandoned: AtomicU64,
    acks_received: AtomicU64,
    delivered: AtomicU64,
    duplicates_ignored: AtomicU64,
    backpressure_drops: AtomicU64,
    decode_failures: AtomicU64,
    unknown_senders: AtomicU64,
    authentication_failures: AtomicU64,
}

impl LinkMetrics {
    pub const fn new() -> Self {
        Self {
            data_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            retransmissions_abandoned: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            duplicates_ignored: AtomicU64::new(0),
            backpressure_drops: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            unknown_senders: AtomicU64::new(0),
            authentication_failures: AtomicU64::new(0),
        }
    }

    pub fn increment_data_sent(&self) {
        self.data_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retransmissions(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retransmissions_abandoned(&self) {
        self.retransmissions_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_acks_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_duplicates_ignored(&self) {
        self.duplicates_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_backpressure_drops(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_decode_failures(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unknown_senders(&self) {
        self.unknown_senders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_authentication_failures(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        LinkMetricsSnapshot {
            data_sent: self.data_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            retransmissions_abandoned: self.retransmissions_abandoned.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates_ignored: self.duplicates_ignored.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unknown_senders: self.unknown_senders.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of link counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkMetricsSnapshot {
    pub data_sent: u64,
    pub retransmissions: u64,
    pub retransmissions_abandoned: u64,
    pub acks_received: u64,
    pub delivered: u64,
    pub duplicates_ignored: u64,
    pub backpressure_drops: u64,
    pub decode_failures: u64,
    pub unknown_senders: u64,
    pub authentication_failures: u64,
}
