//! Link tuning knobs.

use std::time::Duration;

/// Perfect link settings.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Delay before the first retransmission of an unacknowledged envelope.
    pub retransmit_initial: Duration,

    /// Upper bound for the doubling retransmission delay.
    pub retransmit_max: Duration,

    /// Give up after this many retransmissions. `None` retransmits for as
    /// long as the link lives, which is what perfect-link delivery to a
    /// correct peer requires.
    pub max_retransmissions: Option<u32>,

    /// Capacity of the queue between the listener and `receive()`.
    ///
    /// When full, inbound data is dropped unacknowledged so the sender's
    /// retransmission delivers it once there is room.
    pub receive_queue_capacity: usize,

    /// Largest datagram accepted or produced.
    pub max_datagram_size: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            retransmit_initial: Duration::from_millis(200),
            retransmit_max: Duration::from_secs(3),
            max_retransmissions: None,
            receive_queue_capacity: 1024,
            max_datagram_size: 65_507,
        }
    }
}

impl LinkSettings {
    /// Next retransmission delay after `current`.
    pub(crate) fn backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.retransmit_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = LinkSettings {
            retransmit_initial: Duration::from_millis(100),
            retransmit_max: Duration::from_millis(300),
            ..LinkSettings::default()
        };

        let d1 = settings.backoff(settings.retransmit_initial);
        let d2 = settings.backoff(d1);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(300));
    }
}
