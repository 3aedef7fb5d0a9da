use std::ops::Range;
use std::time::Duration;

/// Tuning knobs for a [`crate::Stack`]; see DESIGN.md for the
/// rationale behind each default.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait for an ACK before resending an unacknowledged
    /// packet.
    pub retransmit_timeout: Duration,
    /// How long a connection lingers in TimeWait before the manager tears
    /// it down and frees its four-tuple.
    pub time_wait_duration: Duration,
    /// Period of the background flush that carves and sends pending data.
    pub flush_interval: Duration,
    /// Advertised receive window for freshly created connections.
    pub initial_window: u16,
    /// Range the initial sequence number is drawn from.
    pub isn_range: Range<u32>,
    /// Number of worker threads backing the timer service.
    pub timer_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            retransmit_timeout: Duration::from_secs(5),
            time_wait_duration: Duration::from_secs(5),
            flush_interval: Duration::from_millis(200),
            initial_window: 1024,
            isn_range: 10..10_000,
            timer_workers: 2,
        }
    }
}
