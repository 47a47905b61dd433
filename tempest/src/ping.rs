//! Keep-alive bookkeeping: outstanding ping counting and round-trip
//! measurement.

use std::time::{Duration, Instant};

/// Per-connection activity monitor, driven by the provider's ping
/// timer on one side and pong receipts on the other.
#[derive(Debug, Default)]
pub struct ActivityMonitor {
    outstanding_pings: u32,
    last_ping_sent: Option<Instant>,
    response_time: Option<Duration>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a ping going out. Returns the number now outstanding.
    pub fn on_ping_sent(&mut self, now: Instant) -> u32 {
        self.outstanding_pings += 1;
        self.last_ping_sent = Some(now);
        self.outstanding_pings
    }

    /// Records the peer's pong and measures the round trip.
    pub fn on_pong(&mut self, now: Instant) {
        if let Some(sent) = self.last_ping_sent {
            self.response_time = Some(now.saturating_duration_since(sent));
        }
        self.outstanding_pings = 0;
    }

    /// Two consecutive unanswered pings mean the peer is gone.
    pub fn timed_out(&self) -> bool {
        self.outstanding_pings >= 2
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding_pings
    }

    /// Last measured round-trip time, if a pong has arrived.
    pub fn response_time(&self) -> Option<Duration> {
        self.response_time
    }
}
