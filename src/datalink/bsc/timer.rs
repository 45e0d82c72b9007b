//! Millisecond deadline timer for the BACnet/SC state machines.
//!
//! Timers never read the clock themselves; every operation takes an
//! explicit `Instant`. The run loop samples the clock once per tick and
//! passes it down, which keeps the state machines deterministic under
//! test.

use std::time::{Duration, Instant};

/// A one-shot deadline with a remembered interval.
///
/// An unset timer never reports expiry.
#[derive(Debug, Clone, Copy)]
pub struct MsTimer {
    deadline: Option<Instant>,
    interval: Duration,
}

impl MsTimer {
    pub fn new() -> Self {
        MsTimer {
            deadline: None,
            interval: Duration::ZERO,
        }
    }

    /// Arm the timer to expire `interval` after `now`.
    pub fn set(&mut self, now: Instant, interval: Duration) {
        self.interval = interval;
        self.deadline = Some(now + interval);
    }

    /// Re-arm with the interval of the previous `set`.
    pub fn restart(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    /// Disarm; `expired` returns false until the next `set`.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

impl Default for MsTimer {
    fn default() -> Self {
        Self::new()
    }
}
