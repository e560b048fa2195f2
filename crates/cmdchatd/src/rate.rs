//! Per-session rate limiting — sliding window over send timestamps.
//!
//! Counted events are chat and file-chunk sends. A rejection is not fatal:
//! the offending envelope is dropped and only the sender is told.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_events: usize,
    events: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_events: usize) -> Self {
        Self {
            window,
            max_events,
            events: VecDeque::with_capacity(max_events),
        }
    }

    /// Record a send attempt at `now`. Returns true if it is within the
    /// window budget, false if it must be rejected.
    pub fn allow(&mut self, now: Instant) -> bool {
        if let Some(cutoff) = now.checked_sub(self.window) {
            while self.events.front().is_some_and(|&t| t <= cutoff) {
                self.events.pop_front();
            }
        }
        if self.events.len() >= self.max_events {
            return false;
        }
        self.events.push_back(now);
        true
    }

    #[cfg(test)]
    fn in_window(&self) -> usize {
        self.events.len()
    }
}
