//! Reconnect backoff — doubling delay, capped, with jitter.

use std::time::Duration;

use rand::Rng;

const BASE_SECS: u64 = 1;
const CAP_SECS: u64 = 30;
const JITTER: f64 = 0.2;

#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next attempt: 1, 2, 4, 8, … seconds capped at 30,
    /// with ±20% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let base = BASE_SECS
            .checked_shl(self.attempt)
            .unwrap_or(CAP_SECS)
            .min(CAP_SECS);
        self.attempt = self.attempt.saturating_add(1);
        let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        Duration::from_secs_f64(base as f64 * factor)
    }

    /// Reset after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
