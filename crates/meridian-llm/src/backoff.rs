//! Full-jitter exponential backoff for retry delays.
//!
//! `delay = uniform(0, min(base * 2^attempt, cap))`. The jitter spreads
//! retries from many concurrent callers instead of synchronizing them.

use std::time::Duration;

/// Stateful backoff calculator.
#[derive(Debug)]
pub struct JitteredBackoff {
    base_ms: u64,
    cap_ms: u64,
    attempt: u32,
}

impl JitteredBackoff {
    /// Create a calculator with the given base and cap in milliseconds.
    #[must_use]
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            cap_ms,
            attempt: 0,
        }
    }

    /// Draw the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self
            .base_ms
            .saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX))
            .min(self.cap_ms);
        self.attempt = self.attempt.saturating_add(1);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=ceiling))
    }

    /// Forget prior attempts after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts drawn since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
