//! Per-provider circuit breaker.
//!
//! A three-state machine driven by explicit state plus a timestamp, so no
//! timers fire under load. `closed` admits everything; `open` rejects until
//! the reset timeout elapses; `half-open` admits exactly one probe, whose
//! outcome either closes or re-opens the breaker.

use std::time::Duration;
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow; failures are counted.
    Closed,
    /// Requests are rejected until the reset timeout elapses.
    Open,
    /// One probe is in flight; its outcome decides the next state.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Current state, accounting for reset-timeout expiry.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Ask to send a request through the breaker.
    ///
    /// A closed breaker always admits. An open breaker admits nothing until
    /// `reset_timeout` has elapsed, at which point it moves to half-open and
    /// admits a single probe; concurrent callers keep seeing it as closed
    /// to requests until the probe resolves.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let expired = self
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                if expired {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            },
        }
    }

    /// Record a successful call. Closes the breaker.
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// Record a failed call.
    ///
    /// In `closed`, counts toward the threshold; in `half-open`, re-opens
    /// immediately.
    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.config.failure_threshold {
                    self.trip();
                }
            },
            BreakerState::HalfOpen => self.trip(),
            BreakerState::Open => {},
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.failure_count = 0;
        self.probe_in_flight = false;
    }
}
