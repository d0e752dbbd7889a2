//! Rolling per-provider request metrics.

use std::collections::VecDeque;

/// Samples retained per provider.
const WINDOW_CAP: usize = 64;

/// Snapshot of one provider's recent traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderMetrics {
    /// Requests in the window.
    pub requests: u64,
    /// Failed requests in the window.
    pub errors: u64,
    /// Latency of the most recent request, in milliseconds.
    pub last_latency_ms: Option<u64>,
}

/// Rolling window of request outcomes.
#[derive(Debug, Default)]
pub(crate) struct LatencyWindow {
    samples: VecDeque<(bool, u64)>,
}

impl LatencyWindow {
    pub(crate) fn record(&mut self, success: bool, latency_ms: u64) {
        if self.samples.len() >= WINDOW_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back((success, latency_ms));
    }

    pub(crate) fn snapshot(&self) -> ProviderMetrics {
        let requests = self.samples.len() as u64;
        let errors = self.samples.iter().filter(|(ok, _)| !ok).count() as u64;
        let last_latency_ms = self.samples.back().map(|(_, ms)| *ms);
        ProviderMetrics {
            requests,
            errors,
            last_latency_ms,
        }
    }
}
