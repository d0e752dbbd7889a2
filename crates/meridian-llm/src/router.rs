//! Failover router multiplexing model calls across providers and keys.
//!
//! A call walks an ordered candidate chain (default model plus fallbacks),
//! gated per provider by a circuit breaker. Failures classify into a
//! failure class; the resolved strategy maps each class to an action: key
//! rotation, jittered backoff, moving to the next candidate, or a
//! thinking-budget downgrade. Key rotation does not count against the
//! retry cap; everything else does.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::JitteredBackoff;
use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::error::{
    FailoverAction, FailoverStrategy, FailureClass, ProviderError, RouterError, RouterResult,
};
use crate::metrics::{LatencyWindow, ProviderMetrics};
use crate::provider::{ChunkStream, ModelProvider};
use crate::types::{ChatRequest, ChatResponse, ModelRef, StreamChunk, TokenUsage};

/// Boxed error for router callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Emitted after every successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    /// Provider that served the call.
    pub provider: String,
    /// Model that served the call.
    pub model: String,
    /// Token accounting.
    pub usage: TokenUsage,
}

/// Subscriber for usage events. Errors are swallowed so one bad subscriber
/// cannot poison metrics.
pub type UsageSubscriber = Arc<dyn Fn(&UsageEvent) -> Result<(), CallbackError> + Send + Sync>;

/// Callback that may reorder the candidate chain per request.
///
/// An error or an empty result falls back to the unfiltered chain.
pub type PreselectFn =
    Arc<dyn Fn(&ChatRequest, &[ModelRef]) -> Result<Vec<ModelRef>, CallbackError> + Send + Sync>;

/// Router tuning.
#[derive(Debug, Clone)]
pub struct ModelRouterConfig {
    /// Cap on attempts counted across all candidates.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff delay cap in milliseconds.
    pub backoff_cap_ms: u64,
    /// Circuit breaker tuning, applied per provider.
    pub breaker: BreakerConfig,
    /// Whether thinking downgrade is enabled.
    pub thinking_downgrade: bool,
    /// Failure class to action mapping.
    pub strategy: FailoverStrategy,
}

impl Default for ModelRouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            breaker: BreakerConfig::default(),
            thinking_downgrade: true,
            strategy: FailoverStrategy::default(),
        }
    }
}

struct KeyState {
    value: String,
    available: bool,
}

struct KeyRing {
    keys: Vec<KeyState>,
    cursor: usize,
}

impl KeyRing {
    fn new(keys: Vec<String>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|value| KeyState {
                    value,
                    available: true,
                })
                .collect(),
            cursor: 0,
        }
    }

    /// Index of the first available key at or after the cursor.
    fn current_index(&self) -> Option<usize> {
        let len = self.keys.len();
        let mut order = (self.cursor..len).chain(0..self.cursor);
        order.find(|&i| self.keys[i].available)
    }

    fn current(&self) -> Option<String> {
        self.current_index().map(|i| self.keys[i].value.clone())
    }

    /// Mark the current key unavailable and advance. Returns whether any
    /// key remains available.
    fn rotate(&mut self) -> bool {
        if let Some(i) = self.current_index() {
            self.keys[i].available = false;
            self.cursor = i.saturating_add(1).checked_rem(self.keys.len()).unwrap_or(0);
        }
        self.keys.iter().any(|k| k.available)
    }
}

struct ProviderEntry {
    provider: Arc<dyn ModelProvider>,
    keys: Mutex<KeyRing>,
}

impl ProviderEntry {
    fn current_key(&self) -> Option<String> {
        self.keys.lock().ok().and_then(|ring| ring.current())
    }

    fn rotate_key(&self) -> bool {
        self.keys.lock().map_or(false, |mut ring| ring.rotate())
    }
}

/// What the failover plan says to do after a failed attempt.
enum NextStep {
    /// Retry the same candidate immediately.
    Retry,
    /// Sleep, then retry the same candidate with the same key.
    Sleep(Duration),
    /// Move to the next candidate in the chain.
    NextCandidate,
    /// Surface an error to the caller.
    Abort(RouterError),
}

/// Multiplexes model calls across providers and keys.
pub struct ModelRouter {
    default_model: ModelRef,
    fallback_chain: Vec<ModelRef>,
    providers: Mutex<HashMap<String, Arc<ProviderEntry>>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    metrics: Mutex<HashMap<String, LatencyWindow>>,
    preselect: Mutex<Option<PreselectFn>>,
    usage_subscribers: Mutex<Vec<UsageSubscriber>>,
    config: ModelRouterConfig,
}

impl ModelRouter {
    /// Create a router with the given default model.
    #[must_use]
    pub fn new(default_model: ModelRef, config: ModelRouterConfig) -> Self {
        Self {
            default_model,
            fallback_chain: Vec::new(),
            providers: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
            preselect: Mutex::new(None),
            usage_subscribers: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Set the ordered fallback chain tried after the default model.
    #[must_use]
    pub fn with_fallback_chain(mut self, chain: Vec<ModelRef>) -> Self {
        self.fallback_chain = chain;
        self
    }

    /// Register a provider with its credential set.
    pub fn register_provider(&self, provider: Arc<dyn ModelProvider>, keys: Vec<String>) {
        let id = provider.id().to_string();
        let entry = Arc::new(ProviderEntry {
            provider,
            keys: Mutex::new(KeyRing::new(keys)),
        });
        if let Ok(mut providers) = self.providers.lock() {
            providers.insert(id, entry);
        }
    }

    /// Install a candidate pre-selection callback.
    pub fn set_preselect(&self, callback: PreselectFn) {
        if let Ok(mut slot) = self.preselect.lock() {
            *slot = Some(callback);
        }
    }

    /// Subscribe to usage events.
    pub fn on_usage(&self, subscriber: UsageSubscriber) {
        if let Ok(mut subscribers) = self.usage_subscribers.lock() {
            subscribers.push(subscriber);
        }
    }

    /// Rolling metrics per provider.
    #[must_use]
    pub fn get_metrics(&self) -> HashMap<String, ProviderMetrics> {
        self.metrics.lock().map_or_else(
            |_| HashMap::new(),
            |windows| {
                windows
                    .iter()
                    .map(|(provider, window)| (provider.clone(), window.snapshot()))
                    .collect()
            },
        )
    }

    /// Current breaker state for a provider, if any requests have flowed.
    #[must_use]
    pub fn breaker_state(&self, provider: &str) -> Option<BreakerState> {
        self.breakers
            .lock()
            .ok()
            .and_then(|breakers| breakers.get(provider).map(CircuitBreaker::state))
    }

    /// Complete a request, failing over per the configured strategy.
    ///
    /// # Errors
    ///
    /// [`RouterError::Cancelled`] when the token fires;
    /// [`RouterError::Provider`] for non-recoverable provider errors;
    /// [`RouterError::AllProvidersFailed`] when the retry cap or candidate
    /// chain is exhausted.
    pub async fn complete(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> RouterResult<ChatResponse> {
        if cancel.is_cancelled() {
            return Err(RouterError::Cancelled);
        }
        let candidates = self.candidates(&request);
        let mut request = request;
        let mut attempts: u32 = 0;
        let mut last_error: Option<ProviderError> = None;

        'candidates: for candidate in &candidates {
            let Some(entry) = self.entry(&candidate.provider) else {
                warn!(provider = %candidate.provider, "candidate has no registered provider");
                continue;
            };
            let mut backoff =
                JitteredBackoff::new(self.config.backoff_base_ms, self.config.backoff_cap_ms);

            loop {
                if attempts >= self.config.max_retries {
                    break 'candidates;
                }
                if !self.breaker_try_acquire(&candidate.provider) {
                    debug!(provider = %candidate.provider, "circuit open, skipping candidate");
                    continue 'candidates;
                }
                let Some(key) = entry.current_key() else {
                    continue 'candidates;
                };

                let mut attempt_request = request.clone();
                attempt_request.model = Some(candidate.model.clone());
                attempt_request.api_key = Some(key);

                let started = std::time::Instant::now();
                let result = tokio::select! {
                    () = cancel.cancelled() => return Err(RouterError::Cancelled),
                    result = entry.provider.complete(&attempt_request, cancel) => result,
                };
                let latency_ms = elapsed_ms(started);

                match result {
                    Ok(response) => {
                        self.record_success(&candidate.provider, latency_ms);
                        self.emit_usage(&UsageEvent {
                            provider: candidate.provider.clone(),
                            model: response.model.clone(),
                            usage: response.usage,
                        });
                        return Ok(response);
                    },
                    Err(error) => {
                        self.record_failure(&candidate.provider, error.class(), latency_ms);
                        match self.plan_failure(
                            &entry,
                            &mut request,
                            &mut backoff,
                            &mut attempts,
                            &mut last_error,
                            error,
                        ) {
                            NextStep::Retry => {},
                            NextStep::Sleep(delay) => {
                                tokio::select! {
                                    () = cancel.cancelled() => return Err(RouterError::Cancelled),
                                    () = tokio::time::sleep(delay) => {},
                                }
                            },
                            NextStep::NextCandidate => continue 'candidates,
                            NextStep::Abort(e) => return Err(e),
                        }
                    },
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            attempts,
            source: last_error,
        })
    }

    /// Stream a completion.
    ///
    /// Errors before the first chunk follow the same failover as
    /// [`ModelRouter::complete`]; errors after the first chunk propagate to
    /// the consumer, because partial content has already been observed.
    pub async fn stream(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> RouterResult<ChunkStream> {
        if cancel.is_cancelled() {
            return Err(RouterError::Cancelled);
        }
        let candidates = self.candidates(&request);
        let mut request = request;
        let mut attempts: u32 = 0;
        let mut last_error: Option<ProviderError> = None;

        'candidates: for candidate in &candidates {
            let Some(entry) = self.entry(&candidate.provider) else {
                warn!(provider = %candidate.provider, "candidate has no registered provider");
                continue;
            };
            let mut backoff =
                JitteredBackoff::new(self.config.backoff_base_ms, self.config.backoff_cap_ms);

            loop {
                if attempts >= self.config.max_retries {
                    break 'candidates;
                }
                if !self.breaker_try_acquire(&candidate.provider) {
                    debug!(provider = %candidate.provider, "circuit open, skipping candidate");
                    continue 'candidates;
                }
                let Some(key) = entry.current_key() else {
                    continue 'candidates;
                };

                let mut attempt_request = request.clone();
                attempt_request.model = Some(candidate.model.clone());
                attempt_request.api_key = Some(key);

                let started = std::time::Instant::now();
                let result = tokio::select! {
                    () = cancel.cancelled() => return Err(RouterError::Cancelled),
                    result = entry.provider.stream(&attempt_request, cancel) => result,
                };

                let head_error = match result {
                    Ok(mut stream) => {
                        let head = tokio::select! {
                            () = cancel.cancelled() => return Err(RouterError::Cancelled),
                            head = stream.next() => head,
                        };
                        match head {
                            Some(Ok(first)) => {
                                self.record_success(&candidate.provider, elapsed_ms(started));
                                return Ok(self.passthrough(candidate, first, stream));
                            },
                            Some(Err(error)) => error,
                            None => {
                                self.record_success(&candidate.provider, elapsed_ms(started));
                                return Ok(Box::pin(futures::stream::empty()));
                            },
                        }
                    },
                    Err(error) => error,
                };

                self.record_failure(&candidate.provider, head_error.class(), elapsed_ms(started));
                match self.plan_failure(
                    &entry,
                    &mut request,
                    &mut backoff,
                    &mut attempts,
                    &mut last_error,
                    head_error,
                ) {
                    NextStep::Retry => {},
                    NextStep::Sleep(delay) => {
                        tokio::select! {
                            () = cancel.cancelled() => return Err(RouterError::Cancelled),
                            () = tokio::time::sleep(delay) => {},
                        }
                    },
                    NextStep::NextCandidate => continue 'candidates,
                    NextStep::Abort(e) => return Err(e),
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            attempts,
            source: last_error,
        })
    }

    /// Wrap an established stream, re-yielding the probed first chunk and
    /// emitting usage events as usage chunks flow past.
    fn passthrough(
        &self,
        candidate: &ModelRef,
        first: StreamChunk,
        mut inner: ChunkStream,
    ) -> ChunkStream {
        let subscribers = self
            .usage_subscribers
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        let provider = candidate.provider.clone();
        let model = candidate.model.clone();

        Box::pin(async_stream::stream! {
            if let StreamChunk::Usage(usage) = &first {
                notify_usage(&subscribers, &UsageEvent {
                    provider: provider.clone(),
                    model: model.clone(),
                    usage: *usage,
                });
            }
            yield Ok(first);
            while let Some(item) = inner.next().await {
                if let Ok(StreamChunk::Usage(usage)) = &item {
                    notify_usage(&subscribers, &UsageEvent {
                        provider: provider.clone(),
                        model: model.clone(),
                        usage: *usage,
                    });
                }
                yield item;
            }
        })
    }

    /// Ordered candidate chain for a request.
    fn candidates(&self, request: &ChatRequest) -> Vec<ModelRef> {
        let mut chain = Vec::with_capacity(self.fallback_chain.len().saturating_add(1));
        chain.push(self.default_model.clone());
        chain.extend(self.fallback_chain.iter().cloned());

        let preselect = self.preselect.lock().ok().and_then(|slot| slot.clone());
        if let Some(callback) = preselect {
            match callback(request, &chain) {
                Ok(reordered) if !reordered.is_empty() => return reordered,
                Ok(_) => debug!("pre-selection returned empty chain, using unfiltered candidates"),
                Err(e) => {
                    warn!(error = %e, "pre-selection callback failed, using unfiltered candidates");
                },
            }
        }
        chain
    }

    fn entry(&self, provider: &str) -> Option<Arc<ProviderEntry>> {
        self.providers
            .lock()
            .ok()
            .and_then(|providers| providers.get(provider).cloned())
    }

    fn breaker_try_acquire(&self, provider: &str) -> bool {
        self.breakers.lock().map_or(true, |mut breakers| {
            breakers
                .entry(provider.to_string())
                .or_insert_with(|| CircuitBreaker::new(self.config.breaker.clone()))
                .try_acquire()
        })
    }

    fn record_success(&self, provider: &str, latency_ms: u64) {
        if let Ok(mut breakers) = self.breakers.lock()
            && let Some(breaker) = breakers.get_mut(provider)
        {
            breaker.record_success();
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.entry(provider.to_string()).or_default().record(true, latency_ms);
        }
    }

    fn record_failure(&self, provider: &str, class: FailureClass, latency_ms: u64) {
        // Only provider-health failures count toward the breaker; auth,
        // billing, and request-shape failures are not a provider outage.
        if matches!(class, FailureClass::ModelError | FailureClass::Timeout)
            && let Ok(mut breakers) = self.breakers.lock()
            && let Some(breaker) = breakers.get_mut(provider)
        {
            breaker.record_failure();
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.entry(provider.to_string()).or_default().record(false, latency_ms);
        }
    }

    /// Decide what a failed attempt means for the loop.
    fn plan_failure(
        &self,
        entry: &ProviderEntry,
        request: &mut ChatRequest,
        backoff: &mut JitteredBackoff,
        attempts: &mut u32,
        last_error: &mut Option<ProviderError>,
        error: ProviderError,
    ) -> NextStep {
        let class = error.class();
        match self.config.strategy.action_for(class) {
            FailoverAction::RotateKey => {
                // Rotation is free: it does not consume a retry slot.
                let has_more = entry.rotate_key();
                debug!(has_more, "rotating provider key");
                *last_error = Some(error);
                if has_more {
                    NextStep::Retry
                } else {
                    NextStep::NextCandidate
                }
            },
            FailoverAction::Backoff => {
                *attempts = attempts.saturating_add(1);
                let delay = error.retry_after().unwrap_or_else(|| backoff.next_delay());
                *last_error = Some(error);
                NextStep::Sleep(delay)
            },
            FailoverAction::NextCandidate => {
                *attempts = attempts.saturating_add(1);
                *last_error = Some(error);
                NextStep::NextCandidate
            },
            FailoverAction::ThinkingDowngrade => {
                if self.config.thinking_downgrade
                    && let Some(next) = request.thinking.downgrade()
                {
                    *attempts = attempts.saturating_add(1);
                    debug!(from = %request.thinking, to = %next, "downgrading thinking directive");
                    request.thinking = next;
                    *last_error = Some(error);
                    NextStep::Retry
                } else {
                    // Already at the bottom of the chain (or downgrade is
                    // disabled): the failure propagates.
                    NextStep::Abort(RouterError::Provider { source: error })
                }
            },
        }
    }

    fn emit_usage(&self, event: &UsageEvent) {
        let subscribers = self
            .usage_subscribers
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        notify_usage(&subscribers, event);
    }
}

fn notify_usage(subscribers: &[UsageSubscriber], event: &UsageEvent) {
    for subscriber in subscribers {
        if let Err(e) = subscriber(event) {
            warn!(error = %e, "usage subscriber failed");
        }
    }
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
