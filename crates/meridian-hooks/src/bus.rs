//! Priority-ordered hook dispatch.
//!
//! Handler lists are immutable snapshots held in a [`CowMap`]: registration
//! and removal replace the list reference, so an in-flight emit keeps
//! iterating the list it started with. Emit depth is tracked in task-local
//! storage; nested emits within one logical task share a counter while
//! concurrent emits in unrelated tasks do not.

use serde_json::Value;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace, warn};

use meridian_core::CowMap;

use crate::error::{HookError, HookResult};
use crate::event::{EventKind, HookEvent};
use crate::handler::{Handler, HookOptions, HookOutcome};

tokio::task_local! {
    static EMIT_DEPTH: Cell<usize>;
}

/// Callback invoked when an observer handler fails.
pub type ObserverErrorHandler = Arc<dyn Fn(&HookEvent, &HookError) + Send + Sync>;

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct HookBusConfig {
    /// Maximum nested emit depth before a re-entrancy error.
    pub max_depth: usize,
}

impl Default for HookBusConfig {
    fn default() -> Self {
        Self { max_depth: 8 }
    }
}

struct HandlerEntry {
    /// Registration id; monotonically increasing, so it doubles as the
    /// insertion-order tie breaker.
    id: u64,
    options: HookOptions,
    handler: Arc<dyn Handler>,
}

struct BusInner {
    handlers: CowMap<HookEvent, Vec<Arc<HandlerEntry>>>,
    next_id: AtomicU64,
    config: HookBusConfig,
    observer_error: Mutex<Option<ObserverErrorHandler>>,
}

impl BusInner {
    fn remove(&self, event: HookEvent, id: u64) {
        if let Some(list) = self.handlers.get(&event) {
            let next: Vec<_> = list.into_iter().filter(|e| e.id != id).collect();
            if next.is_empty() {
                self.handlers.remove(&event);
            } else {
                self.handlers.insert(event, next);
            }
        }
    }
}

/// Removes a registered handler when invoked.
///
/// Dropping the disposer without calling [`HookDisposer::dispose`] leaves
/// the handler registered.
pub struct HookDisposer {
    bus: Weak<BusInner>,
    event: HookEvent,
    id: u64,
}

impl HookDisposer {
    /// Remove the handler this disposer was returned for.
    pub fn dispose(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.event, self.id);
        }
    }
}

/// Result of an interceptor emit.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    /// Every handler ran; `data` carries the waterfalled result.
    Completed {
        /// Final event data after all modifications.
        data: Value,
    },
    /// A handler blocked propagation.
    Blocked {
        /// The blocking handler's reason.
        reason: String,
        /// Event data as of the block, including earlier modifications.
        data: Value,
    },
}

impl EmitOutcome {
    /// True when a handler blocked the emit.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// The waterfalled event data, whatever the outcome.
    #[must_use]
    pub fn data(&self) -> &Value {
        match self {
            Self::Completed { data } | Self::Blocked { data, .. } => data,
        }
    }
}

/// Priority-ordered hook dispatcher.
#[derive(Clone)]
pub struct HookBus {
    inner: Arc<BusInner>,
}

impl HookBus {
    /// Create a bus with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HookBusConfig::default())
    }

    /// Create a bus with the given configuration.
    #[must_use]
    pub fn with_config(config: HookBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: CowMap::new(),
                next_id: AtomicU64::new(1),
                config,
                observer_error: Mutex::new(None),
            }),
        }
    }

    /// Route observer handler failures to a callback instead of the log.
    pub fn on_observer_error(&self, callback: ObserverErrorHandler) {
        if let Ok(mut slot) = self.inner.observer_error.lock() {
            *slot = Some(callback);
        }
    }

    /// Register a handler for an event.
    ///
    /// Handlers run lowest priority first; insertion order breaks ties.
    /// Returns a disposer that removes the handler.
    pub fn on(
        &self,
        event: HookEvent,
        handler: Arc<dyn Handler>,
        options: HookOptions,
    ) -> HookDisposer {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(HandlerEntry {
            id,
            options,
            handler,
        });
        let mut list = self.inner.handlers.get(&event).unwrap_or_default();
        list.push(entry);
        list.sort_by_key(|e| (e.options.priority, e.id));
        self.inner.handlers.insert(event, list);

        trace!(event = %event, handler_id = id, "hook handler registered");
        HookDisposer {
            bus: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Register a handler that is removed after its first firing invocation.
    ///
    /// A non-matching predicate does not consume the handler; an invocation
    /// that errors or times out does.
    pub fn once(
        &self,
        event: HookEvent,
        handler: Arc<dyn Handler>,
        options: HookOptions,
    ) -> HookDisposer {
        self.on(event, handler, options.once())
    }

    /// Number of handlers currently registered for an event.
    #[must_use]
    pub fn handler_count(&self, event: HookEvent) -> usize {
        self.inner.handlers.get(&event).map_or(0, |l| l.len())
    }

    /// Emit an interceptor event, waterfalling data through handlers.
    ///
    /// Each handler receives the data as modified by its predecessors. A
    /// `block` outcome short-circuits the chain and is the emit result.
    /// Handler errors, timeouts, and invalid outcome shapes abort the emit.
    ///
    /// # Errors
    ///
    /// [`HookError::ReentrancyExceeded`] when nested emits exceed the depth
    /// cap; [`HookError::HandlerFailed`] / [`HookError::HandlerTimeout`] /
    /// [`HookError::InvalidOutcome`] for the respective handler failures.
    pub async fn emit(&self, event: HookEvent, data: Value) -> HookResult<EmitOutcome> {
        debug_assert_eq!(event.kind(), EventKind::Interceptor);
        let depth = self.enter_depth()?;
        let inner = Arc::clone(&self.inner);
        EMIT_DEPTH
            .scope(Cell::new(depth), async move {
                Self::run_interceptors(&inner, event, data).await
            })
            .await
    }

    /// Emit an observer event.
    ///
    /// Handlers run in priority order; a handler failure is reported to the
    /// observer-error callback (or logged) and the chain continues.
    ///
    /// # Errors
    ///
    /// Only [`HookError::ReentrancyExceeded`] propagates.
    pub async fn emit_observer(&self, event: HookEvent, data: Value) -> HookResult<()> {
        debug_assert_eq!(event.kind(), EventKind::Observer);
        let depth = self.enter_depth()?;
        let inner = Arc::clone(&self.inner);
        EMIT_DEPTH
            .scope(Cell::new(depth), async move {
                Self::run_observers(&inner, event, data).await;
            })
            .await;
        Ok(())
    }

    /// Read the current depth and validate the cap, returning the depth the
    /// nested scope should carry.
    fn enter_depth(&self) -> HookResult<usize> {
        let current = EMIT_DEPTH.try_with(Cell::get).unwrap_or(0);
        if current >= self.inner.config.max_depth {
            return Err(HookError::ReentrancyExceeded {
                depth: current,
                max_depth: self.inner.config.max_depth,
            });
        }
        Ok(current.saturating_add(1))
    }

    async fn run_interceptors(
        inner: &BusInner,
        event: HookEvent,
        mut data: Value,
    ) -> HookResult<EmitOutcome> {
        let Some(snapshot) = inner.handlers.get(&event) else {
            return Ok(EmitOutcome::Completed { data });
        };

        for entry in &snapshot {
            if let Some(matcher) = &entry.options.matcher
                && !matcher(&data)
            {
                continue;
            }

            let result = Self::invoke(inner, event, entry, data.clone()).await;
            let value = result?;
            match HookOutcome::from_value(&value) {
                Ok(HookOutcome::Continue) => {},
                Ok(HookOutcome::Modify(next)) => data = next,
                Ok(HookOutcome::Block { reason }) => {
                    debug!(event = %event, handler_id = entry.id, reason = %reason, "hook blocked emit");
                    return Ok(EmitOutcome::Blocked { reason, data });
                },
                Err(detail) => {
                    return Err(HookError::InvalidOutcome { event, detail });
                },
            }
        }

        Ok(EmitOutcome::Completed { data })
    }

    async fn run_observers(inner: &BusInner, event: HookEvent, data: Value) {
        let Some(snapshot) = inner.handlers.get(&event) else {
            return;
        };

        for entry in &snapshot {
            if let Some(matcher) = &entry.options.matcher
                && !matcher(&data)
            {
                continue;
            }

            if let Err(error) = Self::invoke(inner, event, entry, data.clone()).await {
                let callback = inner
                    .observer_error
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone());
                if let Some(callback) = callback {
                    callback(&event, &error);
                } else {
                    warn!(event = %event, handler_id = entry.id, error = %error, "observer handler failed");
                }
            }
        }
    }

    /// Invoke one handler with its timeout, consuming its `once` slot.
    async fn invoke(
        inner: &BusInner,
        event: HookEvent,
        entry: &Arc<HandlerEntry>,
        data: Value,
    ) -> HookResult<Value> {
        let timeout = entry.options.timeout;
        let result = tokio::time::timeout(timeout, entry.handler.call(event, data)).await;

        // A firing invocation consumes `once` whatever its outcome, timeouts
        // and cancellations included.
        if entry.options.once {
            inner.remove(event, entry.id);
        }

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(HookError::HandlerFailed {
                event,
                message: e.to_string(),
            }),
            Err(_elapsed) => Err(HookError::HandlerTimeout {
                event,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}
