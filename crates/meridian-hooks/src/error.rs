//! Hook bus error types.

use thiserror::Error;

use crate::event::HookEvent;

/// Errors surfaced by hook dispatch.
#[derive(Debug, Error)]
pub enum HookError {
    /// A handler returned an error.
    #[error("handler failed for {event}: {message}")]
    HandlerFailed {
        /// The event being dispatched.
        event: HookEvent,
        /// The handler's error, stringified.
        message: String,
    },

    /// A handler exceeded its timeout.
    #[error("handler timed out for {event} after {timeout_ms}ms")]
    HandlerTimeout {
        /// The event being dispatched.
        event: HookEvent,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// An interceptor returned a value that is not a valid outcome shape.
    #[error("invalid interceptor outcome for {event}: {detail}")]
    InvalidOutcome {
        /// The event being dispatched.
        event: HookEvent,
        /// What was wrong with the returned value.
        detail: String,
    },

    /// Nested emits exceeded the depth cap.
    #[error("hook re-entrancy exceeded: depth {depth} >= max {max_depth}")]
    ReentrancyExceeded {
        /// Depth at the point of the failed emit.
        depth: usize,
        /// Configured maximum depth.
        max_depth: usize,
    },
}

/// Result type for hook operations.
pub type HookResult<T> = Result<T, HookError>;
