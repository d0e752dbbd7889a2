//! Provider and router error types, and the failover strategy that maps
//! failure classes to recovery actions.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors a model provider can surface.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The credential was rejected.
    #[error("authentication failed for {provider}")]
    AuthFailed {
        /// Provider id.
        provider: String,
    },

    /// The account cannot be billed (quota exhausted, payment failure).
    #[error("billing failed for {provider}")]
    BillingFailed {
        /// Provider id.
        provider: String,
    },

    /// The provider throttled the request.
    #[error("rate limited by {provider}")]
    RateLimited {
        /// Provider id.
        provider: String,
        /// Provider-supplied wait, when present.
        retry_after: Option<Duration>,
    },

    /// The request exceeded its time budget.
    #[error("request to {provider} timed out")]
    Timeout {
        /// Provider id.
        provider: String,
    },

    /// The model returned an error.
    #[error("model error from {provider}: {message}")]
    ModelError {
        /// Provider id.
        provider: String,
        /// Provider-supplied detail.
        message: String,
    },

    /// The request did not fit the model's context window.
    #[error("context overflow at {provider}")]
    ContextOverflow {
        /// Provider id.
        provider: String,
    },

    /// The requested thinking budget was rejected.
    #[error("thinking directive rejected by {provider}")]
    ThinkingFailed {
        /// Provider id.
        provider: String,
    },

    /// The stream broke after it started.
    #[error("stream error from {provider}: {message}")]
    StreamError {
        /// Provider id.
        provider: String,
        /// What broke.
        message: String,
    },
}

impl ProviderError {
    /// The failure class this error belongs to.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::AuthFailed { .. } => FailureClass::AuthFailed,
            Self::BillingFailed { .. } => FailureClass::BillingFailed,
            Self::RateLimited { .. } => FailureClass::RateLimited,
            Self::Timeout { .. } => FailureClass::Timeout,
            Self::ModelError { .. } | Self::StreamError { .. } => FailureClass::ModelError,
            Self::ContextOverflow { .. } => FailureClass::ContextOverflow,
            Self::ThinkingFailed { .. } => FailureClass::ThinkingFailed,
        }
    }

    /// Provider-supplied backoff, when the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Classification of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Credential rejected.
    AuthFailed,
    /// Billing or quota failure.
    BillingFailed,
    /// Throttled.
    RateLimited,
    /// Time budget exceeded.
    Timeout,
    /// Model-side error.
    ModelError,
    /// Request too large for the context window.
    ContextOverflow,
    /// Thinking directive rejected.
    ThinkingFailed,
}

/// Recovery action for a failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// Mark the current key unavailable and advance to the next one.
    RotateKey,
    /// Wait (provider-supplied or full-jitter) and retry the same
    /// candidate with the same key.
    Backoff,
    /// Move to the next candidate in the chain.
    NextCandidate,
    /// Downgrade the thinking directive one step and retry the same
    /// candidate.
    ThinkingDowngrade,
}

/// Maps failure classes to recovery actions.
///
/// The default mapping follows the standard policy; individual classes can
/// be overridden.
#[derive(Debug, Clone, Default)]
pub struct FailoverStrategy {
    overrides: HashMap<FailureClass, FailoverAction>,
}

impl FailoverStrategy {
    /// Create the default strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the action for one failure class.
    #[must_use]
    pub fn with_override(mut self, class: FailureClass, action: FailoverAction) -> Self {
        self.overrides.insert(class, action);
        self
    }

    /// Resolve the action for a failure class.
    #[must_use]
    pub fn action_for(&self, class: FailureClass) -> FailoverAction {
        if let Some(action) = self.overrides.get(&class) {
            return *action;
        }
        match class {
            FailureClass::AuthFailed | FailureClass::BillingFailed => FailoverAction::RotateKey,
            FailureClass::RateLimited | FailureClass::Timeout => FailoverAction::Backoff,
            FailureClass::ModelError => FailoverAction::NextCandidate,
            FailureClass::ContextOverflow | FailureClass::ThinkingFailed => {
                FailoverAction::ThinkingDowngrade
            },
        }
    }
}

/// Errors surfaced by the model router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Every candidate was exhausted.
    #[error("all providers failed after {attempts} attempts")]
    AllProvidersFailed {
        /// Attempts counted against the retry cap.
        attempts: u32,
        /// The last provider error observed.
        #[source]
        source: Option<ProviderError>,
    },

    /// A non-recoverable provider error (e.g. a thinking failure with no
    /// downgrade step left).
    #[error("provider error")]
    Provider {
        /// The underlying error.
        #[source]
        source: ProviderError,
    },

    /// The call was cancelled via its token.
    #[error("model call cancelled")]
    Cancelled,
}

/// Result type for router operations.
pub type RouterResult<T> = Result<T, RouterError>;
