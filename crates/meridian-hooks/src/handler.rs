//! Handler registration types and interceptor outcomes.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::event::HookEvent;

/// Boxed error handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A hook handler.
///
/// Handlers receive the event and the (possibly waterfalled) event data and
/// return a JSON value. For interceptor events the value must be a valid
/// [`HookOutcome`] shape; for observer events it is ignored. Handlers may
/// come from user code, so the outcome shape is validated at runtime.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invoke the handler.
    async fn call(&self, event: HookEvent, data: Value) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HookEvent, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, event: HookEvent, data: Value) -> Result<Value, HandlerError> {
        (self.0)(event, data).await
    }
}

/// Predicate deciding whether a handler fires for a given event payload.
///
/// A false match skips the handler without consuming its `once` slot.
pub type MatchPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Registration options for a handler.
#[derive(Clone)]
pub struct HookOptions {
    /// Lower priority runs first. Insertion order breaks ties.
    pub priority: i32,
    /// Per-invocation timeout.
    pub timeout: Duration,
    /// Remove the handler after its first firing invocation.
    pub once: bool,
    /// Optional match predicate over event data.
    pub matcher: Option<MatchPredicate>,
}

impl HookOptions {
    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the handler as once.
    #[must_use]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Set a match predicate.
    #[must_use]
    pub fn with_matcher(mut self, matcher: MatchPredicate) -> Self {
        self.matcher = Some(matcher);
        self
    }
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            priority: 100,
            timeout: Duration::from_secs(30),
            once: false,
            matcher: None,
        }
    }
}

impl std::fmt::Debug for HookOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookOptions")
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("once", &self.once)
            .field("has_matcher", &self.matcher.is_some())
            .finish()
    }
}

/// Validated outcome of an interceptor handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Leave the propagating data untouched.
    Continue,
    /// Replace the propagating data for downstream handlers.
    Modify(Value),
    /// Stop propagation; the emit result is the block.
    Block {
        /// Why the handler blocked.
        reason: String,
    },
}

impl HookOutcome {
    /// Validate a raw handler return value into an outcome.
    ///
    /// Accepted shapes: `{"action":"continue"}`, `{"action":"modify",
    /// "data":...}`, `{"action":"block","reason":"..."}`. Anything else is
    /// rejected with a description of the problem.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing \"action\" field".to_string())?;
        match action {
            "continue" => Ok(Self::Continue),
            "modify" => {
                let data = value
                    .get("data")
                    .ok_or_else(|| "modify outcome missing \"data\"".to_string())?;
                Ok(Self::Modify(data.clone()))
            },
            "block" => {
                let reason = value
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("blocked")
                    .to_string();
                Ok(Self::Block { reason })
            },
            other => Err(format!("unknown action \"{other}\"")),
        }
    }

    /// Encode the outcome back into its wire shape.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Continue => serde_json::json!({"action": "continue"}),
            Self::Modify(data) => serde_json::json!({"action": "modify", "data": data}),
            Self::Block { reason } => serde_json::json!({"action": "block", "reason": reason}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_outcomes_parse() {
        assert_eq!(
            HookOutcome::from_value(&json!({"action": "continue"})).unwrap(),
            HookOutcome::Continue
        );
        assert_eq!(
            HookOutcome::from_value(&json!({"action": "modify", "data": {"x": 1}})).unwrap(),
            HookOutcome::Modify(json!({"x": 1}))
        );
        assert_eq!(
            HookOutcome::from_value(&json!({"action": "block", "reason": "nope"})).unwrap(),
            HookOutcome::Block {
                reason: "nope".to_string()
            }
        );
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert!(HookOutcome::from_value(&json!({})).is_err());
        assert!(HookOutcome::from_value(&json!({"action": "retry"})).is_err());
        assert!(HookOutcome::from_value(&json!({"action": "modify"})).is_err());
        assert!(HookOutcome::from_value(&json!(42)).is_err());
    }

    #[test]
    fn outcomes_round_trip() {
        for outcome in [
            HookOutcome::Continue,
            HookOutcome::Modify(json!([1, 2])),
            HookOutcome::Block {
                reason: "r".to_string(),
            },
        ] {
            let back = HookOutcome::from_value(&outcome.to_value()).unwrap();
            assert_eq!(back, outcome);
        }
    }
}
