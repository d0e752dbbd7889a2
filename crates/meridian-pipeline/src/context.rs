//! Per-turn execution context.

use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

/// Context threaded through every middleware hook of a turn.
///
/// `metadata` is the cross-middleware communication surface (entities,
/// memories, audit spans, permission checks). Writers must merge into
/// known sibling keys rather than overwrite them; [`TurnContext::merge_metadata`]
/// implements that discipline.
#[derive(Debug, Clone)]
pub struct TurnContext {
    /// Session the turn belongs to.
    pub session_id: String,
    /// Correlates all hooks of the current turn invocation. Fresh per
    /// turn.
    pub invocation_id: Uuid,
    /// 1-based turn counter; 0 before the first turn begins.
    pub turn_number: u32,
    /// Turn input.
    pub input: Value,
    /// Turn output; populated as the turn executes.
    pub output: Value,
    /// Names of tools called during this turn, in call order.
    pub tool_calls: Vec<String>,
    /// Cross-middleware metadata.
    pub metadata: Map<String, Value>,
    /// When the session started; drives the wall-clock limit.
    pub session_started_at: Instant,
}

impl TurnContext {
    /// Create a fresh context for a session.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            invocation_id: Uuid::new_v4(),
            turn_number: 0,
            input: Value::Null,
            output: Value::Null,
            tool_calls: Vec::new(),
            metadata: Map::new(),
            session_started_at: Instant::now(),
        }
    }

    /// Start the next turn with the given input, minting a fresh
    /// invocation id.
    pub fn begin_turn(&mut self, input: Value) {
        self.invocation_id = Uuid::new_v4();
        self.turn_number = self.turn_number.saturating_add(1);
        self.input = input;
        self.output = Value::Null;
        self.tool_calls.clear();
    }

    /// Record a tool call made during this turn.
    pub fn record_tool_call(&mut self, name: impl Into<String>) {
        self.tool_calls.push(name.into());
    }

    /// Merge a value into a metadata key.
    ///
    /// Objects merge key-by-key (recursively), arrays append, anything else
    /// replaces. This keeps sibling middlewares from clobbering each
    /// other's entries under shared keys.
    pub fn merge_metadata(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.metadata.remove(&key) {
            Some(existing) => {
                let merged = merge_values(existing, value);
                self.metadata.insert(key, merged);
            },
            None => {
                self.metadata.insert(key, value);
            },
        }
    }

    /// Read a boolean metadata flag, defaulting to false.
    #[must_use]
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

fn merge_values(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.remove(&key) {
                    Some(prior) => {
                        base.insert(key, merge_values(prior, value));
                    },
                    None => {
                        base.insert(key, value);
                    },
                }
            }
            Value::Object(base)
        },
        (Value::Array(mut base), Value::Array(overlay)) => {
            base.extend(overlay);
            Value::Array(base)
        },
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn begin_turn_advances_and_resets() {
        let mut ctx = TurnContext::new("s1");
        ctx.begin_turn(json!("hello"));
        ctx.record_tool_call("search");
        ctx.output = json!("result");
        assert_eq!(ctx.turn_number, 1);
        let first_invocation = ctx.invocation_id;

        ctx.begin_turn(json!("next"));
        assert_eq!(ctx.turn_number, 2);
        assert_eq!(ctx.output, Value::Null);
        assert!(ctx.tool_calls.is_empty());
        // Each turn gets its own invocation id.
        assert_ne!(ctx.invocation_id, first_invocation);
    }

    #[tokio::test]
    async fn metadata_objects_merge_instead_of_overwriting() {
        let mut ctx = TurnContext::new("s1");
        ctx.merge_metadata("entities", json!({"people": {"alice": 1}}));
        ctx.merge_metadata("entities", json!({"people": {"bob": 2}, "places": {"hq": 3}}));

        assert_eq!(
            ctx.metadata.get("entities").unwrap(),
            &json!({"people": {"alice": 1, "bob": 2}, "places": {"hq": 3}})
        );
    }

    #[tokio::test]
    async fn metadata_arrays_append() {
        let mut ctx = TurnContext::new("s1");
        ctx.merge_metadata("memories", json!(["a"]));
        ctx.merge_metadata("memories", json!(["b", "c"]));
        assert_eq!(ctx.metadata.get("memories").unwrap(), &json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn scalars_replace() {
        let mut ctx = TurnContext::new("s1");
        ctx.merge_metadata("budget_exhausted", json!(false));
        ctx.merge_metadata("budget_exhausted", json!(true));
        assert!(ctx.metadata_flag("budget_exhausted"));
    }
}
