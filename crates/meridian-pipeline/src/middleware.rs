//! Middleware trait and pipeline composition.
//!
//! Lifecycle hooks run in declared order. `wrap_tool_call` composes as an
//! onion: the outermost (first declared) middleware is entered first and
//! decides whether to call `next`; returning without calling `next`
//! short-circuits the chain.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::context::TurnContext;
use crate::error::PipelineResult;
use crate::limits::StopReason;

/// A tool invocation traveling through the onion.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    /// Tool name.
    pub name: String,
    /// Tool arguments (JSON).
    pub arguments: Value,
    /// Correlation id for the call.
    pub call_id: String,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// Result content.
    pub content: Value,
    /// Whether the tool reported an error.
    pub is_error: bool,
}

impl ToolResponse {
    /// Create a successful response.
    #[must_use]
    pub fn success(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Terminal handler that actually executes the tool once every middleware
/// has passed the request through.
pub type ToolHandler =
    Arc<dyn Fn(ToolRequest) -> BoxFuture<'static, PipelineResult<ToolResponse>> + Send + Sync>;

/// A pipeline middleware.
///
/// All hooks default to no-ops; implementors override what they need.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable name, used in error reporting and logs.
    fn name(&self) -> &str;

    /// Called once when a session starts.
    async fn on_session_start(&self, _ctx: &mut TurnContext) -> PipelineResult<()> {
        Ok(())
    }

    /// Called before each turn executes.
    async fn on_before_turn(&self, _ctx: &mut TurnContext) -> PipelineResult<()> {
        Ok(())
    }

    /// Called after each turn executes.
    ///
    /// Returning `Some(StopReason)` terminates the session; the stop reason
    /// becomes the turn's terminal output.
    async fn on_after_turn(&self, _ctx: &mut TurnContext) -> PipelineResult<Option<StopReason>> {
        Ok(None)
    }

    /// Called when the session ends, on a best-effort basis.
    async fn on_session_end(&self, _ctx: &mut TurnContext) -> PipelineResult<()> {
        Ok(())
    }

    /// Intercept a tool call.
    ///
    /// The middleware may mutate the request before `next.run(request)`,
    /// post-process the response, or short-circuit by returning a response
    /// without calling `next` at all.
    async fn wrap_tool_call(
        &self,
        request: ToolRequest,
        next: Next<'_>,
    ) -> PipelineResult<ToolResponse> {
        next.run(request).await
    }
}

/// The remainder of the tool-call onion.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a ToolHandler,
}

impl Next<'_> {
    /// Pass the request to the next layer (or the terminal handler).
    pub async fn run(self, request: ToolRequest) -> PipelineResult<ToolResponse> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.wrap_tool_call(
                    request,
                    Next {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            },
            None => (self.terminal)(request).await,
        }
    }
}

/// An ordered middleware chain.
#[derive(Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. Declaration order is invocation order.
    #[must_use]
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Number of middlewares in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// True when no middleware is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run `on_session_start` in declared order. Errors propagate.
    pub async fn session_start(&self, ctx: &mut TurnContext) -> PipelineResult<()> {
        for middleware in &self.middlewares {
            middleware.on_session_start(ctx).await?;
        }
        Ok(())
    }

    /// Run `on_before_turn` in declared order. Errors propagate.
    pub async fn before_turn(&self, ctx: &mut TurnContext) -> PipelineResult<()> {
        for middleware in &self.middlewares {
            middleware.on_before_turn(ctx).await?;
        }
        Ok(())
    }

    /// Run `on_after_turn` in declared order.
    ///
    /// Every middleware is invoked; the first stop reason returned wins.
    pub async fn after_turn(&self, ctx: &mut TurnContext) -> PipelineResult<Option<StopReason>> {
        let mut stop = None;
        for middleware in &self.middlewares {
            let result = middleware.on_after_turn(ctx).await?;
            if stop.is_none() {
                stop = result;
            }
        }
        Ok(stop)
    }

    /// Run `on_session_end` for every middleware, best-effort.
    ///
    /// Failures are logged and do not keep later middlewares from running.
    pub async fn session_end(&self, ctx: &mut TurnContext) {
        for middleware in &self.middlewares {
            if let Err(e) = middleware.on_session_end(ctx).await {
                warn!(middleware = middleware.name(), error = %e, "session end hook failed");
            }
        }
    }

    /// Run a tool call through the onion to the terminal handler.
    pub async fn tool_call(
        &self,
        request: ToolRequest,
        terminal: &ToolHandler,
    ) -> PipelineResult<ToolResponse> {
        Next {
            chain: &self.middlewares,
            terminal,
        }
        .run(request)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
        fail_session_end: bool,
    }

    impl Recorder {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log: Arc::clone(log),
                short_circuit: false,
                fail_session_end: false,
            })
        }

        fn push(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, what));
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_session_start(&self, _ctx: &mut TurnContext) -> PipelineResult<()> {
            self.push("start");
            Ok(())
        }

        async fn on_before_turn(&self, _ctx: &mut TurnContext) -> PipelineResult<()> {
            self.push("before");
            Ok(())
        }

        async fn on_after_turn(&self, _ctx: &mut TurnContext) -> PipelineResult<Option<StopReason>> {
            self.push("after");
            Ok(None)
        }

        async fn on_session_end(&self, _ctx: &mut TurnContext) -> PipelineResult<()> {
            self.push("end");
            if self.fail_session_end {
                return Err(PipelineError::MiddlewareFailed {
                    middleware: self.name.clone(),
                    message: "end failed".to_string(),
                });
            }
            Ok(())
        }

        async fn wrap_tool_call(
            &self,
            mut request: ToolRequest,
            next: Next<'_>,
        ) -> PipelineResult<ToolResponse> {
            self.push("wrap-enter");
            if self.short_circuit {
                return Ok(ToolResponse::error("denied"));
            }
            if let Some(trace) = request.arguments["trace"].as_array_mut() {
                trace.push(json!(self.name.clone()));
            }
            let response = next.run(request).await?;
            self.push("wrap-exit");
            Ok(response)
        }
    }

    fn terminal(log: &Arc<Mutex<Vec<String>>>) -> ToolHandler {
        let log = Arc::clone(log);
        Arc::new(move |request| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push("terminal".to_string());
                Ok(ToolResponse::success(request.arguments))
            })
        })
    }

    fn tool_request() -> ToolRequest {
        ToolRequest {
            name: "search".to_string(),
            arguments: json!({"trace": []}),
            call_id: "c1".to_string(),
        }
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with(Recorder::new("a", &log))
            .with(Recorder::new("b", &log));

        let mut ctx = TurnContext::new("s1");
        pipeline.session_start(&mut ctx).await.unwrap();
        pipeline.before_turn(&mut ctx).await.unwrap();
        pipeline.after_turn(&mut ctx).await.unwrap();
        pipeline.session_end(&mut ctx).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:start", "b:start", "a:before", "b:before", "a:after", "b:after", "a:end",
                "b:end"
            ]
        );
    }

    #[tokio::test]
    async fn tool_call_onion_nests_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with(Recorder::new("outer", &log))
            .with(Recorder::new("inner", &log));

        let handler = terminal(&log);
        let response = pipeline.tool_call(tool_request(), &handler).await.unwrap();

        // Outermost enters first, exits last; request mutations thread
        // through to the terminal handler.
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer:wrap-enter",
                "inner:wrap-enter",
                "terminal",
                "inner:wrap-exit",
                "outer:wrap-exit"
            ]
        );
        assert_eq!(response.content["trace"], json!(["outer", "inner"]));
    }

    #[tokio::test]
    async fn middleware_may_short_circuit_the_onion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let blocker = Arc::new(Recorder {
            name: "blocker".to_string(),
            log: Arc::clone(&log),
            short_circuit: true,
            fail_session_end: false,
        });
        let pipeline = Pipeline::new()
            .with(blocker)
            .with(Recorder::new("inner", &log));

        let handler = terminal(&log);
        let response = pipeline.tool_call(tool_request(), &handler).await.unwrap();
        assert!(response.is_error);
        // Neither the inner middleware nor the terminal ran.
        assert_eq!(*log.lock().unwrap(), vec!["blocker:wrap-enter"]);
    }

    #[tokio::test]
    async fn session_end_is_best_effort() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(Recorder {
            name: "failing".to_string(),
            log: Arc::clone(&log),
            short_circuit: false,
            fail_session_end: true,
        });
        let pipeline = Pipeline::new()
            .with(failing)
            .with(Recorder::new("after", &log));

        let mut ctx = TurnContext::new("s1");
        pipeline.session_end(&mut ctx).await;
        assert_eq!(*log.lock().unwrap(), vec!["failing:end", "after:end"]);
    }

    #[tokio::test]
    async fn empty_pipeline_calls_the_terminal_directly() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        let handler = terminal(&log);
        let response = pipeline.tool_call(tool_request(), &handler).await.unwrap();
        assert!(!response.is_error);
        assert_eq!(*log.lock().unwrap(), vec!["terminal"]);
    }
}
