//! Middleware pipeline for agent turns.
//!
//! Middlewares hook the turn lifecycle (`on_session_start`,
//! `on_before_turn`, `on_after_turn`, `on_session_end`) and may intercept
//! tool calls through an onion-composed `wrap_tool_call`. The crate also
//! carries the loop detector and the execution-limits middleware that
//! gates runaway turns.

pub mod context;
pub mod error;
pub mod limits;
pub mod loop_detector;
pub mod middleware;

pub use context::TurnContext;
pub use error::{PipelineError, PipelineResult};
pub use limits::{
    ExecutionLimits, ExecutionLimitsConfig, LoopAction, LoopDetectionConfig, StopReason,
};
pub use loop_detector::{LoopDetection, LoopDetector};
pub use middleware::{Middleware, Next, Pipeline, ToolHandler, ToolRequest, ToolResponse};
