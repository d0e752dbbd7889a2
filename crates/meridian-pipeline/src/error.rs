//! Pipeline error types.

use thiserror::Error;

/// Errors surfaced by pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A middleware hook failed.
    #[error("middleware {middleware} failed: {message}")]
    MiddlewareFailed {
        /// The middleware's name.
        middleware: String,
        /// What went wrong.
        message: String,
    },

    /// The terminal tool handler failed.
    #[error("tool call {tool} failed: {message}")]
    ToolFailed {
        /// The tool name.
        tool: String,
        /// What went wrong.
        message: String,
    },

    /// Invalid configuration for a pipeline component.
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
