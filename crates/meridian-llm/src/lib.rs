//! Model provider abstraction and failover router.
//!
//! Providers implement [`ModelProvider`]; the [`ModelRouter`] multiplexes
//! requests across them with per-provider circuit breakers, API-key
//! rotation, jittered retry, capability-preserving failover, and a
//! thinking-budget downgrade chain.

pub mod backoff;
pub mod breaker;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod router;
pub mod types;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use error::{
    FailoverAction, FailoverStrategy, FailureClass, ProviderError, ProviderResult, RouterError,
    RouterResult,
};
pub use metrics::ProviderMetrics;
pub use provider::{ChunkStream, ModelProvider};
pub use router::{ModelRouter, ModelRouterConfig, UsageEvent, UsageSubscriber};
pub use types::{
    ChatRequest, ChatResponse, Message, MessageRole, ModelRef, StreamChunk, ThinkingLevel,
    TokenUsage, ToolCall, ToolDefinition,
};
