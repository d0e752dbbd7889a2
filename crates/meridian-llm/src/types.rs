//! Request, response, and streaming types for model calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A provider/model pair addressable by the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    /// Provider id (matches a registered [`crate::ModelProvider`]).
    pub provider: String,
    /// Provider-specific model name.
    pub model: String,
}

impl ModelRef {
    /// Create a model reference.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Requested model reasoning depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    /// No extra reasoning budget. Providers without thinking support must
    /// accept this.
    #[default]
    None,
    /// Standard reasoning budget.
    Standard,
    /// Extended reasoning budget.
    Extended,
    /// Provider picks the budget per request.
    Adaptive,
}

impl ThinkingLevel {
    /// One step down the downgrade chain, or `None` when already at the
    /// bottom: `adaptive → standard → none`, `extended → standard → none`.
    #[must_use]
    pub fn downgrade(self) -> Option<Self> {
        match self {
            Self::Adaptive | Self::Extended => Some(Self::Standard),
            Self::Standard => Some(Self::None),
            Self::None => None,
        }
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Standard => write!(f, "standard"),
            Self::Extended => write!(f, "extended"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Model output.
    Assistant,
    /// Tool result.
    Tool,
}

/// A conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
}

impl Message {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Tool arguments (JSON).
    pub arguments: Value,
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input JSON schema.
    pub input_schema: Value,
}

/// A model request.
#[derive(Clone)]
pub struct ChatRequest {
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// System prompt.
    pub system: String,
    /// Tools available to the model.
    pub tools: Vec<ToolDefinition>,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Requested reasoning depth.
    pub thinking: ThinkingLevel,
    /// Model name to use; set by the router per candidate.
    pub model: Option<String>,
    /// Credential to use; set by the router per attempt.
    pub api_key: Option<String>,
}

impl ChatRequest {
    /// Create a request from messages.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            system: String::new(),
            tools: Vec::new(),
            max_tokens: 4096,
            thinking: ThinkingLevel::None,
            model: None,
            api_key: None,
        }
    }

    /// Set the system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    /// Set the available tools.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the thinking level.
    #[must_use]
    pub fn with_thinking(mut self, thinking: ThinkingLevel) -> Self {
        self.thinking = thinking;
        self
    }

    /// Set the max token budget.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatRequest")
            .field("messages", &self.messages.len())
            .field("tools", &self.tools.len())
            .field("max_tokens", &self.max_tokens)
            .field("thinking", &self.thinking)
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

/// Token accounting for a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the request.
    pub input_tokens: u64,
    /// Tokens produced by the model.
    pub output_tokens: u64,
}

/// A completed model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The assistant message.
    pub message: Message,
    /// Tool calls requested by the model, if any.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Model that served the call.
    pub model: String,
    /// Token accounting.
    pub usage: TokenUsage,
}

/// One element of a model output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Incremental text.
    Content {
        /// The text delta.
        text: String,
    },
    /// A tool call.
    ToolCall(ToolCall),
    /// Token accounting, typically near the end of the stream.
    Usage(TokenUsage),
    /// Generation finished.
    Done,
}
