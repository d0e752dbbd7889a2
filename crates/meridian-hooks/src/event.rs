//! Hook event taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dispatch semantics of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Handlers may modify or block the propagating data.
    Interceptor,
    /// Handlers observe; they cannot influence propagation.
    Observer,
}

/// Events dispatched through the hook bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// A node session started.
    SessionStart,
    /// A node session ended.
    SessionEnd,
    /// A turn is about to execute. Interceptor.
    BeforeTurn,
    /// A turn finished executing.
    AfterTurn,
    /// A tool call is about to dispatch. Interceptor.
    PreToolCall,
    /// A tool call returned.
    PostToolCall,
    /// A model request is about to dispatch. Interceptor.
    PreModelCall,
    /// A model request returned.
    PostModelCall,
    /// An inbound message was routed to a node.
    MessageRouted,
    /// A delivery-tracked message was acknowledged.
    MessageDelivered,
    /// A node connected to the gateway.
    NodeConnected,
    /// A node disconnected from the gateway.
    NodeDisconnected,
    /// The configuration manifest was reloaded.
    ConfigUpdated,
}

impl HookEvent {
    /// Dispatch semantics for this event.
    #[must_use]
    pub fn kind(self) -> EventKind {
        match self {
            Self::BeforeTurn | Self::PreToolCall | Self::PreModelCall => EventKind::Interceptor,
            Self::SessionStart
            | Self::SessionEnd
            | Self::AfterTurn
            | Self::PostToolCall
            | Self::PostModelCall
            | Self::MessageRouted
            | Self::MessageDelivered
            | Self::NodeConnected
            | Self::NodeDisconnected
            | Self::ConfigUpdated => EventKind::Observer,
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::BeforeTurn => "before_turn",
            Self::AfterTurn => "after_turn",
            Self::PreToolCall => "pre_tool_call",
            Self::PostToolCall => "post_tool_call",
            Self::PreModelCall => "pre_model_call",
            Self::PostModelCall => "post_model_call",
            Self::MessageRouted => "message_routed",
            Self::MessageDelivered => "message_delivered",
            Self::NodeConnected => "node_connected",
            Self::NodeDisconnected => "node_disconnected",
            Self::ConfigUpdated => "config_updated",
        };
        f.write_str(name)
    }
}
