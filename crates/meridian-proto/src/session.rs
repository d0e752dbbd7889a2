//! Session lifecycle states and events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a node session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The node is live and exchanging messages.
    Connected,
    /// No activity for `session_timeout`; still reachable.
    Idle,
    /// The transport dropped or the node went quiet; awaiting reconnect.
    Suspended,
    /// Terminal. Sessions never persist in this state.
    Disconnected,
}

/// Events driving session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// Any message or pong from the node.
    Activity,
    /// The idle timer fired.
    IdleTimeout,
    /// The suspend timer fired.
    SuspendTimeout,
    /// The node re-established its transport.
    Reconnect,
    /// The transport closed or the node was declared dead.
    Disconnect,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Idle => write!(f, "idle"),
            Self::Suspended => write!(f, "suspended"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activity => write!(f, "activity"),
            Self::IdleTimeout => write!(f, "idle_timeout"),
            Self::SuspendTimeout => write!(f, "suspend_timeout"),
            Self::Reconnect => write!(f, "reconnect"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}
