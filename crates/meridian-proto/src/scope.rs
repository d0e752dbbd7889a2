//! Conversation scopes.
//!
//! A scope names the granularity at which conversations are isolated; the
//! conversation scoper derives a stable key from the scope and the routing
//! context of a message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Granularity at which conversations are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationScope {
    /// One conversation for the whole deployment.
    Global,
    /// One conversation per agent.
    PerAgent,
    /// One conversation per agent and channel.
    PerChannel,
    /// One conversation per agent, channel, and peer.
    #[default]
    PerChannelPeer,
    /// One conversation per agent, channel, and platform account.
    PerChannelAccount,
    /// One conversation per agent and group.
    PerGroup,
}

impl fmt::Display for ConversationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::PerAgent => write!(f, "per-agent"),
            Self::PerChannel => write!(f, "per-channel"),
            Self::PerChannelPeer => write!(f, "per-channel-peer"),
            Self::PerChannelAccount => write!(f, "per-channel-account"),
            Self::PerGroup => write!(f, "per-group"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_per_channel_peer() {
        assert_eq!(ConversationScope::default(), ConversationScope::PerChannelPeer);
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&ConversationScope::PerChannelAccount).unwrap();
        assert_eq!(json, "\"per-channel-account\"");
        let scope: ConversationScope = serde_json::from_str("\"per-group\"").unwrap();
        assert_eq!(scope, ConversationScope::PerGroup);
    }
}
