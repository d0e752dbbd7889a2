//! Routing context attached to every inbound message.
//!
//! Channel adapters normalize platform messages into a [`RoutingContext`];
//! binding rules and the conversation scoper both match on its fields.

use serde::{Deserialize, Serialize};

use crate::id::ChannelId;

/// The routing-relevant fields of an inbound message.
///
/// `channel_id` is always present; the remaining fields depend on what the
/// source platform exposes (a DM has a peer, a guild message has a group,
/// and so on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingContext {
    /// Channel the message arrived on.
    pub channel_id: ChannelId,
    /// Platform user the message came from, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Platform account the adapter is signed in as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Group / guild / workspace the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Platform message kind (e.g. `dm`, `mention`, `thread_reply`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    /// Thread the message belongs to, for platforms with threading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Fields of the routing context that binding rules may match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutingField {
    /// The `channel_id` field.
    ChannelId,
    /// The `peer_id` field.
    PeerId,
    /// The `account_id` field.
    AccountId,
    /// The `group_id` field.
    GroupId,
    /// The `message_type` field.
    MessageType,
}

impl RoutingContext {
    /// Create a context with only a channel id.
    pub fn new(channel_id: impl Into<ChannelId>) -> Self {
        Self {
            channel_id: channel_id.into(),
            peer_id: None,
            account_id: None,
            group_id: None,
            message_type: None,
            thread_id: None,
        }
    }

    /// Set the peer id.
    #[must_use]
    pub fn with_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// Set the account id.
    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Set the group id.
    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the message type.
    #[must_use]
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Set the thread id.
    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Look up a matchable field by name.
    ///
    /// Returns `None` when the field is absent from this context.
    #[must_use]
    pub fn field(&self, field: RoutingField) -> Option<&str> {
        match field {
            RoutingField::ChannelId => Some(self.channel_id.as_str()),
            RoutingField::PeerId => self.peer_id.as_deref(),
            RoutingField::AccountId => self.account_id.as_deref(),
            RoutingField::GroupId => self.group_id.as_deref(),
            RoutingField::MessageType => self.message_type.as_deref(),
        }
    }
}
