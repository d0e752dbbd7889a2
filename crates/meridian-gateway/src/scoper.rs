//! Conversation key derivation.
//!
//! A conversation key is a pure function of scope, agent, and routing
//! context: identical inputs always yield identical keys. When a scope
//! requires a field the context does not carry, the key degrades to the
//! documented coarser scope and a warning is recorded — the key is still
//! returned, and degraded traffic merges with the coarser conversation
//! rather than forming an orphan bucket.
//!
//! Degradation ladder: `per-channel-peer` and `per-channel-account` fall
//! back to `per-channel`; `per-group` falls back to `per-channel`.

use meridian_core::{AgentId, ConversationKey, RoutingContext};
use meridian_proto::ConversationScope;

/// Result of deriving a conversation key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResolution {
    /// The derived key.
    pub key: ConversationKey,
    /// True when any required field was missing.
    pub degraded: bool,
    /// One warning per missing field.
    pub warnings: Vec<String>,
}

/// Derive the conversation key for a message.
#[must_use]
pub fn resolve_conversation_key(
    scope: ConversationScope,
    agent_id: &AgentId,
    ctx: &RoutingContext,
) -> KeyResolution {
    let mut warnings = Vec::new();
    let mut segments: Vec<String> = Vec::new();

    match scope {
        ConversationScope::Global => {
            segments.push("global".to_string());
        },
        ConversationScope::PerAgent => {
            segments.push(segment("agent", agent_id.as_str()));
        },
        ConversationScope::PerChannel => {
            push_channel(&mut segments, agent_id, ctx);
        },
        ConversationScope::PerChannelPeer => {
            push_channel(&mut segments, agent_id, ctx);
            match ctx.peer_id.as_deref() {
                Some(peer) => segments.push(segment("peer", peer)),
                None => warnings.push("missing peerId".to_string()),
            }
        },
        ConversationScope::PerChannelAccount => {
            push_channel(&mut segments, agent_id, ctx);
            match ctx.account_id.as_deref() {
                Some(account) => segments.push(segment("account", account)),
                None => warnings.push("missing accountId".to_string()),
            }
        },
        ConversationScope::PerGroup => match ctx.group_id.as_deref() {
            Some(group) => {
                segments.push(segment("agent", agent_id.as_str()));
                segments.push(segment("group", group));
            },
            None => {
                // Degrade to the per-channel key.
                warnings.push("missing groupId".to_string());
                push_channel(&mut segments, agent_id, ctx);
            },
        },
    }

    KeyResolution {
        key: ConversationKey::new(segments.join("|")),
        degraded: !warnings.is_empty(),
        warnings,
    }
}

fn push_channel(segments: &mut Vec<String>, agent_id: &AgentId, ctx: &RoutingContext) {
    segments.push(segment("agent", agent_id.as_str()));
    segments.push(segment("channel", ctx.channel_id.as_str()));
}

/// Build one `name:value` segment with the separator escaped out of the
/// value, so field boundaries survive arbitrary input.
fn segment(name: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('|', "\\|");
    format!("{name}:{escaped}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentId {
        AgentId::new("A")
    }

    #[test]
    fn keys_are_deterministic() {
        let ctx = RoutingContext::new("C").with_peer("P");
        let first = resolve_conversation_key(ConversationScope::PerChannelPeer, &agent(), &ctx);
        let second = resolve_conversation_key(ConversationScope::PerChannelPeer, &agent(), &ctx);
        assert_eq!(first, second);
        assert!(!first.degraded);
        assert!(first.warnings.is_empty());
    }

    #[test]
    fn each_scope_has_its_own_shape() {
        let ctx = RoutingContext::new("C")
            .with_peer("P")
            .with_account("X")
            .with_group("G");

        let keys: Vec<_> = [
            ConversationScope::Global,
            ConversationScope::PerAgent,
            ConversationScope::PerChannel,
            ConversationScope::PerChannelPeer,
            ConversationScope::PerChannelAccount,
            ConversationScope::PerGroup,
        ]
        .into_iter()
        .map(|scope| resolve_conversation_key(scope, &agent(), &ctx).key)
        .collect();

        assert_eq!(keys[0].as_str(), "global");
        assert_eq!(keys[1].as_str(), "agent:A");
        assert_eq!(keys[2].as_str(), "agent:A|channel:C");
        assert_eq!(keys[3].as_str(), "agent:A|channel:C|peer:P");
        assert_eq!(keys[4].as_str(), "agent:A|channel:C|account:X");
        assert_eq!(keys[5].as_str(), "agent:A|group:G");
    }

    #[test]
    fn missing_peer_degrades_to_the_per_channel_key() {
        let ctx = RoutingContext::new("C");
        let degraded = resolve_conversation_key(ConversationScope::PerChannelPeer, &agent(), &ctx);
        let coarse = resolve_conversation_key(ConversationScope::PerChannel, &agent(), &ctx);

        assert!(degraded.degraded);
        assert_eq!(degraded.warnings, vec!["missing peerId".to_string()]);
        assert_eq!(degraded.key, coarse.key);
    }

    #[test]
    fn missing_account_degrades_to_the_per_channel_key() {
        let ctx = RoutingContext::new("C").with_peer("P");
        let degraded =
            resolve_conversation_key(ConversationScope::PerChannelAccount, &agent(), &ctx);
        assert!(degraded.degraded);
        assert_eq!(degraded.warnings, vec!["missing accountId".to_string()]);
        assert_eq!(degraded.key.as_str(), "agent:A|channel:C");
    }

    #[test]
    fn missing_group_degrades_to_the_per_channel_key() {
        let ctx = RoutingContext::new("C");
        let degraded = resolve_conversation_key(ConversationScope::PerGroup, &agent(), &ctx);
        assert!(degraded.degraded);
        assert_eq!(degraded.warnings, vec!["missing groupId".to_string()]);
        assert_eq!(degraded.key.as_str(), "agent:A|channel:C");
    }

    #[test]
    fn degraded_iff_warnings_nonempty() {
        let with_peer = RoutingContext::new("C").with_peer("P");
        let without = RoutingContext::new("C");

        let clean = resolve_conversation_key(ConversationScope::PerChannelPeer, &agent(), &with_peer);
        assert_eq!(clean.degraded, !clean.warnings.is_empty());
        assert!(!clean.degraded);

        let dirty = resolve_conversation_key(ConversationScope::PerChannelPeer, &agent(), &without);
        assert_eq!(dirty.degraded, !dirty.warnings.is_empty());
        assert!(dirty.degraded);
    }

    #[test]
    fn separator_in_values_is_escaped() {
        let tricky = RoutingContext::new("a|b").with_peer("p\\q");
        let resolution =
            resolve_conversation_key(ConversationScope::PerChannelPeer, &agent(), &tricky);
        assert_eq!(resolution.key.as_str(), "agent:A|channel:a\\|b|peer:p\\\\q");

        // Distinct inputs that would collide unescaped stay distinct.
        let other = RoutingContext::new("a").with_peer("b|peer:x");
        let other_res = resolve_conversation_key(ConversationScope::PerChannelPeer, &agent(), &other);
        assert_ne!(resolution.key, other_res.key);
    }
}
