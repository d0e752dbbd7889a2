//! Declarative agent binding rules.
//!
//! A binding maps a match predicate over routing-context fields to an
//! agent id. Rules compile once into closures over literal, wildcard, or
//! glob patterns; resolution walks them in declaration order and the
//! first match wins. An empty match object is a catch-all — its presence
//! intentionally disables downstream channel-based routing.

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::trace;

use meridian_core::{AgentId, RoutingContext, RoutingField};

use crate::error::{GatewayError, GatewayResult};

/// Raw field patterns as declared in configuration.
///
/// Each field is a pattern string: a literal, `*` (any present value), or
/// a glob (e.g. `discord:*`). An unset field matches anything, absent or
/// not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSpec {
    /// Pattern over `channel_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Pattern over `peer_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Pattern over `account_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Pattern over `group_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Pattern over `message_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

impl MatchSpec {
    /// True when no field pattern is declared (matches every message).
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.channel_id.is_none()
            && self.peer_id.is_none()
            && self.account_id.is_none()
            && self.group_id.is_none()
            && self.message_type.is_none()
    }
}

/// One declared binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRule {
    /// The match predicate.
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    /// Agent emitted when the predicate matches.
    #[serde(rename = "agentId")]
    pub agent_id: AgentId,
}

#[derive(Debug)]
enum FieldPattern {
    Literal(String),
    Wildcard,
    Glob(GlobMatcher),
}

impl FieldPattern {
    fn compile(pattern: &str) -> GatewayResult<Self> {
        if pattern == "*" {
            return Ok(Self::Wildcard);
        }
        if pattern.contains(['*', '?', '[']) {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|e| GatewayError::InvalidBinding {
                    message: format!("bad glob {pattern:?}: {e}"),
                })?;
            return Ok(Self::Glob(glob.compile_matcher()));
        }
        Ok(Self::Literal(pattern.to_string()))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == value,
            Self::Wildcard => true,
            Self::Glob(matcher) => matcher.is_match(value),
        }
    }
}

#[derive(Debug)]
struct CompiledBinding {
    patterns: Vec<(RoutingField, FieldPattern)>,
    agent_id: AgentId,
}

impl CompiledBinding {
    fn matches(&self, ctx: &RoutingContext) -> bool {
        // A declared pattern requires the field to be present and matching.
        self.patterns
            .iter()
            .all(|(field, pattern)| ctx.field(*field).is_some_and(|value| pattern.matches(value)))
    }
}

/// Declaration-ordered compiled binding set.
#[derive(Debug)]
pub struct BindingResolver {
    bindings: Vec<CompiledBinding>,
    has_catch_all: bool,
}

impl BindingResolver {
    /// Compile a declaration-ordered rule list.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidBinding`] when a glob pattern fails to
    /// compile.
    pub fn compile(rules: &[BindingRule]) -> GatewayResult<Self> {
        let mut bindings = Vec::with_capacity(rules.len());
        let mut has_catch_all = false;

        for rule in rules {
            has_catch_all = has_catch_all || rule.match_spec.is_catch_all();
            let spec = &rule.match_spec;
            let mut patterns = Vec::new();
            for (field, pattern) in [
                (RoutingField::ChannelId, &spec.channel_id),
                (RoutingField::PeerId, &spec.peer_id),
                (RoutingField::AccountId, &spec.account_id),
                (RoutingField::GroupId, &spec.group_id),
                (RoutingField::MessageType, &spec.message_type),
            ] {
                if let Some(pattern) = pattern {
                    patterns.push((field, FieldPattern::compile(pattern)?));
                }
            }
            bindings.push(CompiledBinding {
                patterns,
                agent_id: rule.agent_id.clone(),
            });
        }

        Ok(Self {
            bindings,
            has_catch_all,
        })
    }

    /// First matching agent in declaration order, if any.
    #[must_use]
    pub fn resolve(&self, ctx: &RoutingContext) -> Option<&AgentId> {
        for binding in &self.bindings {
            if binding.matches(ctx) {
                trace!(agent_id = %binding.agent_id, "binding matched");
                return Some(&binding.agent_id);
            }
        }
        None
    }

    /// True when any rule is a catch-all.
    #[must_use]
    pub fn has_catch_all(&self) -> bool {
        self.has_catch_all
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True when no rules are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(spec: MatchSpec, agent: &str) -> BindingRule {
        BindingRule {
            match_spec: spec,
            agent_id: AgentId::new(agent),
        }
    }

    #[test]
    fn literal_match_on_channel() {
        let resolver = BindingResolver::compile(&[rule(
            MatchSpec {
                channel_id: Some("discord:general".to_string()),
                ..MatchSpec::default()
            },
            "support",
        )])
        .unwrap();

        let ctx = RoutingContext::new("discord:general");
        assert_eq!(resolver.resolve(&ctx), Some(&AgentId::new("support")));
        assert_eq!(resolver.resolve(&RoutingContext::new("discord:random")), None);
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let resolver = BindingResolver::compile(&[
            rule(
                MatchSpec {
                    channel_id: Some("discord:*".to_string()),
                    ..MatchSpec::default()
                },
                "discord-agent",
            ),
            rule(
                MatchSpec {
                    channel_id: Some("discord:vip".to_string()),
                    ..MatchSpec::default()
                },
                "vip-agent",
            ),
        ])
        .unwrap();

        // The broader rule is declared first, so it shadows the specific
        // one.
        let ctx = RoutingContext::new("discord:vip");
        assert_eq!(resolver.resolve(&ctx), Some(&AgentId::new("discord-agent")));
    }

    #[test]
    fn glob_patterns_match_prefixes() {
        let resolver = BindingResolver::compile(&[rule(
            MatchSpec {
                channel_id: Some("slack:*".to_string()),
                message_type: Some("dm".to_string()),
                ..MatchSpec::default()
            },
            "dm-agent",
        )])
        .unwrap();

        let ctx = RoutingContext::new("slack:eng").with_message_type("dm");
        assert_eq!(resolver.resolve(&ctx), Some(&AgentId::new("dm-agent")));

        let ctx = RoutingContext::new("slack:eng").with_message_type("mention");
        assert_eq!(resolver.resolve(&ctx), None);
    }

    #[test]
    fn wildcard_requires_presence() {
        let resolver = BindingResolver::compile(&[rule(
            MatchSpec {
                peer_id: Some("*".to_string()),
                ..MatchSpec::default()
            },
            "peer-agent",
        )])
        .unwrap();

        assert_eq!(
            resolver.resolve(&RoutingContext::new("c1").with_peer("u1")),
            Some(&AgentId::new("peer-agent"))
        );
        // No peer: a wildcard on peerId does not match.
        assert_eq!(resolver.resolve(&RoutingContext::new("c1")), None);
    }

    #[test]
    fn catch_all_matches_everything() {
        let resolver = BindingResolver::compile(&[
            rule(
                MatchSpec {
                    channel_id: Some("telegram:*".to_string()),
                    ..MatchSpec::default()
                },
                "telegram-agent",
            ),
            rule(MatchSpec::default(), "default-agent"),
        ])
        .unwrap();

        assert!(resolver.has_catch_all());
        assert_eq!(
            resolver.resolve(&RoutingContext::new("anything")),
            Some(&AgentId::new("default-agent"))
        );
        assert_eq!(
            resolver.resolve(&RoutingContext::new("telegram:x")),
            Some(&AgentId::new("telegram-agent"))
        );
    }

    #[test]
    fn bad_glob_is_rejected_at_compile() {
        let err = BindingResolver::compile(&[rule(
            MatchSpec {
                channel_id: Some("[unclosed".to_string()),
                ..MatchSpec::default()
            },
            "broken",
        )])
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidBinding { .. }));
    }

    #[test]
    fn rules_deserialize_from_config_shape() {
        let rules: Vec<BindingRule> = serde_json::from_str(
            r#"[
                {"match": {"channelId": "discord:*", "messageType": "dm"}, "agentId": "a1"},
                {"match": {}, "agentId": "fallback"}
            ]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[1].match_spec.is_catch_all());
        let resolver = BindingResolver::compile(&rules).unwrap();
        assert_eq!(resolver.len(), 2);
    }
}
