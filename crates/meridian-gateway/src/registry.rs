//! Live worker node registry.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use meridian_core::{CowMap, NodeId};

use crate::error::{GatewayError, GatewayResult};

/// A node known to the gateway.
#[derive(Debug, Clone)]
pub struct RegisteredNode {
    /// The node's id.
    pub node_id: NodeId,
    /// Capabilities the node declared at registration.
    pub capabilities: Vec<String>,
    /// Authentication principal from the handshake, if any.
    pub principal: Option<String>,
    /// When the node first registered.
    pub connected_at: DateTime<Utc>,
}

impl RegisteredNode {
    /// Create a registration record.
    #[must_use]
    pub fn new(node_id: NodeId, capabilities: Vec<String>) -> Self {
        Self {
            node_id,
            capabilities,
            principal: None,
            connected_at: Utc::now(),
        }
    }

    /// Attach the authentication principal.
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// True when the node declared a capability.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Tracks live nodes by id.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: CowMap<NodeId, Arc<RegisteredNode>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// # Errors
    ///
    /// [`GatewayError::AlreadyRegistered`] when the id is live.
    pub fn register(&self, node: RegisteredNode) -> GatewayResult<()> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(GatewayError::AlreadyRegistered {
                node_id: node.node_id.to_string(),
            });
        }
        self.nodes.insert(node.node_id.clone(), Arc::new(node));
        Ok(())
    }

    /// Remove a node, returning its record.
    pub fn deregister(&self, node_id: &NodeId) -> Option<Arc<RegisteredNode>> {
        self.nodes.remove(node_id)
    }

    /// Look up a node.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<Arc<RegisteredNode>> {
        self.nodes.get(node_id)
    }

    /// True when the id is registered.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All registered node ids.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.snapshot().keys().cloned().collect()
    }

    /// Nodes declaring a capability.
    #[must_use]
    pub fn with_capability(&self, capability: &str) -> Vec<Arc<RegisteredNode>> {
        self.nodes
            .snapshot()
            .values()
            .filter(|node| node.has_capability(capability))
            .cloned()
            .collect()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no node is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_conflict() {
        let registry = NodeRegistry::new();
        registry
            .register(RegisteredNode::new(NodeId::new("n1"), vec!["chat".to_string()]))
            .unwrap();

        let err = registry
            .register(RegisteredNode::new(NodeId::new("n1"), Vec::new()))
            .unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyRegistered { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deregister_frees_the_id() {
        let registry = NodeRegistry::new();
        registry
            .register(RegisteredNode::new(NodeId::new("n1"), Vec::new()))
            .unwrap();
        assert!(registry.deregister(&NodeId::new("n1")).is_some());
        assert!(registry.deregister(&NodeId::new("n1")).is_none());
        registry
            .register(RegisteredNode::new(NodeId::new("n1"), Vec::new()))
            .unwrap();
    }

    #[test]
    fn capability_lookup() {
        let registry = NodeRegistry::new();
        registry
            .register(
                RegisteredNode::new(NodeId::new("n1"), vec!["chat".to_string(), "code".to_string()])
                    .with_principal("ops"),
            )
            .unwrap();
        registry
            .register(RegisteredNode::new(NodeId::new("n2"), vec!["chat".to_string()]))
            .unwrap();

        assert_eq!(registry.with_capability("code").len(), 1);
        assert_eq!(registry.with_capability("chat").len(), 2);
        assert!(registry.get(&NodeId::new("n1")).unwrap().has_capability("code"));
    }
}
