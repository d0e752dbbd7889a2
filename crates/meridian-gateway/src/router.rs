//! Message routing.
//!
//! Dispatch precedence: a configured binding resolver is consulted first;
//! when it yields an agent, the agent's node wins. Only a resolver miss
//! falls through to the legacy `channel → node` bindings. All routing
//! maps are copy-on-write values, so concurrent readers work on stable
//! snapshots while mutations swap the reference atomically.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use meridian_core::{AgentId, ChannelId, ConversationKey, CowMap, NodeId};
use meridian_proto::{ConversationScope, LaneMessage};

use crate::bindings::BindingResolver;
use crate::error::{GatewayError, GatewayResult};
use crate::scoper::{KeyResolution, resolve_conversation_key};

/// Delivers a message toward one node.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatch one message.
    async fn dispatch(&self, message: LaneMessage) -> GatewayResult<()>;
}

/// Resolves an agent to its current node.
pub type AgentNodeResolver = Arc<dyn Fn(&AgentId) -> Option<NodeId> + Send + Sync>;

/// Notified when a conversation key was derived degraded.
pub type DegradationHandler = Arc<dyn Fn(&KeyResolution) + Send + Sync>;

/// Notified when the conversation store crosses its soft threshold, with
/// `(current_len, soft_threshold)`.
pub type StoreWarningHandler = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Conversation store tuning.
#[derive(Debug, Clone, Copy)]
pub struct ConversationStoreConfig {
    /// Hard cap; oldest bindings evict beyond it.
    pub capacity: usize,
    /// Optional soft threshold for the warning handler.
    pub soft_threshold: Option<usize>,
}

impl Default for ConversationStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            soft_threshold: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ConversationBinding {
    node_id: NodeId,
    seq: u64,
}

/// Capped `conversation key → node` store with oldest-first eviction.
pub struct ConversationStore {
    bindings: CowMap<ConversationKey, ConversationBinding>,
    seq: AtomicU64,
    config: ConversationStoreConfig,
    warning: Mutex<Option<StoreWarningHandler>>,
}

impl ConversationStore {
    /// Create a store.
    #[must_use]
    pub fn new(config: ConversationStoreConfig) -> Self {
        Self {
            bindings: CowMap::new(),
            seq: AtomicU64::new(0),
            config,
            warning: Mutex::new(None),
        }
    }

    /// Install the soft-threshold warning handler.
    pub fn on_threshold(&self, handler: StoreWarningHandler) {
        if let Ok(mut slot) = self.warning.lock() {
            *slot = Some(handler);
        }
    }

    /// Bind (or re-home) a conversation to a node.
    pub fn bind(&self, key: ConversationKey, node_id: NodeId) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.bindings.insert(key, ConversationBinding { node_id, seq });

        while self.bindings.len() > self.config.capacity {
            let oldest = self
                .bindings
                .snapshot()
                .iter()
                .min_by_key(|(_, binding)| binding.seq)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    debug!(key = %key, "conversation store at capacity, evicting oldest binding");
                    self.bindings.remove(&key);
                },
                None => break,
            }
        }

        if let Some(soft) = self.config.soft_threshold {
            let len = self.bindings.len();
            if len >= soft {
                let handler = self.warning.lock().ok().and_then(|slot| slot.clone());
                if let Some(handler) = handler {
                    handler(len, soft);
                }
            }
        }
    }

    /// Current node for a conversation.
    #[must_use]
    pub fn get(&self, key: &ConversationKey) -> Option<NodeId> {
        self.bindings.get(key).map(|binding| binding.node_id)
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True when no binding exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Routes inbound messages to node dispatchers.
pub struct Router {
    channel_bindings: CowMap<ChannelId, NodeId>,
    dispatchers: CowMap<NodeId, Arc<dyn Dispatcher>>,
    agent_scopes: CowMap<AgentId, ConversationScope>,
    default_scope: ConversationScope,
    resolver: Mutex<Option<Arc<BindingResolver>>>,
    agent_nodes: Mutex<Option<AgentNodeResolver>>,
    conversations: Mutex<Option<Arc<ConversationStore>>>,
    degradation: Mutex<Option<DegradationHandler>>,
}

impl Router {
    /// Create a router with the given default conversation scope.
    #[must_use]
    pub fn new(default_scope: ConversationScope) -> Self {
        Self {
            channel_bindings: CowMap::new(),
            dispatchers: CowMap::new(),
            agent_scopes: CowMap::new(),
            default_scope,
            resolver: Mutex::new(None),
            agent_nodes: Mutex::new(None),
            conversations: Mutex::new(None),
            degradation: Mutex::new(None),
        }
    }

    /// Install (or replace) the binding resolver.
    pub fn set_resolver(&self, resolver: Arc<BindingResolver>) {
        if resolver.has_catch_all() {
            debug!("binding resolver has a catch-all rule; channel routing is disabled");
        }
        if let Ok(mut slot) = self.resolver.lock() {
            *slot = Some(resolver);
        }
    }

    /// Install the agent → node resolver used by binding-based routing.
    pub fn set_agent_node_resolver(&self, resolver: AgentNodeResolver) {
        if let Ok(mut slot) = self.agent_nodes.lock() {
            *slot = Some(resolver);
        }
    }

    /// Attach a conversation store.
    pub fn set_conversation_store(&self, store: Arc<ConversationStore>) {
        if let Ok(mut slot) = self.conversations.lock() {
            *slot = Some(store);
        }
    }

    /// Install the degradation handler.
    pub fn set_degradation_handler(&self, handler: DegradationHandler) {
        if let Ok(mut slot) = self.degradation.lock() {
            *slot = Some(handler);
        }
    }

    /// Bind a channel to a node (legacy single-agent routing).
    pub fn bind_channel(&self, channel_id: ChannelId, node_id: NodeId) {
        self.channel_bindings.insert(channel_id, node_id);
    }

    /// Remove a channel binding.
    pub fn unbind_channel(&self, channel_id: &ChannelId) -> Option<NodeId> {
        self.channel_bindings.remove(channel_id)
    }

    /// Install a node's dispatcher.
    pub fn set_dispatcher(&self, node_id: NodeId, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatchers.insert(node_id, dispatcher);
    }

    /// Remove a node's dispatcher (the node stays addressable once it
    /// returns).
    pub fn remove_dispatcher(&self, node_id: &NodeId) {
        self.dispatchers.remove(node_id);
    }

    /// Remove everything owned by a deregistered node: its dispatcher and
    /// any channel bindings to it. Conversation bindings stay — they
    /// re-home on the next dispatch to their key.
    pub fn remove_node(&self, node_id: &NodeId) {
        self.dispatchers.remove(node_id);
        let removed = self.channel_bindings.retain(|_, bound| bound != node_id);
        if removed > 0 {
            debug!(node_id = %node_id, removed, "channel bindings invalidated");
        }
    }

    /// Override the conversation scope for one agent.
    pub fn set_agent_scope(&self, agent_id: AgentId, scope: ConversationScope) {
        self.agent_scopes.insert(agent_id, scope);
    }

    /// Run the binding resolver over a message, if one is configured.
    #[must_use]
    pub fn resolve_agent(&self, message: &LaneMessage) -> Option<AgentId> {
        let resolver = self.resolver.lock().ok().and_then(|slot| slot.clone())?;
        resolver.resolve(&message.routing_context).cloned()
    }

    /// Route a message to a node and dispatch it.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NodeNotFound`] when no binding, agent mapping, or
    /// dispatcher can produce a live node.
    pub async fn route(&self, message: &LaneMessage) -> GatewayResult<NodeId> {
        // Binding-based routing takes precedence.
        if let Some(agent_id) = self.resolve_agent(message) {
            let resolve = self.agent_nodes.lock().ok().and_then(|slot| slot.clone());
            let Some(resolve) = resolve else {
                return Err(GatewayError::NodeNotFound {
                    detail: format!("no agent-node resolver for agent {agent_id}"),
                });
            };
            let Some(node_id) = resolve(&agent_id) else {
                return Err(GatewayError::NodeNotFound {
                    detail: format!("no node for agent {agent_id}"),
                });
            };
            self.dispatch_to(&node_id, message.clone()).await?;
            return Ok(node_id);
        }

        // Legacy channel binding.
        let Some(node_id) = self.channel_bindings.get(&message.channel_id) else {
            return Err(GatewayError::NodeNotFound {
                detail: format!("no binding for channel {}", message.channel_id),
            });
        };
        self.dispatch_to(&node_id, message.clone()).await?;
        Ok(node_id)
    }

    /// Route a message and bind its conversation key to the chosen node.
    ///
    /// The route runs first: a routing failure creates no conversation
    /// binding. A degraded key resolution is reported to the degradation
    /// handler after a successful dispatch. Returns the routed node along
    /// with the key resolution.
    ///
    /// # Errors
    ///
    /// Same as [`Router::route`].
    pub async fn route_with_scope(
        &self,
        message: &LaneMessage,
        agent_id: &AgentId,
    ) -> GatewayResult<(NodeId, KeyResolution)> {
        let scope = self.agent_scopes.get(agent_id).unwrap_or(self.default_scope);
        let resolution = resolve_conversation_key(scope, agent_id, &message.routing_context);

        let node_id = self.route(message).await?;

        let store = self.conversations.lock().ok().and_then(|slot| slot.clone());
        if let Some(store) = store {
            store.bind(resolution.key.clone(), node_id.clone());
        }

        if resolution.degraded {
            warn!(agent_id = %agent_id, warnings = ?resolution.warnings, "conversation key degraded");
            let handler = self.degradation.lock().ok().and_then(|slot| slot.clone());
            if let Some(handler) = handler {
                handler(&resolution);
            }
        }

        Ok((node_id, resolution))
    }

    async fn dispatch_to(&self, node_id: &NodeId, message: LaneMessage) -> GatewayResult<()> {
        let Some(dispatcher) = self.dispatchers.get(node_id) else {
            return Err(GatewayError::NodeNotFound {
                detail: format!("no dispatcher for node {node_id}"),
            });
        };
        dispatcher.dispatch(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{BindingRule, MatchSpec};
    use meridian_core::RoutingContext;
    use meridian_proto::Lane;
    use serde_json::json;

    struct RecordingDispatcher {
        dispatched: Mutex<Vec<LaneMessage>>,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dispatched: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.dispatched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, message: LaneMessage) -> GatewayResult<()> {
            self.dispatched.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn message(channel: &str) -> LaneMessage {
        LaneMessage::new(Lane::Collect, RoutingContext::new(channel), json!("hi"))
    }

    fn resolver(rules: &[BindingRule]) -> Arc<BindingResolver> {
        Arc::new(BindingResolver::compile(rules).unwrap())
    }

    #[tokio::test]
    async fn channel_binding_routes_when_no_resolver() {
        let router = Router::new(ConversationScope::default());
        let dispatcher = RecordingDispatcher::new();
        router.set_dispatcher(NodeId::new("n1"), Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        router.bind_channel(ChannelId::new("c1"), NodeId::new("n1"));

        let node = router.route(&message("c1")).await.unwrap();
        assert_eq!(node, NodeId::new("n1"));
        assert_eq!(dispatcher.count(), 1);
    }

    #[tokio::test]
    async fn unbound_channel_is_node_not_found() {
        let router = Router::new(ConversationScope::default());
        let err = router.route(&message("nowhere")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NodeNotFound { .. }));
    }

    #[tokio::test]
    async fn missing_dispatcher_is_node_not_found() {
        let router = Router::new(ConversationScope::default());
        router.bind_channel(ChannelId::new("c1"), NodeId::new("ghost"));
        let err = router.route(&message("c1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NodeNotFound { detail } if detail.contains("dispatcher")));
    }

    #[tokio::test]
    async fn binding_resolver_takes_precedence_over_channel_bindings() {
        let router = Router::new(ConversationScope::default());
        let agent_node = RecordingDispatcher::new();
        let channel_node = RecordingDispatcher::new();
        router.set_dispatcher(NodeId::new("agent-node"), Arc::clone(&agent_node) as Arc<dyn Dispatcher>);
        router.set_dispatcher(
            NodeId::new("channel-node"),
            Arc::clone(&channel_node) as Arc<dyn Dispatcher>,
        );
        router.bind_channel(ChannelId::new("c1"), NodeId::new("channel-node"));

        router.set_resolver(resolver(&[BindingRule {
            match_spec: MatchSpec {
                channel_id: Some("c1".to_string()),
                ..MatchSpec::default()
            },
            agent_id: AgentId::new("a1"),
        }]));
        router.set_agent_node_resolver(Arc::new(|_agent| Some(NodeId::new("agent-node"))));

        let node = router.route(&message("c1")).await.unwrap();
        assert_eq!(node, NodeId::new("agent-node"));
        assert_eq!(agent_node.count(), 1);
        assert_eq!(channel_node.count(), 0);
    }

    #[tokio::test]
    async fn resolver_miss_falls_through_to_channel_binding() {
        let router = Router::new(ConversationScope::default());
        let dispatcher = RecordingDispatcher::new();
        router.set_dispatcher(NodeId::new("n1"), Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        router.bind_channel(ChannelId::new("c1"), NodeId::new("n1"));

        router.set_resolver(resolver(&[BindingRule {
            match_spec: MatchSpec {
                channel_id: Some("other".to_string()),
                ..MatchSpec::default()
            },
            agent_id: AgentId::new("a1"),
        }]));
        router.set_agent_node_resolver(Arc::new(|_agent| None));

        let node = router.route(&message("c1")).await.unwrap();
        assert_eq!(node, NodeId::new("n1"));
    }

    #[tokio::test]
    async fn catch_all_disables_channel_routing() {
        let router = Router::new(ConversationScope::default());
        let channel_node = RecordingDispatcher::new();
        router.set_dispatcher(
            NodeId::new("channel-node"),
            Arc::clone(&channel_node) as Arc<dyn Dispatcher>,
        );
        router.bind_channel(ChannelId::new("c1"), NodeId::new("channel-node"));

        router.set_resolver(resolver(&[BindingRule {
            match_spec: MatchSpec::default(),
            agent_id: AgentId::new("a1"),
        }]));
        // The catch-all resolves an agent with no node: channel routing is
        // never consulted.
        router.set_agent_node_resolver(Arc::new(|_agent| None));

        let err = router.route(&message("c1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NodeNotFound { .. }));
        assert_eq!(channel_node.count(), 0);
    }

    #[tokio::test]
    async fn route_with_scope_binds_the_conversation_on_success() {
        let router = Router::new(ConversationScope::PerChannelPeer);
        let dispatcher = RecordingDispatcher::new();
        router.set_dispatcher(NodeId::new("n1"), Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        router.bind_channel(ChannelId::new("c1"), NodeId::new("n1"));
        let store = Arc::new(ConversationStore::new(ConversationStoreConfig::default()));
        router.set_conversation_store(Arc::clone(&store));

        let msg = LaneMessage::new(
            Lane::Collect,
            RoutingContext::new("c1").with_peer("p1"),
            json!("hi"),
        );
        let (node_id, resolution) = router.route_with_scope(&msg, &AgentId::new("a1")).await.unwrap();
        assert_eq!(node_id, NodeId::new("n1"));
        assert!(!resolution.degraded);
        assert_eq!(store.get(&resolution.key), Some(NodeId::new("n1")));
    }

    #[tokio::test]
    async fn route_failure_creates_no_conversation_binding() {
        let router = Router::new(ConversationScope::PerChannelPeer);
        let store = Arc::new(ConversationStore::new(ConversationStoreConfig::default()));
        router.set_conversation_store(Arc::clone(&store));

        let msg = message("unbound");
        assert!(router.route_with_scope(&msg, &AgentId::new("a1")).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn degraded_resolution_notifies_the_handler() {
        let router = Router::new(ConversationScope::PerChannelPeer);
        let dispatcher = RecordingDispatcher::new();
        router.set_dispatcher(NodeId::new("n1"), Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        router.bind_channel(ChannelId::new("c1"), NodeId::new("n1"));

        let degradations = Arc::new(Mutex::new(Vec::new()));
        let degradations_clone = Arc::clone(&degradations);
        router.set_degradation_handler(Arc::new(move |resolution| {
            degradations_clone.lock().unwrap().push(resolution.warnings.clone());
        }));

        // No peer id: per-channel-peer degrades.
        let (_, resolution) = router
            .route_with_scope(&message("c1"), &AgentId::new("a1"))
            .await
            .unwrap();
        assert!(resolution.degraded);
        assert_eq!(
            *degradations.lock().unwrap(),
            vec![vec!["missing peerId".to_string()]]
        );
    }

    #[tokio::test]
    async fn agent_scope_override_beats_the_default() {
        let router = Router::new(ConversationScope::PerChannelPeer);
        let dispatcher = RecordingDispatcher::new();
        router.set_dispatcher(NodeId::new("n1"), Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        router.bind_channel(ChannelId::new("c1"), NodeId::new("n1"));
        router.set_agent_scope(AgentId::new("a1"), ConversationScope::Global);

        let (_, resolution) = router
            .route_with_scope(&message("c1"), &AgentId::new("a1"))
            .await
            .unwrap();
        assert_eq!(resolution.key.as_str(), "global");
        assert!(!resolution.degraded);
    }

    #[tokio::test]
    async fn remove_node_invalidates_channel_bindings() {
        let router = Router::new(ConversationScope::default());
        let dispatcher = RecordingDispatcher::new();
        router.set_dispatcher(NodeId::new("n1"), Arc::clone(&dispatcher) as Arc<dyn Dispatcher>);
        router.bind_channel(ChannelId::new("c1"), NodeId::new("n1"));
        router.bind_channel(ChannelId::new("c2"), NodeId::new("n1"));
        router.bind_channel(ChannelId::new("c3"), NodeId::new("other"));

        router.remove_node(&NodeId::new("n1"));
        assert!(router.route(&message("c1")).await.is_err());
        assert_eq!(router.unbind_channel(&ChannelId::new("c3")), Some(NodeId::new("other")));
    }

    #[tokio::test]
    async fn conversation_store_evicts_oldest_beyond_capacity() {
        let store = ConversationStore::new(ConversationStoreConfig {
            capacity: 2,
            soft_threshold: None,
        });
        store.bind(ConversationKey::new("k1"), NodeId::new("n1"));
        store.bind(ConversationKey::new("k2"), NodeId::new("n1"));
        store.bind(ConversationKey::new("k3"), NodeId::new("n1"));

        assert_eq!(store.len(), 2);
        assert!(store.get(&ConversationKey::new("k1")).is_none());
        assert!(store.get(&ConversationKey::new("k3")).is_some());
    }

    #[tokio::test]
    async fn conversation_store_soft_threshold_warns() {
        let store = ConversationStore::new(ConversationStoreConfig {
            capacity: 10,
            soft_threshold: Some(2),
        });
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let warnings_clone = Arc::clone(&warnings);
        store.on_threshold(Arc::new(move |len, soft| {
            warnings_clone.lock().unwrap().push((len, soft));
        }));

        store.bind(ConversationKey::new("k1"), NodeId::new("n1"));
        assert!(warnings.lock().unwrap().is_empty());
        store.bind(ConversationKey::new("k2"), NodeId::new("n1"));
        assert_eq!(*warnings.lock().unwrap(), vec![(2, 2)]);
    }

    #[tokio::test]
    async fn rebinding_rehomes_a_conversation() {
        let store = ConversationStore::new(ConversationStoreConfig::default());
        store.bind(ConversationKey::new("k"), NodeId::new("n1"));
        store.bind(ConversationKey::new("k"), NodeId::new("n2"));
        assert_eq!(store.get(&ConversationKey::new("k")), Some(NodeId::new("n2")));
        assert_eq!(store.len(), 1);
    }
}
