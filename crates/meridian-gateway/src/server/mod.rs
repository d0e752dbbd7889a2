//! The gateway WebSocket server.
//!
//! Accepts node connections behind an injected socket acceptor (so TLS
//! termination variations stay out of this crate), runs the auth-first
//! frame protocol per connection, and owns the registry, router, session
//! machine, and delivery tracker that connections share.

pub mod auth;
mod connection;


use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meridian_core::{CowMap, NodeId};
use meridian_hooks::{EventEmitter, RuntimeEvent};
use meridian_proto::{ConversationScope, Frame, LaneMessage, SessionState};

use crate::buffer::LaneCapacities;
use crate::delivery::{DeliveryTracker, DeliveryTrackerConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::NodeRegistry;
use crate::router::Router;
use crate::session::{SessionMachine, SessionTimeouts};
use auth::{DeviceTokenVerifier, TokenValidator};
use health_ping::ServerPinger;

/// A bidirectional byte stream the gateway can speak WebSocket over.
pub trait SocketStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SocketStream for T {}

/// Produces accepted sockets for the server.
///
/// Injecting the acceptor keeps TLS termination (or in-memory transports
/// in tests) outside the gateway; several acceptors may feed one server
/// concurrently.
#[async_trait]
pub trait SocketAcceptor: Send + Sync {
    /// Wait for the next inbound socket.
    async fn accept(&self) -> GatewayResult<Box<dyn SocketStream>>;
}

/// Plain-TCP acceptor.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Wrap an existing listener.
    #[must_use]
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    /// Bind a new listener.
    ///
    /// # Errors
    ///
    /// Propagates the bind error.
    pub async fn bind(addr: impl ToSocketAddrs) -> GatewayResult<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> GatewayResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl SocketAcceptor for TcpAcceptor {
    async fn accept(&self) -> GatewayResult<Box<dyn SocketStream>> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "tcp connection accepted");
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream) as Box<dyn SocketStream>)
    }
}

/// Sink for messages nodes send back toward channel adapters.
pub type OutboundSink = Arc<dyn Fn(LaneMessage) + Send + Sync>;

/// Consumer hook invoked when a `steer` message preempts a node's
/// in-flight work. Returns whether preemption was honored.
pub type PreemptHandler = Arc<dyn Fn(&NodeId, &LaneMessage) -> bool + Send + Sync>;

/// Server tuning.
#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    /// Budget for the auth frame after the socket opens.
    pub auth_timeout: Duration,
    /// Default conversation scope.
    pub default_scope: ConversationScope,
    /// Session timer durations.
    pub session_timeouts: SessionTimeouts,
    /// Per-node lane capacities.
    pub lanes: LaneCapacities,
    /// Delivery tracker tuning.
    pub delivery: DeliveryTrackerConfig,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            default_scope: ConversationScope::default(),
            session_timeouts: SessionTimeouts::default(),
            lanes: LaneCapacities::default(),
            delivery: DeliveryTrackerConfig::default(),
        }
    }
}

pub(crate) struct ServerInner {
    pub(crate) config: GatewayServerConfig,
    pub(crate) registry: NodeRegistry,
    pub(crate) router: Arc<Router>,
    pub(crate) sessions: SessionMachine,
    pub(crate) delivery: Arc<DeliveryTracker>,
    pub(crate) emitter: EventEmitter,
    pub(crate) validator: Arc<dyn TokenValidator>,
    pub(crate) device_verifier: Mutex<Option<DeviceTokenVerifier>>,
    pub(crate) outbound: Mutex<Option<OutboundSink>>,
    pub(crate) preempt: Mutex<Option<PreemptHandler>>,
    /// Per-node outbound frame senders, for pings and redelivery.
    pub(crate) senders: CowMap<NodeId, mpsc::UnboundedSender<Frame>>,
}

/// The gateway server.
#[derive(Clone)]
pub struct GatewayServer {
    inner: Arc<ServerInner>,
}

impl GatewayServer {
    /// Build a server with its own router, session machine, and delivery
    /// tracker.
    #[must_use]
    pub fn new(config: GatewayServerConfig, validator: Arc<dyn TokenValidator>) -> Self {
        let sessions = SessionMachine::new(config.session_timeouts);
        let inner = Arc::new(ServerInner {
            router: Arc::new(Router::new(config.default_scope)),
            sessions: sessions.clone(),
            delivery: Arc::new(DeliveryTracker::new(config.delivery)),
            registry: NodeRegistry::new(),
            emitter: EventEmitter::new(),
            validator,
            device_verifier: Mutex::new(None),
            outbound: Mutex::new(None),
            preempt: Mutex::new(None),
            senders: CowMap::new(),
            config,
        });

        // Final session cleanup: when a session reaches `disconnected`, the
        // node's registration, dispatcher, and channel bindings go with it.
        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        sessions.on_transition(Arc::new(move |node_id, result| {
            if result.valid
                && result.next == SessionState::Disconnected
                && let Some(inner) = weak.upgrade()
            {
                info!(node_id = %node_id, "session disconnected, cleaning up node");
                inner.registry.deregister(node_id);
                inner.router.remove_node(node_id);
                inner.senders.remove(node_id);
                inner.emitter.publish(RuntimeEvent::NodeDisconnected {
                    node_id: node_id.clone(),
                });
            }
        }));

        Self { inner }
    }

    /// Enable device-token verification as an alternative credential path.
    pub fn set_device_verifier(&self, verifier: DeviceTokenVerifier) {
        if let Ok(mut slot) = self.inner.device_verifier.lock() {
            *slot = Some(verifier);
        }
    }

    /// Install the sink receiving node-originated messages.
    pub fn set_outbound_sink(&self, sink: OutboundSink) {
        if let Ok(mut slot) = self.inner.outbound.lock() {
            *slot = Some(sink);
        }
    }

    /// Install the steer preemption handler.
    pub fn set_preempt_handler(&self, handler: PreemptHandler) {
        if let Ok(mut slot) = self.inner.preempt.lock() {
            *slot = Some(handler);
        }
    }

    /// The routing table shared by all connections.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// The session machine.
    #[must_use]
    pub fn sessions(&self) -> &SessionMachine {
        &self.inner.sessions
    }

    /// The delivery tracker.
    #[must_use]
    pub fn delivery(&self) -> &Arc<DeliveryTracker> {
        &self.inner.delivery
    }

    /// The node registry.
    #[must_use]
    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    /// The runtime event emitter.
    #[must_use]
    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    /// A ping sender suitable for the health monitor.
    #[must_use]
    pub fn ping_sender(&self) -> Arc<dyn crate::health::PingSender> {
        Arc::new(ServerPinger {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Ingest an inbound channel message: resolve bindings, route, and
    /// dispatch toward the target node.
    ///
    /// # Errors
    ///
    /// Routing errors, most commonly [`GatewayError::NodeNotFound`].
    pub async fn ingest(&self, message: LaneMessage) -> GatewayResult<NodeId> {
        let node_id = if let Some(agent_id) = self.inner.router.resolve_agent(&message) {
            let (node_id, _resolution) =
                self.inner.router.route_with_scope(&message, &agent_id).await?;
            node_id
        } else {
            self.inner.router.route(&message).await?
        };
        self.inner.emitter.publish(RuntimeEvent::MessageRouted {
            channel_id: message.channel_id.clone(),
            node_id: node_id.clone(),
        });
        Ok(node_id)
    }

    /// Accept and serve connections until cancelled.
    ///
    /// May be called concurrently with different acceptors.
    ///
    /// # Errors
    ///
    /// Accept errors other than cancellation.
    pub async fn serve(
        &self,
        acceptor: Arc<dyn SocketAcceptor>,
        cancel: CancellationToken,
    ) -> GatewayResult<()> {
        info!("gateway server accepting connections");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("gateway server stopping");
                    return Ok(());
                },
                accepted = acceptor.accept() => {
                    match accepted {
                        Ok(stream) => {
                            let inner = Arc::clone(&self.inner);
                            tokio::spawn(connection::serve_connection(inner, stream));
                        },
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            return Err(e);
                        },
                    }
                },
            }
        }
    }
}

mod health_ping {
    use super::{Frame, GatewayError, GatewayResult, NodeId, ServerInner};
    use async_trait::async_trait;
    use std::sync::Arc;

    pub(crate) struct ServerPinger {
        pub(crate) inner: Arc<ServerInner>,
    }

    #[async_trait]
    impl crate::health::PingSender for ServerPinger {
        async fn ping(&self, node_id: &NodeId) -> GatewayResult<()> {
            let Some(sender) = self.inner.senders.get(node_id) else {
                return Err(GatewayError::NodeNotFound {
                    detail: format!("no live connection for node {node_id}"),
                });
            };
            sender
                .send(Frame::Ping)
                .map_err(|_| GatewayError::Transport("connection writer closed".to_string()))
        }
    }
}
