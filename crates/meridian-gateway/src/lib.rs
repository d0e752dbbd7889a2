//! WebSocket gateway for Meridian worker nodes.
//!
//! The gateway terminates node connections, authenticates them, maintains
//! per-node session state machines, binds inbound channel messages to
//! nodes, enforces priority-lane delivery with backpressure, and tracks
//! at-least-once delivery with redelivery on reconnect.

pub mod bindings;
pub mod buffer;
pub mod delivery;
pub mod error;
pub mod health;
pub mod registry;
pub mod router;
pub mod scoper;
pub mod server;
pub mod session;

pub use bindings::{BindingResolver, BindingRule, MatchSpec};
pub use buffer::{
    EnqueueOutcome, LaneCapacities, OverflowDecision, OverflowHook, PreemptHook, PriorityBuffer,
};
pub use delivery::{DeadLetterHandler, DeliveryTracker, DeliveryTrackerConfig, PendingMessage};
pub use error::{GatewayError, GatewayResult};
pub use health::{
    ActivitySource, HealthMonitor, HealthMonitorConfig, NodeDeadHandler, PingSender, SweepHandler,
};
pub use registry::{NodeRegistry, RegisteredNode};
pub use router::{
    AgentNodeResolver, ConversationStore, ConversationStoreConfig, DegradationHandler, Dispatcher,
    Router,
};
pub use scoper::{KeyResolution, resolve_conversation_key};
pub use server::{GatewayServer, GatewayServerConfig, SocketAcceptor, SocketStream, TcpAcceptor};
pub use server::auth::{DeviceTokenVerifier, StaticTokenValidator, TokenValidator};
pub use session::{
    SessionMachine, SessionRecord, SessionTimeouts, TransitionCallback, TransitionResult,
    transition,
};
