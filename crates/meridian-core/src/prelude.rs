//! Convenience re-exports for downstream crates.

pub use crate::cow::CowMap;
pub use crate::error::{CoreError, CoreResult};
pub use crate::id::{AgentId, ChannelId, ConversationKey, NodeId};
pub use crate::routing::{RoutingContext, RoutingField};
