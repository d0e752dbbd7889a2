//! Core types and primitives for the Meridian control plane.
//!
//! This crate holds the vocabulary shared by every other Meridian crate:
//! opaque identifiers, the routing context that binding rules match on,
//! the shared error kinds, and the copy-on-write map primitive that all
//! routing state is built from.

pub mod cow;
pub mod error;
pub mod id;
pub mod routing;

pub mod prelude;

pub use cow::CowMap;
pub use error::{CoreError, CoreResult};
pub use id::{AgentId, ChannelId, ConversationKey, NodeId};
pub use routing::{RoutingContext, RoutingField};
