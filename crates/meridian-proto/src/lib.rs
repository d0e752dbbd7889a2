//! Wire protocol for the Meridian gateway.
//!
//! Nodes and the gateway exchange UTF-8 JSON frames over WebSocket. Every
//! frame is a tagged union with a `type` discriminator and (for most types)
//! a `payload`. This crate also holds the small enums shared across the
//! control plane: priority lanes, session states and events, and
//! conversation scopes.

pub mod error;
pub mod frame;
pub mod lane;
pub mod scope;
pub mod session;

pub use error::{ProtoError, ProtoResult};
pub use frame::{Frame, LaneMessage};
pub use lane::Lane;
pub use scope::ConversationScope;
pub use session::{SessionEvent, SessionState};
