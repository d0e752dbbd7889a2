//! Gateway error types.

use thiserror::Error;

use meridian_proto::{Lane, ProtoError};

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Routing could not produce a live node.
    #[error("node not found: {detail}")]
    NodeNotFound {
        /// What was missing (binding, dispatcher, or agent mapping).
        detail: String,
    },

    /// The node id is already registered and live.
    #[error("node already registered: {node_id}")]
    AlreadyRegistered {
        /// The conflicting node id.
        node_id: String,
    },

    /// A priority lane is full and the message was rejected.
    #[error("lane {lane} is at capacity")]
    Overflow {
        /// The lane that overflowed.
        lane: Lane,
    },

    /// A binding rule failed to compile.
    #[error("invalid binding: {message}")]
    InvalidBinding {
        /// The compile diagnostic.
        message: String,
    },

    /// The handshake was rejected.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Why the credential was rejected.
        reason: String,
    },

    /// A wire frame could not be encoded or decoded.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The WebSocket transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The underlying socket failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
