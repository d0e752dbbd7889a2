//! Protocol error types.

use thiserror::Error;

/// Errors decoding or encoding wire frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The frame carried a `type` the protocol does not know.
    ///
    /// Unknown frames are rejected and logged; they do not close the
    /// connection.
    #[error("unknown frame type: {frame_type}")]
    UnknownFrameType {
        /// The unrecognized discriminator.
        frame_type: String,
    },

    /// The frame was not valid JSON or did not match its declared type.
    ///
    /// Malformed frames close the connection.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

impl ProtoError {
    /// True when the error should close the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}
