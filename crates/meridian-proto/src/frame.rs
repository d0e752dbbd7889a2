//! Gateway wire frames.
//!
//! Frames are JSON text messages with a `type` discriminator and a
//! `payload`. Decoding distinguishes unknown frame types (rejected, logged,
//! connection stays up) from malformed frames (connection closes).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use meridian_core::{ChannelId, NodeId, RoutingContext};

use crate::error::{ProtoError, ProtoResult};
use crate::lane::Lane;
use crate::session::SessionEvent;

/// Frame types the gateway understands, in wire form.
const KNOWN_FRAME_TYPES: [&str; 8] = [
    "auth",
    "auth_result",
    "register",
    "message",
    "ack",
    "ping",
    "pong",
    "session",
];

/// A single wire frame, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    /// Client → server credential presentation. First frame on a connection.
    Auth(AuthPayload),
    /// Server → client handshake verdict.
    AuthResult(AuthResultPayload),
    /// Node declares its id and capabilities.
    Register(RegisterPayload),
    /// A lane message, either direction.
    Message(LaneMessage),
    /// Node acknowledges a delivery-tracked message.
    Ack(AckPayload),
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Out-of-band session state-machine event.
    Session(SessionPayload),
}

/// Payload of an `auth` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// Opaque credential.
    pub token: String,
    /// The node id the credential claims.
    pub node_id: NodeId,
}

/// Payload of an `auth_result` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResultPayload {
    /// Whether the handshake was accepted.
    pub ok: bool,
    /// Rejection reason, present only when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of a `register` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// The node's id.
    pub node_id: NodeId,
    /// Capabilities the node declares (opaque strings).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A message traveling through a priority lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneMessage {
    /// Priority lane.
    pub lane: Lane,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Routing-relevant fields from the source adapter.
    pub routing_context: RoutingContext,
    /// Opaque message body.
    pub body: Value,
    /// Delivery-tracking id, assigned by the gateway on first transmit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
}

impl LaneMessage {
    /// Create a message on the given lane.
    #[must_use]
    pub fn new(lane: Lane, routing_context: RoutingContext, body: Value) -> Self {
        Self {
            lane,
            channel_id: routing_context.channel_id.clone(),
            routing_context,
            body,
            message_id: None,
        }
    }
}

/// Payload of an `ack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// The delivery-tracking id being acknowledged.
    pub message_id: u64,
}

/// Payload of a `session` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// The session event to feed into the state machine.
    pub event: SessionEvent,
}

impl Frame {
    /// Encode the frame as a JSON text message.
    pub fn encode(&self) -> ProtoResult<String> {
        serde_json::to_string(self).map_err(|e| ProtoError::Malformed(e.to_string()))
    }

    /// Decode a JSON text message into a frame.
    ///
    /// # Errors
    ///
    /// [`ProtoError::UnknownFrameType`] when the `type` discriminator is not
    /// one of the known frame types; [`ProtoError::Malformed`] when the text
    /// is not valid JSON, the discriminator is missing, or the payload does
    /// not match the declared type.
    pub fn decode(text: &str) -> ProtoResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtoError::Malformed(e.to_string()))?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtoError::Malformed("missing type discriminator".to_string()))?;
        if !KNOWN_FRAME_TYPES.contains(&frame_type) {
            return Err(ProtoError::UnknownFrameType {
                frame_type: frame_type.to_string(),
            });
        }
        serde_json::from_value(value).map_err(|e| ProtoError::Malformed(e.to_string()))
    }
}
