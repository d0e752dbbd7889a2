//! Typed runtime event emitter.
//!
//! A broadcast fan-out of control-plane events. Publishing never blocks;
//! slow receivers lag and drop rather than applying backpressure to the
//! publisher.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use meridian_core::{ChannelId, NodeId};

/// Default channel capacity for the emitter.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Events published by control-plane subsystems.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// A node completed the handshake and registered.
    NodeConnected {
        /// The node that connected.
        node_id: NodeId,
    },
    /// A node's session reached `disconnected`.
    NodeDisconnected {
        /// The node that disconnected.
        node_id: NodeId,
    },
    /// An inbound message was dispatched to a node.
    MessageRouted {
        /// Source channel.
        channel_id: ChannelId,
        /// Target node.
        node_id: NodeId,
    },
    /// A pending message exhausted its redelivery attempts.
    DeliveryDeadLettered {
        /// The delivery-tracking id.
        message_id: u64,
        /// The node the message was bound for.
        node_id: NodeId,
    },
    /// A model call completed and reported token usage.
    ModelUsage {
        /// Provider that served the call.
        provider: String,
        /// Model that served the call.
        model: String,
        /// Input tokens consumed.
        input_tokens: u64,
        /// Output tokens produced.
        output_tokens: u64,
    },
    /// The configuration manifest changed.
    ConfigUpdated {
        /// True when the change cannot apply without a restart.
        restart_required: bool,
    },
}

impl RuntimeEvent {
    /// Stable name for logging and filtering.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NodeConnected { .. } => "node_connected",
            Self::NodeDisconnected { .. } => "node_disconnected",
            Self::MessageRouted { .. } => "message_routed",
            Self::DeliveryDeadLettered { .. } => "delivery_dead_lettered",
            Self::ModelUsage { .. } => "model_usage",
            Self::ConfigUpdated { .. } => "config_updated",
        }
    }
}

/// Broadcast emitter for [`RuntimeEvent`]s.
#[derive(Debug)]
pub struct EventEmitter {
    sender: broadcast::Sender<Arc<RuntimeEvent>>,
    capacity: usize,
}

impl EventEmitter {
    /// Create an emitter with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an emitter with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers that will observe it.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        let event = Arc::new(event);
        trace!(event_type = event.event_type(), "publishing runtime event");
        self.sender.send(event).map_or(0, |count| count)
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

/// Receiver half of the emitter.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<RuntimeEvent>>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Skips over lagged gaps; returns `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<Arc<RuntimeEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without blocking; `None` when empty or closed.
    pub fn try_recv(&mut self) -> Option<Arc<RuntimeEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let emitter = EventEmitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        let count = emitter.publish(RuntimeEvent::NodeConnected {
            node_id: NodeId::new("n1"),
        });
        assert_eq!(count, 2);

        assert_eq!(rx1.recv().await.unwrap().event_type(), "node_connected");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "node_connected");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let emitter = EventEmitter::new();
        let count = emitter.publish(RuntimeEvent::ConfigUpdated {
            restart_required: false,
        });
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn try_recv_on_empty_returns_none() {
        let emitter = EventEmitter::with_capacity(8);
        let mut rx = emitter.subscribe();
        assert!(rx.try_recv().is_none());

        emitter.publish(RuntimeEvent::MessageRouted {
            channel_id: ChannelId::new("c1"),
            node_id: NodeId::new("n1"),
        });
        assert!(rx.try_recv().is_some());
    }
}
