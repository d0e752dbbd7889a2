//! At-least-once delivery tracking.
//!
//! Every delivery-tracked outbound message gets a monotonically increasing
//! id and a pending record that lives until the node acks it or the retry
//! cap is exceeded. Reconnects re-send a node's pending messages in their
//! original order (lane priority preserved); messages that exhaust
//! `max_attempts` go to the dead-letter handler and are cleared.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use meridian_core::NodeId;
use meridian_proto::{Lane, LaneMessage};

/// A message sent but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Delivery-tracking id.
    pub message_id: u64,
    /// Node the message is bound for.
    pub node_id: NodeId,
    /// The message itself (with `message_id` set).
    pub payload: LaneMessage,
    /// First transmit time.
    pub first_sent_at: DateTime<Utc>,
    /// Most recent transmit time.
    pub last_sent_at: DateTime<Utc>,
    /// Transmits so far.
    pub attempts: u32,
}

/// Invoked when a message exhausts its redelivery attempts.
pub type DeadLetterHandler = Arc<dyn Fn(&PendingMessage) + Send + Sync>;

/// Tracker tuning.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryTrackerConfig {
    /// Transmits allowed before dead-lettering.
    pub max_attempts: u32,
}

impl Default for DeliveryTrackerConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Tracks in-flight messages per node.
pub struct DeliveryTracker {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<u64, PendingMessage>>,
    config: DeliveryTrackerConfig,
    dead_letter: Mutex<Option<DeadLetterHandler>>,
}

impl DeliveryTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(config: DeliveryTrackerConfig) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(BTreeMap::new()),
            config,
            dead_letter: Mutex::new(None),
        }
    }

    /// Install the dead-letter handler.
    pub fn on_dead_letter(&self, handler: DeadLetterHandler) {
        if let Ok(mut slot) = self.dead_letter.lock() {
            *slot = Some(handler);
        }
    }

    /// Assign an id and record the first transmit.
    ///
    /// Returns the id and the payload with `message_id` stamped in, ready
    /// to send.
    pub fn track(&self, node_id: &NodeId, mut payload: LaneMessage) -> (u64, LaneMessage) {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        payload.message_id = Some(message_id);
        let now = Utc::now();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                message_id,
                PendingMessage {
                    message_id,
                    node_id: node_id.clone(),
                    payload: payload.clone(),
                    first_sent_at: now,
                    last_sent_at: now,
                    attempts: 1,
                },
            );
        }
        (message_id, payload)
    }

    /// Acknowledge a message. Idempotent: the first ack clears the entry,
    /// later acks for the same id return false and change nothing.
    pub fn ack(&self, message_id: u64) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        let cleared = pending.remove(&message_id).is_some();
        if cleared {
            debug!(message_id, "delivery acknowledged");
        }
        cleared
    }

    /// Pending messages for a node, in send order.
    #[must_use]
    pub fn pending_for(&self, node_id: &NodeId) -> Vec<PendingMessage> {
        self.pending.lock().map_or_else(
            |_| Vec::new(),
            |pending| {
                pending
                    .values()
                    .filter(|p| &p.node_id == node_id)
                    .cloned()
                    .collect()
            },
        )
    }

    /// Collect a node's pending messages for redelivery.
    ///
    /// Attempts increment per message; messages over `max_attempts` are
    /// dead-lettered and cleared instead of returned. The returned
    /// payloads preserve relative priority: lane order first, then
    /// original send order.
    pub fn redeliver(&self, node_id: &NodeId) -> Vec<LaneMessage> {
        let mut to_send = Vec::new();
        let mut dead = Vec::new();

        if let Ok(mut pending) = self.pending.lock() {
            let now = Utc::now();
            let ids: Vec<u64> = pending
                .values()
                .filter(|p| &p.node_id == node_id)
                .map(|p| p.message_id)
                .collect();

            for id in ids {
                let Some(entry) = pending.get_mut(&id) else {
                    continue;
                };
                entry.attempts = entry.attempts.saturating_add(1);
                if entry.attempts > self.config.max_attempts {
                    let entry = pending.remove(&id);
                    if let Some(entry) = entry {
                        dead.push(entry);
                    }
                } else {
                    entry.last_sent_at = now;
                    to_send.push((entry.payload.lane, id, entry.payload.clone()));
                }
            }
        }

        for entry in &dead {
            warn!(
                message_id = entry.message_id,
                node_id = %entry.node_id,
                attempts = entry.attempts,
                "message exhausted redelivery attempts"
            );
            self.notify_dead_letter(entry);
        }

        to_send.sort_by_key(|(lane, id, _)| (lane_rank(*lane), *id));
        to_send.into_iter().map(|(_, _, payload)| payload).collect()
    }

    /// Dead-letter and clear pending messages older than `max_age`.
    ///
    /// Wired into the health monitor's sweep pass.
    pub fn expire_stale(&self, max_age: ChronoDuration, now: DateTime<Utc>) -> usize {
        let mut dead = Vec::new();
        if let Ok(mut pending) = self.pending.lock() {
            let expired: Vec<u64> = pending
                .values()
                .filter(|p| now.signed_duration_since(p.first_sent_at) >= max_age)
                .map(|p| p.message_id)
                .collect();
            for id in expired {
                if let Some(entry) = pending.remove(&id) {
                    dead.push(entry);
                }
            }
        }
        for entry in &dead {
            warn!(message_id = entry.message_id, node_id = %entry.node_id, "pending message expired");
            self.notify_dead_letter(entry);
        }
        dead.len()
    }

    /// Total pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().map_or(0, |pending| pending.len())
    }

    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify_dead_letter(&self, entry: &PendingMessage) {
        let handler = self.dead_letter.lock().ok().and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(entry);
        }
    }
}

fn lane_rank(lane: Lane) -> u8 {
    match lane {
        Lane::Steer => 0,
        Lane::Collect => 1,
        Lane::Followup => 2,
    }
}
