//! Bounded three-lane priority buffer.
//!
//! Each lane is an independent FIFO with its own capacity; filling one
//! lane never blocks another. Draining yields `steer` before `collect`
//! before `followup`, FIFO within each lane.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use meridian_proto::{Lane, LaneMessage};

use crate::error::{GatewayError, GatewayResult};

/// Per-lane capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneCapacities {
    /// Steer lane capacity.
    pub steer: usize,
    /// Collect lane capacity.
    pub collect: usize,
    /// Followup lane capacity.
    pub followup: usize,
}

impl Default for LaneCapacities {
    fn default() -> Self {
        Self {
            steer: 8,
            collect: 64,
            followup: 64,
        }
    }
}

impl LaneCapacities {
    fn capacity(self, lane: Lane) -> usize {
        match lane {
            Lane::Steer => self.steer,
            Lane::Collect => self.collect,
            Lane::Followup => self.followup,
        }
    }
}

/// What to do with an enqueue that would overflow its lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowDecision {
    /// Drop the incoming message.
    DropNew,
    /// Evict the oldest queued message and enqueue the new one.
    DropOldest,
    /// Reject the enqueue with an overflow error.
    Reject,
}

/// Hook invoked with the message about to be dropped on overflow.
pub type OverflowHook = Arc<dyn Fn(Lane, &LaneMessage) -> OverflowDecision + Send + Sync>;

/// Hook invoked when a `steer` message is enqueued, allowing the consumer
/// to cancel in-flight work. Returns whether preemption was honored.
pub type PreemptHook = Arc<dyn Fn(&LaneMessage) -> bool + Send + Sync>;

/// Result of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The message was queued.
    Enqueued {
        /// True when a steer enqueue preempted in-flight work.
        preempted: bool,
    },
    /// The lane was full and the incoming message was dropped.
    DroppedNew,
    /// The lane was full; the oldest message was evicted to make room.
    DroppedOldest,
}

struct QueuedMessage {
    message: LaneMessage,
    #[allow(dead_code)]
    enqueued_at: Instant,
}

/// Bounded multi-lane FIFO.
pub struct PriorityBuffer {
    lanes: [VecDeque<QueuedMessage>; 3],
    capacities: LaneCapacities,
    overflow_hook: Option<OverflowHook>,
    preempt_hook: Option<PreemptHook>,
}

impl PriorityBuffer {
    /// Create a buffer with the given capacities.
    #[must_use]
    pub fn new(capacities: LaneCapacities) -> Self {
        Self {
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            capacities,
            overflow_hook: None,
            preempt_hook: None,
        }
    }

    /// Install the overflow hook.
    pub fn set_overflow_hook(&mut self, hook: OverflowHook) {
        self.overflow_hook = Some(hook);
    }

    /// Install the preemption hook.
    pub fn set_preempt_hook(&mut self, hook: PreemptHook) {
        self.preempt_hook = Some(hook);
    }

    fn lane_index(lane: Lane) -> usize {
        match lane {
            Lane::Steer => 0,
            Lane::Collect => 1,
            Lane::Followup => 2,
        }
    }

    /// Enqueue a message onto a specific lane.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Overflow`] when the lane is at capacity and no
    /// overflow hook accepts the message (or the hook says `Reject`).
    pub fn enqueue(&mut self, lane: Lane, message: LaneMessage) -> GatewayResult<EnqueueOutcome> {
        let capacity = self.capacities.capacity(lane);
        let queue = &mut self.lanes[Self::lane_index(lane)];

        if queue.len() >= capacity {
            let decision = self
                .overflow_hook
                .as_ref()
                .map_or(OverflowDecision::Reject, |hook| hook(lane, &message));
            match decision {
                OverflowDecision::DropNew => {
                    debug!(lane = %lane, "lane full, dropping incoming message");
                    return Ok(EnqueueOutcome::DroppedNew);
                },
                OverflowDecision::DropOldest => {
                    debug!(lane = %lane, "lane full, evicting oldest message");
                    queue.pop_front();
                    queue.push_back(QueuedMessage {
                        message,
                        enqueued_at: Instant::now(),
                    });
                    return Ok(EnqueueOutcome::DroppedOldest);
                },
                OverflowDecision::Reject => {
                    return Err(GatewayError::Overflow { lane });
                },
            }
        }

        queue.push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
        });

        let preempted = if lane == Lane::Steer
            && let Some(hook) = &self.preempt_hook
        {
            // The queue owns the message now; hand the hook the queued copy.
            self.lanes[0]
                .back()
                .is_some_and(|queued| hook(&queued.message))
        } else {
            false
        };

        Ok(EnqueueOutcome::Enqueued { preempted })
    }

    /// Enqueue a message onto its declared lane.
    ///
    /// # Errors
    ///
    /// Same as [`PriorityBuffer::enqueue`].
    pub fn dispatch(&mut self, message: LaneMessage) -> GatewayResult<EnqueueOutcome> {
        self.enqueue(message.lane, message)
    }

    /// Remove and return everything, in priority order.
    pub fn drain(&mut self) -> Vec<LaneMessage> {
        let mut out = Vec::with_capacity(self.total_len());
        for lane in &mut self.lanes {
            out.extend(lane.drain(..).map(|q| q.message));
        }
        out
    }

    /// Inspect the head of a lane without removing it.
    #[must_use]
    pub fn peek(&self, lane: Lane) -> Option<&LaneMessage> {
        self.lanes[Self::lane_index(lane)].front().map(|q| &q.message)
    }

    /// Number of messages queued on a lane.
    #[must_use]
    pub fn lane_len(&self, lane: Lane) -> usize {
        self.lanes[Self::lane_index(lane)].len()
    }

    /// Number of messages across all lanes.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// True when no lane has queued messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::RoutingContext;
    use serde_json::json;
    use std::sync::Mutex;

    fn message(lane: Lane, body: &str) -> LaneMessage {
        LaneMessage::new(lane, RoutingContext::new("c1"), json!(body))
    }

    fn buffer() -> PriorityBuffer {
        PriorityBuffer::new(LaneCapacities {
            steer: 2,
            collect: 3,
            followup: 3,
        })
    }

    #[tokio::test]
    async fn drain_yields_lanes_in_priority_order() {
        let mut buf = buffer();
        buf.enqueue(Lane::Followup, message(Lane::Followup, "f1")).unwrap();
        buf.enqueue(Lane::Collect, message(Lane::Collect, "c1")).unwrap();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s1")).unwrap();
        buf.enqueue(Lane::Collect, message(Lane::Collect, "c2")).unwrap();

        let bodies: Vec<_> = buf.drain().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![json!("s1"), json!("c1"), json!("c2"), json!("f1")]);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn fifo_within_a_lane() {
        let mut buf = buffer();
        for body in ["a", "b", "c"] {
            buf.enqueue(Lane::Collect, message(Lane::Collect, body)).unwrap();
        }
        let bodies: Vec<_> = buf.drain().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn overflow_without_hook_rejects() {
        let mut buf = buffer();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s1")).unwrap();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s2")).unwrap();
        let err = buf.enqueue(Lane::Steer, message(Lane::Steer, "s3")).unwrap_err();
        assert!(matches!(err, GatewayError::Overflow { lane: Lane::Steer }));
        assert_eq!(buf.lane_len(Lane::Steer), 2);
    }

    #[tokio::test]
    async fn full_lane_does_not_block_other_lanes() {
        let mut buf = buffer();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s1")).unwrap();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s2")).unwrap();
        assert!(buf.enqueue(Lane::Steer, message(Lane::Steer, "s3")).is_err());
        // Collect still accepts.
        buf.enqueue(Lane::Collect, message(Lane::Collect, "c1")).unwrap();
        assert_eq!(buf.lane_len(Lane::Collect), 1);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_the_latest_messages() {
        let mut buf = buffer();
        buf.set_overflow_hook(Arc::new(|_, _| OverflowDecision::DropOldest));

        // 2x capacity of the collect lane (3).
        for i in 0..6 {
            buf.enqueue(Lane::Collect, message(Lane::Collect, &format!("m{i}"))).unwrap();
        }
        assert_eq!(buf.lane_len(Lane::Collect), 3);
        let bodies: Vec<_> = buf.drain().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![json!("m3"), json!("m4"), json!("m5")]);
    }

    #[tokio::test]
    async fn drop_new_discards_the_incoming_message() {
        let mut buf = buffer();
        buf.set_overflow_hook(Arc::new(|_, _| OverflowDecision::DropNew));
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s1")).unwrap();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s2")).unwrap();

        let outcome = buf.enqueue(Lane::Steer, message(Lane::Steer, "s3")).unwrap();
        assert_eq!(outcome, EnqueueOutcome::DroppedNew);
        let bodies: Vec<_> = buf.drain().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![json!("s1"), json!("s2")]);
    }

    #[tokio::test]
    async fn overflow_hook_sees_the_offered_message() {
        let mut buf = buffer();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        buf.set_overflow_hook(Arc::new(move |lane, msg| {
            seen_clone.lock().unwrap().push((lane, msg.body.clone()));
            OverflowDecision::DropNew
        }));

        buf.enqueue(Lane::Steer, message(Lane::Steer, "s1")).unwrap();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s2")).unwrap();
        buf.enqueue(Lane::Steer, message(Lane::Steer, "s3")).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(Lane::Steer, json!("s3"))]);
    }

    #[tokio::test]
    async fn steer_enqueue_invokes_the_preemption_hook_once() {
        let mut buf = buffer();
        // The consumer knows its in-flight message; the hook closure
        // captures it and reports what was preempted.
        let in_flight_id: u64 = 41;
        let preemptions = Arc::new(Mutex::new(Vec::new()));
        let preemptions_clone = Arc::clone(&preemptions);
        buf.set_preempt_hook(Arc::new(move |_msg| {
            preemptions_clone.lock().unwrap().push(in_flight_id);
            true
        }));

        let outcome = buf.enqueue(Lane::Steer, message(Lane::Steer, "urgent")).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued { preempted: true });
        assert_eq!(*preemptions.lock().unwrap(), vec![41]);

        // Non-steer lanes never preempt.
        let outcome = buf.enqueue(Lane::Collect, message(Lane::Collect, "normal")).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued { preempted: false });
        assert_eq!(preemptions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dishonored_preemption_is_reported() {
        let mut buf = buffer();
        buf.set_preempt_hook(Arc::new(|_msg| false));
        let outcome = buf.enqueue(Lane::Steer, message(Lane::Steer, "urgent")).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued { preempted: false });
    }

    #[tokio::test]
    async fn peek_is_non_destructive() {
        let mut buf = buffer();
        buf.enqueue(Lane::Collect, message(Lane::Collect, "c1")).unwrap();
        assert_eq!(buf.peek(Lane::Collect).unwrap().body, json!("c1"));
        assert_eq!(buf.lane_len(Lane::Collect), 1);
        assert!(buf.peek(Lane::Steer).is_none());
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_declared_lane() {
        let mut buf = buffer();
        buf.dispatch(message(Lane::Followup, "f1")).unwrap();
        assert_eq!(buf.lane_len(Lane::Followup), 1);
        assert_eq!(buf.lane_len(Lane::Collect), 0);
    }
}
