//! Per-node session lifecycle.
//!
//! The transition table is a pure function; the machine wraps it with
//! per-node timers. Entering `connected` arms the idle timer, entering
//! `idle` arms the suspend timer, `suspended` waits indefinitely for a
//! reconnect, and `disconnected` removes the session — no session ever
//! persists in that state. Transition callbacks run after the new state is
//! committed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use meridian_core::NodeId;
use meridian_proto::{SessionEvent, SessionState};

/// The transition table.
///
/// Total over `(state, event)`: every pair maps to a next state or `None`
/// (the event is rejected and the state unchanged).
#[must_use]
pub fn transition(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Connected, E::Activity) => Some(S::Connected),
        (S::Connected, E::IdleTimeout) => Some(S::Idle),
        (S::Connected, E::Disconnect) => Some(S::Suspended),

        (S::Idle, E::Activity | E::Reconnect) => Some(S::Connected),
        (S::Idle, E::SuspendTimeout | E::Disconnect) => Some(S::Suspended),

        (S::Suspended, E::Reconnect) => Some(S::Connected),
        (S::Suspended, E::Disconnect) => Some(S::Disconnected),

        _ => None,
    }
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Current lifecycle state.
    pub state: SessionState,
    /// When the session was first opened.
    pub connected_at: DateTime<Utc>,
    /// Last observed activity.
    pub last_activity_at: DateTime<Utc>,
    /// Completed reconnects.
    pub reconnect_count: u32,
}

/// Outcome of feeding an event into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionResult {
    /// Whether the transition was accepted.
    pub valid: bool,
    /// State before the event.
    pub previous: SessionState,
    /// State after the event (equals `previous` when invalid).
    pub next: SessionState,
    /// The event that was applied.
    pub event: SessionEvent,
}

/// Timer durations.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Connected → idle after this much inactivity.
    pub idle: Duration,
    /// Idle → suspended after this much more inactivity.
    pub suspend: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(300),
            suspend: Duration::from_secs(600),
        }
    }
}

/// Callback invoked after a transition commits.
pub type TransitionCallback = Arc<dyn Fn(&NodeId, &TransitionResult) + Send + Sync>;

struct SessionEntry {
    record: SessionRecord,
    timer: Option<JoinHandle<()>>,
}

struct MachineInner {
    timeouts: SessionTimeouts,
    sessions: Mutex<HashMap<NodeId, SessionEntry>>,
    callbacks: Mutex<Vec<TransitionCallback>>,
}

/// Timer-driven session state machine over all nodes.
#[derive(Clone)]
pub struct SessionMachine {
    inner: Arc<MachineInner>,
}

impl SessionMachine {
    /// Create a machine with the given timer durations.
    #[must_use]
    pub fn new(timeouts: SessionTimeouts) -> Self {
        Self {
            inner: Arc::new(MachineInner {
                timeouts,
                sessions: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback run after every committed transition.
    pub fn on_transition(&self, callback: TransitionCallback) {
        if let Ok(mut callbacks) = self.inner.callbacks.lock() {
            callbacks.push(callback);
        }
    }

    /// Open a session in `connected` and arm its idle timer.
    ///
    /// Returns false when a session already exists for the node.
    pub fn open_session(&self, node_id: &NodeId) -> bool {
        let Ok(mut sessions) = self.inner.sessions.lock() else {
            return false;
        };
        if sessions.contains_key(node_id) {
            return false;
        }
        let now = Utc::now();
        let timer = arm_timer(
            &self.inner,
            node_id.clone(),
            self.inner.timeouts.idle,
            SessionEvent::IdleTimeout,
        );
        sessions.insert(
            node_id.clone(),
            SessionEntry {
                record: SessionRecord {
                    state: SessionState::Connected,
                    connected_at: now,
                    last_activity_at: now,
                    reconnect_count: 0,
                },
                timer: Some(timer),
            },
        );
        debug!(node_id = %node_id, "session opened");
        true
    }

    /// Feed an event into a node's session.
    ///
    /// Invalid transitions are reported in the result, never thrown; the
    /// state is unchanged. Transition callbacks fire after the new state
    /// (and any timer changes) are committed.
    pub fn handle_event(&self, node_id: &NodeId, event: SessionEvent) -> TransitionResult {
        let result = {
            let Ok(mut sessions) = self.inner.sessions.lock() else {
                return TransitionResult {
                    valid: false,
                    previous: SessionState::Disconnected,
                    next: SessionState::Disconnected,
                    event,
                };
            };
            let Some(entry) = sessions.get_mut(node_id) else {
                trace!(node_id = %node_id, event = %event, "event for unknown session");
                return TransitionResult {
                    valid: false,
                    previous: SessionState::Disconnected,
                    next: SessionState::Disconnected,
                    event,
                };
            };

            let previous = entry.record.state;
            let Some(next) = transition(previous, event) else {
                debug!(node_id = %node_id, state = %previous, event = %event, "transition rejected");
                return TransitionResult {
                    valid: false,
                    previous,
                    next: previous,
                    event,
                };
            };

            entry.record.state = next;
            let now = Utc::now();
            match event {
                SessionEvent::Activity => entry.record.last_activity_at = now,
                SessionEvent::Reconnect => {
                    entry.record.last_activity_at = now;
                    entry.record.reconnect_count = entry.record.reconnect_count.saturating_add(1);
                },
                _ => {},
            }

            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            match next {
                SessionState::Connected => {
                    entry.timer = Some(arm_timer(
                        &self.inner,
                        node_id.clone(),
                        self.inner.timeouts.idle,
                        SessionEvent::IdleTimeout,
                    ));
                },
                SessionState::Idle => {
                    entry.timer = Some(arm_timer(
                        &self.inner,
                        node_id.clone(),
                        self.inner.timeouts.suspend,
                        SessionEvent::SuspendTimeout,
                    ));
                },
                SessionState::Suspended => {},
                SessionState::Disconnected => {
                    sessions.remove(node_id);
                },
            }

            debug!(node_id = %node_id, from = %previous, to = %next, event = %event, "session transition");
            TransitionResult {
                valid: true,
                previous,
                next,
                event,
            }
        };

        // Callbacks run after the state is committed and the lock released,
        // so a callback may call back into the machine.
        let callbacks = self
            .inner
            .callbacks
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        for callback in callbacks {
            callback(node_id, &result);
        }
        result
    }

    /// Snapshot of one node's session.
    #[must_use]
    pub fn record(&self, node_id: &NodeId) -> Option<SessionRecord> {
        self.inner
            .sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(node_id).map(|entry| entry.record.clone()))
    }

    /// Last activity timestamps across all live sessions.
    #[must_use]
    pub fn last_activity(&self) -> Vec<(NodeId, DateTime<Utc>)> {
        self.inner.sessions.lock().map_or_else(
            |_| Vec::new(),
            |sessions| {
                sessions
                    .iter()
                    .map(|(node_id, entry)| (node_id.clone(), entry.record.last_activity_at))
                    .collect()
            },
        )
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().map_or(0, |sessions| sessions.len())
    }

    /// True when no sessions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort all timers and drop all sessions.
    pub fn clear(&self) {
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            for (_, entry) in sessions.iter_mut() {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
            sessions.clear();
        }
    }
}

/// Arm a timer that feeds `event` back into the machine when it fires.
///
/// The task holds only a weak reference; a dropped machine silently
/// disarms its timers.
fn arm_timer(
    inner: &Arc<MachineInner>,
    node_id: NodeId,
    delay: Duration,
    event: SessionEvent,
) -> JoinHandle<()> {
    let weak: Weak<MachineInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = weak.upgrade() {
            let machine = SessionMachine { inner };
            let _ = machine.handle_event(&node_id, event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeouts() -> SessionTimeouts {
        SessionTimeouts {
            idle: Duration::from_secs(10),
            suspend: Duration::from_secs(20),
        }
    }

    fn node() -> NodeId {
        NodeId::new("n1")
    }

    #[test]
    fn table_is_total_and_rejects_the_rest() {
        use SessionEvent as E;
        use SessionState as S;

        // Spot checks on accepted pairs.
        assert_eq!(transition(S::Connected, E::Activity), Some(S::Connected));
        assert_eq!(transition(S::Connected, E::IdleTimeout), Some(S::Idle));
        assert_eq!(transition(S::Idle, E::Activity), Some(S::Connected));
        assert_eq!(transition(S::Idle, E::SuspendTimeout), Some(S::Suspended));
        assert_eq!(transition(S::Suspended, E::Reconnect), Some(S::Connected));
        assert_eq!(transition(S::Suspended, E::Disconnect), Some(S::Disconnected));

        // Rejected pairs.
        assert_eq!(transition(S::Connected, E::SuspendTimeout), None);
        assert_eq!(transition(S::Connected, E::Reconnect), None);
        assert_eq!(transition(S::Suspended, E::Activity), None);
        assert_eq!(transition(S::Suspended, E::IdleTimeout), None);
        for event in [E::Activity, E::IdleTimeout, E::SuspendTimeout, E::Reconnect, E::Disconnect] {
            assert_eq!(transition(S::Disconnected, event), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fires_after_session_timeout() {
        let machine = SessionMachine::new(timeouts());
        assert!(machine.open_session(&node()));
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Connected);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_idle_timer() {
        let machine = SessionMachine::new(timeouts());
        machine.open_session(&node());

        tokio::time::sleep(Duration::from_secs(8)).await;
        let result = machine.handle_event(&node(), SessionEvent::Activity);
        assert!(result.valid);
        assert_eq!(result.next, SessionState::Connected);

        // 8s + 8s exceeds the original deadline, but not the reset one.
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Connected);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_suspends_after_the_suspend_timeout() {
        let machine = SessionMachine::new(timeouts());
        machine.open_session(&node());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Idle);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Suspended);

        // Suspended has no timer; nothing changes however long we wait.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Suspended);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_from_suspended_increments_the_counter() {
        let machine = SessionMachine::new(timeouts());
        machine.open_session(&node());
        machine.handle_event(&node(), SessionEvent::Disconnect);
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Suspended);

        let result = machine.handle_event(&node(), SessionEvent::Reconnect);
        assert!(result.valid);
        assert_eq!(result.previous, SessionState::Suspended);
        assert_eq!(result.next, SessionState::Connected);
        assert_eq!(machine.record(&node()).unwrap().reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_transitions_leave_state_unchanged() {
        let machine = SessionMachine::new(timeouts());
        machine.open_session(&node());

        let result = machine.handle_event(&node(), SessionEvent::SuspendTimeout);
        assert!(!result.valid);
        assert_eq!(result.previous, SessionState::Connected);
        assert_eq!(result.next, SessionState::Connected);
        assert_eq!(machine.record(&node()).unwrap().state, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_sessions_are_removed() {
        let machine = SessionMachine::new(timeouts());
        machine.open_session(&node());
        machine.handle_event(&node(), SessionEvent::Disconnect);
        machine.handle_event(&node(), SessionEvent::Disconnect);
        assert!(machine.record(&node()).is_none());
        assert!(machine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_after_commit() {
        let machine = SessionMachine::new(timeouts());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let probe = machine.clone();
        machine.on_transition(Arc::new(move |node_id, result| {
            // The machine already reflects the new state when the callback
            // runs.
            let committed = probe.record(node_id).map(|r| r.state);
            seen_clone.lock().unwrap().push((result.next, committed));
        }));

        machine.open_session(&node());
        machine.handle_event(&node(), SessionEvent::IdleTimeout);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (SessionState::Idle, Some(SessionState::Idle)));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_open_is_rejected() {
        let machine = SessionMachine::new(timeouts());
        assert!(machine.open_session(&node()));
        assert!(!machine.open_session(&node()));
        assert_eq!(machine.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_for_unknown_nodes_are_invalid() {
        let machine = SessionMachine::new(timeouts());
        let result = machine.handle_event(&node(), SessionEvent::Activity);
        assert!(!result.valid);
    }
}
