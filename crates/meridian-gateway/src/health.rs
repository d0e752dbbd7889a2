//! Periodic node liveness monitoring.
//!
//! One owned task ticks at `ping_interval`: it pings every live node,
//! declares nodes dead when their last activity is older than
//! `dead_threshold`, then gives collaborators a sweep pass to evict
//! expired entries. The tick body runs to completion before the next tick
//! is considered, and missed ticks are skipped rather than bunched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use meridian_core::NodeId;

use crate::error::GatewayResult;
use crate::session::SessionMachine;

/// Sends liveness pings to nodes.
#[async_trait]
pub trait PingSender: Send + Sync {
    /// Send one ping.
    async fn ping(&self, node_id: &NodeId) -> GatewayResult<()>;
}

/// Supplies last-activity timestamps for live nodes.
pub trait ActivitySource: Send + Sync {
    /// Last activity per live node.
    fn last_activity(&self) -> Vec<(NodeId, DateTime<Utc>)>;
}

impl ActivitySource for SessionMachine {
    fn last_activity(&self) -> Vec<(NodeId, DateTime<Utc>)> {
        SessionMachine::last_activity(self)
    }
}

/// Invoked when a node's activity is older than the dead threshold.
pub type NodeDeadHandler = Arc<dyn Fn(&NodeId) + Send + Sync>;

/// Periodic eviction pass offered to collaborators (delivery tracker,
/// pairing guard).
#[async_trait]
pub trait SweepHandler: Send + Sync {
    /// Evict whatever has expired as of `now`.
    async fn sweep(&self, now: DateTime<Utc>);
}

/// Monitor tuning.
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitorConfig {
    /// Tick interval.
    pub ping_interval: Duration,
    /// Inactivity after which a node is declared dead.
    pub dead_threshold: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            dead_threshold: Duration::from_secs(90),
        }
    }
}

/// Handle to the running monitor task.
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn the monitor.
    pub fn spawn(
        config: HealthMonitorConfig,
        ping: Arc<dyn PingSender>,
        activity: Arc<dyn ActivitySource>,
        on_dead: NodeDeadHandler,
        sweepers: Vec<Arc<dyn SweepHandler>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.ping_interval);
            // Skipping keeps a slow tick from causing an immediate
            // follow-up tick; ticks never overlap because the body is
            // awaited inline.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; consume it so the
            // first real tick lands one interval after spawn.
            interval.tick().await;

            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tick(&config, ping.as_ref(), activity.as_ref(), &on_dead, &sweepers).await;
                    },
                }
            }
        });
        Self { cancel, handle }
    }

    /// Stop the monitor, waiting for any in-flight tick to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn tick(
    config: &HealthMonitorConfig,
    ping: &dyn PingSender,
    activity: &dyn ActivitySource,
    on_dead: &NodeDeadHandler,
    sweepers: &[Arc<dyn SweepHandler>],
) {
    let nodes = activity.last_activity();
    trace!(node_count = nodes.len(), "health tick");

    for (node_id, _) in &nodes {
        if let Err(e) = ping.ping(node_id).await {
            debug!(node_id = %node_id, error = %e, "liveness ping failed");
        }
    }

    let now = Utc::now();
    for (node_id, last_activity) in nodes {
        let stale = now
            .signed_duration_since(last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if stale >= config.dead_threshold {
            warn!(node_id = %node_id, stale_secs = stale.as_secs(), "node declared dead");
            on_dead(&node_id);
        }
    }

    for sweeper in sweepers {
        sweeper.sweep(now).await;
    }
}
