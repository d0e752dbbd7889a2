//! Meridian control-plane daemon.
//!
//! Loads the manifest, wires the gateway, model router, health monitor,
//! and config watcher together, and serves until interrupted. Credentials
//! arrive via environment variables; everything else lives in the
//! manifest.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_config::{ConfigWatcher, Manifest, WatchEvent};
use meridian_gateway::{
    DeliveryTracker, DeliveryTrackerConfig, GatewayServer, GatewayServerConfig, HealthMonitor,
    HealthMonitorConfig, LaneCapacities, SessionTimeouts, StaticTokenValidator, SweepHandler,
    TcpAcceptor,
};
use meridian_hooks::RuntimeEvent;
use meridian_llm::{ModelRef, ModelRouter, ModelRouterConfig};
use meridian_proto::SessionEvent;

/// Environment variable carrying the shared node credential.
const TOKEN_ENV: &str = "MERIDIAN_GATEWAY_TOKEN";

/// Pending deliveries older than this are swept out.
const DELIVERY_MAX_AGE_MINUTES: i64 = 30;

#[derive(Debug, Parser)]
#[command(name = "meridiand", about = "Meridian control-plane daemon", version)]
struct Args {
    /// Path to the manifest file.
    #[arg(long, default_value = "meridian.yaml")]
    manifest: PathBuf,

    /// Address the gateway listens on.
    #[arg(long, default_value = "127.0.0.1:9120")]
    bind: String,

    /// Manifest reload debounce in milliseconds.
    #[arg(long, default_value_t = 500)]
    debounce_ms: u64,
}

/// Health-sweep adapter expiring stale pending deliveries.
struct DeliverySweeper {
    delivery: Arc<DeliveryTracker>,
}

#[async_trait]
impl SweepHandler for DeliverySweeper {
    async fn sweep(&self, now: DateTime<Utc>) {
        let expired = self
            .delivery
            .expire_stale(chrono::Duration::minutes(DELIVERY_MAX_AGE_MINUTES), now);
        if expired > 0 {
            warn!(expired, "swept expired pending deliveries");
        }
    }
}

fn gateway_config(manifest: &Manifest) -> GatewayServerConfig {
    let section = &manifest.gateway;
    GatewayServerConfig {
        session_timeouts: SessionTimeouts {
            idle: Duration::from_millis(section.session_timeout_ms),
            suspend: Duration::from_millis(section.suspend_timeout_ms),
        },
        lanes: LaneCapacities {
            steer: section.lanes.steer,
            collect: section.lanes.collect,
            followup: section.lanes.followup,
        },
        delivery: DeliveryTrackerConfig::default(),
        ..GatewayServerConfig::default()
    }
}

fn build_model_router(manifest: &Manifest, server: &GatewayServer) -> Option<Arc<ModelRouter>> {
    let default_model = manifest.model.as_ref()?;
    let chain: Vec<ModelRef> = manifest
        .fallback_chain
        .iter()
        .map(|entry| ModelRef::new(entry.provider.clone(), entry.model.clone()))
        .collect();

    let router = ModelRouter::new(
        ModelRef::new(default_model.provider.clone(), default_model.model.clone()),
        ModelRouterConfig::default(),
    )
    .with_fallback_chain(chain);

    // Bridge usage events onto the runtime emitter.
    let emitter = server.emitter().clone();
    router.on_usage(Arc::new(move |event| {
        emitter.publish(RuntimeEvent::ModelUsage {
            provider: event.provider.clone(),
            model: event.model.clone(),
            input_tokens: event.usage.input_tokens,
            output_tokens: event.usage.output_tokens,
        });
        Ok(())
    }));

    info!(
        model = %format!("{}/{}", default_model.provider, default_model.model),
        fallbacks = manifest.fallback_chain.len(),
        "model router configured"
    );
    Some(Arc::new(router))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    let token = std::env::var(TOKEN_ENV)
        .with_context(|| format!("{TOKEN_ENV} must carry the node credential"))?;

    let server = GatewayServer::new(
        gateway_config(&manifest),
        Arc::new(StaticTokenValidator::new(token)),
    );
    let _model_router = build_model_router(&manifest, &server);

    // Log every runtime event.
    let mut events = server.emitter().subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(event_type = event.event_type(), event = ?event, "runtime event");
        }
    });

    // Health monitor: pings over live connections, dead nodes get a
    // disconnect fed into the session machine, sweeps expire deliveries.
    let sessions = server.sessions().clone();
    let monitor = HealthMonitor::spawn(
        HealthMonitorConfig {
            ping_interval: Duration::from_millis(manifest.gateway.ping_interval_ms),
            dead_threshold: Duration::from_millis(manifest.gateway.dead_threshold_ms),
        },
        server.ping_sender(),
        Arc::new(server.sessions().clone()),
        Arc::new(move |node_id| {
            let _ = sessions.handle_event(node_id, SessionEvent::Disconnect);
        }),
        vec![Arc::new(DeliverySweeper {
            delivery: Arc::clone(server.delivery()),
        })],
    );

    // Manifest hot-reload.
    let (watcher, mut reload_rx) = ConfigWatcher::spawn(
        args.manifest.clone(),
        manifest,
        Duration::from_millis(args.debounce_ms),
    )
    .context("installing config watcher")?;
    let reload_emitter = server.emitter().clone();
    tokio::spawn(async move {
        while let Some(event) = reload_rx.recv().await {
            match event {
                WatchEvent::Updated { new_config, .. } => {
                    info!(
                        max_iterations = ?new_config.execution_limits.max_iterations,
                        "manifest updated, live sections applied"
                    );
                    reload_emitter.publish(RuntimeEvent::ConfigUpdated {
                        restart_required: false,
                    });
                },
                WatchEvent::RestartRequired { section, .. } => {
                    warn!(section, "manifest changed in a section that needs a restart");
                    reload_emitter.publish(RuntimeEvent::ConfigUpdated {
                        restart_required: true,
                    });
                },
                WatchEvent::Error { message } => {
                    error!(message, "manifest reload failed, keeping last good config");
                },
            }
        }
    });

    let acceptor = TcpAcceptor::bind(args.bind.as_str())
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %acceptor.local_addr()?, "gateway listening");

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let serve_server = server.clone();
    let serve_task = tokio::spawn(async move {
        serve_server.serve(Arc::new(acceptor), serve_cancel).await
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    let _ = serve_task.await;
    monitor.shutdown().await;
    watcher.stop().await;
    Ok(())
}
