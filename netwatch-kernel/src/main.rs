/**
 * NETWATCH KERNEL - Process entry point
 *
 * BOOT: tracing -> .env -> config -> device registry -> bus connection
 *       -> orchestrator -> subscriptions -> cooldown sweeper -> HTTP API
 *
 * SHUTDOWN (Ctrl-C): HTTP server stops first, then in-flight health checks
 * get `health.drain_timeout_secs` to finish, then the bus connection closes.
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netwatch_kernel::channel::{EventChannel, InboundMessage, StatusPublisher};
use netwatch_kernel::config::load_config;
use netwatch_kernel::health::HealthTracker;
use netwatch_kernel::http::{build_router, AppState};
use netwatch_kernel::models::{Registration, DETECTED_TOPIC, REGISTRATION_TOPIC};
use netwatch_kernel::orchestrator::HealthCheckOrchestrator;
use netwatch_kernel::probe::RetryingHealthProbe;
use netwatch_kernel::store::{DeviceRegistry, DeviceStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netwatch_kernel=info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let cfg = load_config().await.context("loading kernel configuration")?;
    info!(
        broker = %format!("{}:{}", cfg.bus.host, cfg.bus.port),
        cooldown_secs = cfg.health.cooldown_secs,
        max_concurrent = cfg.health.max_concurrent,
        "starting netwatch kernel"
    );

    let registry = Arc::new(
        DeviceRegistry::open(&cfg.store.data_file)
            .await
            .with_context(|| format!("opening device registry {}", cfg.store.data_file))?,
    );

    let channel = EventChannel::connect(&cfg.bus)
        .await
        .context("connecting to the message bus")?;

    let checker = Arc::new(RetryingHealthProbe::from_config(&cfg.health).context("building health probe")?);
    let publisher: Arc<dyn StatusPublisher> = Arc::new(channel.clone());
    let orchestrator =
        HealthCheckOrchestrator::new(&cfg.health, checker, registry.clone(), Some(publisher));

    let detections = orchestrator.clone();
    channel.subscribe(DETECTED_TOPIC, move |msg: InboundMessage| {
        let orchestrator = detections.clone();
        async move {
            orchestrator.handle_payload(&msg.payload)?;
            anyhow::Ok(())
        }
    })?;

    let store = registry.clone();
    channel.subscribe(REGISTRATION_TOPIC, move |msg: InboundMessage| {
        let store = store.clone();
        async move {
            let registration = Registration::from_payload(&msg.payload)?;
            let device = store.upsert(&registration).await?;
            info!(device = %device.mac_address, ip = ?device.ip_address, "device registered");
            anyhow::Ok(())
        }
    })?;

    let shutdown = CancellationToken::new();
    orchestrator.start_cleanup(&shutdown);

    let app = build_router(AppState {
        registry: registry.clone(),
        orchestrator: orchestrator.clone(),
        health_tracker: HealthTracker::new(channel.clone(), orchestrator.clone(), registry),
    });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding HTTP listener on {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if !orchestrator.shutdown(cfg.health.drain_timeout()).await {
        warn!("some health checks were abandoned during shutdown");
    }
    if let Err(e) = channel.close(cfg.bus.close_timeout()).await {
        warn!(error = %e, "bus connection did not close cleanly");
    }

    info!("netwatch kernel stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
