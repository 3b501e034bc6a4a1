use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use netwatch_devkit::InstrumentedChecker;
use netwatch_kernel::channel::EventChannel;
use netwatch_kernel::config::{BusConfig, HealthCheckConfig};
use netwatch_kernel::health::{HealthTracker, KernelHealth};
use netwatch_kernel::http::{build_router, AppState};
use netwatch_kernel::models::{Device, DeviceId};
use netwatch_kernel::orchestrator::HealthCheckOrchestrator;
use netwatch_kernel::store::{DeviceRegistry, DeviceStore};
use tokio::net::TcpListener;

async fn serve() -> (SocketAddr, EventChannel) {
    let registry = Arc::new(DeviceRegistry::in_memory());
    let mut device = Device::new(DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap(), Some("10.0.0.2".into()));
    device.hostname = Some("nas".into());
    registry.create(device).await.unwrap();

    // No broker on port 1: the channel stays disconnected.
    let channel = EventChannel::new(&BusConfig {
        host: "127.0.0.1".into(),
        port: 1,
        ..BusConfig::default()
    });
    let orchestrator = HealthCheckOrchestrator::new(
        &HealthCheckConfig::default(),
        Arc::new(InstrumentedChecker::new(Duration::ZERO)),
        registry.clone(),
        None,
    );

    let app = build_router(AppState {
        registry: registry.clone(),
        orchestrator: orchestrator.clone(),
        health_tracker: HealthTracker::new(channel.clone(), orchestrator, registry),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, channel)
}

async fn get(addr: SocketAddr, route: &str) -> (u16, String) {
    let resp = reqwest::get(format!("http://{addr}{route}")).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

#[tokio::test]
async fn liveness_and_system_health() {
    let (addr, channel) = serve().await;

    assert_eq!(get(addr, "/health").await, (200, "ok".to_string()));

    let (status, body) = get(addr, "/system/health").await;
    assert_eq!(status, 200);
    let health: KernelHealth = serde_json::from_str(&body).unwrap();
    assert!(!health.bus_connected);
    assert_eq!(health.devices_tracked, 1);
    assert_eq!(health.cooldown_entries, 0);
    assert_eq!(health.checks_in_flight, 0);

    channel.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn device_routes() {
    let (addr, channel) = serve().await;

    let (status, body) = get(addr, "/devices").await;
    assert_eq!(status, 200);
    let devices: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(devices.as_array().map(Vec::len), Some(1));
    assert_eq!(devices[0]["mac_address"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(devices[0]["status"], "unknown");
    assert_eq!(devices[0]["hostname"], "nas");

    let (status, body) = get(addr, "/devices/aa-bb-cc-dd-ee-ff").await;
    assert_eq!(status, 200);
    let device: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(device["ip_address"], "10.0.0.2");
    assert_eq!(device["cooldown_remaining_seconds"], 0);

    assert_eq!(get(addr, "/devices/11:22:33:44:55:66").await.0, 404);
    assert_eq!(get(addr, "/devices/not-a-mac").await.0, 400);

    channel.close(Duration::from_secs(1)).await.unwrap();
}
