/**
 * HTTP STATUS API - Read-only view of the kernel for dashboards and scripts
 *
 * ROUTES:
 * - GET /health          liveness, always "ok"
 * - GET /system/health   KernelHealth snapshot (bus, cooldown, in-flight checks)
 * - GET /devices         every registered device, sorted by MAC
 * - GET /devices/{mac}   one device; 400 on a malformed MAC, 404 when unknown
 *
 * Timestamps are rendered as RFC3339 strings; `cooldown_remaining_seconds`
 * tells when the next detection of the device will trigger a probe.
 */

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::error;

use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Device, DeviceId, DeviceStatus};
use crate::orchestrator::HealthCheckOrchestrator;
use crate::store::{DeviceRegistry, DeviceStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub orchestrator: HealthCheckOrchestrator,
    pub health_tracker: HealthTracker,
}

#[derive(Debug, Serialize)]
struct DeviceView {
    mac_address: String,
    ip_address: Option<String>,
    hostname: Option<String>,
    status: DeviceStatus,
    last_seen: Option<String>,
    last_checked: Option<String>,
    cooldown_remaining_seconds: u64,
}

fn rfc3339(ts: Option<OffsetDateTime>) -> Option<String> {
    ts.and_then(|t| t.format(&Rfc3339).ok())
}

fn to_view(device: &Device, orchestrator: &HealthCheckOrchestrator) -> DeviceView {
    DeviceView {
        mac_address: device.mac_address.to_string(),
        ip_address: device.ip_address.clone(),
        hostname: device.hostname.clone(),
        status: device.status,
        last_seen: rfc3339(device.last_seen),
        last_checked: rfc3339(device.last_checked),
        cooldown_remaining_seconds: orchestrator
            .cooldown()
            .time_until_next_check(&device.mac_address)
            .as_secs(),
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(list_devices))
        .route("/devices/{mac}", get(get_device))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.snapshot().await)
}

// GET /devices
async fn list_devices(State(app): State<AppState>) -> Result<Json<Vec<DeviceView>>, StatusCode> {
    let devices = app.registry.list().await.map_err(|e| {
        error!(error = %e, "failed to list devices");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(devices.iter().map(|d| to_view(d, &app.orchestrator)).collect()))
}

// GET /devices/{mac}
async fn get_device(
    State(app): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    let id = DeviceId::parse(&mac).map_err(|_| StatusCode::BAD_REQUEST)?;
    match app.registry.find_by_identifier(&id).await {
        Ok(device) => Ok(Json(to_view(&device, &app.orchestrator))),
        Err(StoreError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(device = %id, error = %e, "device lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
