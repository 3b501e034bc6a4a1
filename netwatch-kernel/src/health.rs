use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::channel::EventChannel;
use crate::orchestrator::HealthCheckOrchestrator;
use crate::store::DeviceRegistry;

/// Point-in-time view of the kernel, served on `/system/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub bus_connected: bool,
    pub bus_reconnects: u32,
    pub devices_tracked: usize,
    pub cooldown_entries: usize,
    pub checks_in_flight: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    channel: EventChannel,
    orchestrator: HealthCheckOrchestrator,
    registry: Arc<DeviceRegistry>,
}

impl HealthTracker {
    pub fn new(
        channel: EventChannel,
        orchestrator: HealthCheckOrchestrator,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            channel,
            orchestrator,
            registry,
        }
    }

    pub async fn snapshot(&self) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            bus_connected: self.channel.is_connected(),
            bus_reconnects: self.channel.reconnects(),
            devices_tracked: self.registry.len().await,
            cooldown_entries: self.orchestrator.cooldown().len(),
            checks_in_flight: self.orchestrator.in_flight(),
        }
    }
}
