//! Netwatch kernel: verifies detected network devices with an HTTP health probe
//! and keeps their online/offline status in the device registry.

pub mod channel;
pub mod config;
pub mod cooldown;
pub mod health;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod probe;
pub mod store;

pub use channel::{ChannelError, EventChannel, StatusPublisher};
pub use config::{load_config, KernelConfig};
pub use cooldown::CooldownCache;
pub use models::{DetectionEvent, Device, DeviceId, DeviceStatus};
pub use orchestrator::{CheckOutcome, CheckReport, Dispatch, HealthCheckOrchestrator};
pub use probe::{HealthChecker, HealthProbe, RetryingHealthProbe};
pub use store::{DeviceRegistry, DeviceStore};
