use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub bus: BusConfig,
    pub health: HealthCheckConfig,
    pub http: HttpConf,
    pub store: StoreConf,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub close_timeout_secs: u64,
    /// Bound of the client request queue towards the event loop.
    pub request_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "netwatch-kernel".into(),
            username: None,
            password: None,
            keep_alive_secs: 15,
            connect_timeout_secs: 10,
            publish_timeout_secs: 5,
            reconnect_delay_secs: 2,
            close_timeout_secs: 5,
            request_capacity: 64,
        }
    }
}

impl BusConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

/// Tuning of the health-verification pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Minimum interval between two probes of the same device.
    pub cooldown_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub initial_backoff_ms: u64,
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight checks before cancelling them.
    pub drain_timeout_secs: u64,
    pub publish_status_changes: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            cleanup_interval_secs: 600,
            max_concurrent: 10,
            retry_attempts: 3,
            initial_backoff_ms: 3000,
            request_timeout_secs: 5,
            drain_timeout_secs: 10,
            publish_status_changes: true,
        }
    }
}

impl HealthCheckConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConf {
    pub data_file: String,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { data_file: "./data/devices.json".into() }
    }
}

impl KernelConfig {
    pub fn from_yaml(path: &str, txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.health;
        if h.max_concurrent == 0 {
            return Err(ConfigError::Invalid { field: "health.max_concurrent", reason: "must be at least 1" });
        }
        if h.retry_attempts == 0 {
            return Err(ConfigError::Invalid { field: "health.retry_attempts", reason: "must be at least 1" });
        }
        if h.cooldown_secs == 0 {
            return Err(ConfigError::Invalid { field: "health.cooldown_secs", reason: "must be positive" });
        }
        if h.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid { field: "health.cleanup_interval_secs", reason: "must be positive" });
        }
        if self.bus.request_capacity == 0 {
            return Err(ConfigError::Invalid { field: "bus.request_capacity", reason: "must be at least 1" });
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("NETWATCH_BUS_USERNAME") {
            self.bus.username = Some(user);
        }
        if let Ok(pass) = std::env::var("NETWATCH_BUS_PASSWORD") {
            self.bus.password = Some(pass);
        }
    }
}

/// Reads `NETWATCH_KERNEL_CONFIG` (default `kernel.yaml`). A missing file means defaults.
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("NETWATCH_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        KernelConfig::from_yaml(&path, &txt)?
    } else {
        warn!(%path, "no config file, using defaults");
        KernelConfig::default()
    };

    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}
