/**
 * DEVICE STORE - Persisted device records keyed by MAC address
 *
 * ROLE: The orchestrator only needs `find_by_identifier` and `update`; the rest of
 * the CRUD surface serves the registration path and the HTTP API.
 *
 * STORAGE: `DeviceRegistry` keeps the map in memory behind a tokio RwLock and,
 * when a data file is configured, rewrites the whole map as pretty JSON after
 * every mutation (same layout as it is loaded at start-up).
 */

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::{Device, DeviceId, Registration};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("device not found: {0}")]
    NotFound(DeviceId),
    #[error("device already exists: {0}")]
    AlreadyExists(DeviceId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_by_identifier(&self, id: &DeviceId) -> Result<Device, StoreError>;

    /// Replaces an existing record. Fails with `NotFound` for unknown devices.
    async fn update(&self, device: &Device) -> Result<(), StoreError>;

    async fn create(&self, device: Device) -> Result<(), StoreError>;

    /// Inserts or refreshes a device from a registration; status is kept for known devices.
    async fn upsert(&self, registration: &Registration) -> Result<Device, StoreError>;

    async fn list(&self) -> Result<Vec<Device>, StoreError>;

    async fn delete(&self, id: &DeviceId) -> Result<(), StoreError>;
}

pub type DevicesMap = HashMap<DeviceId, Device>;

pub struct DeviceRegistry {
    devices: RwLock<DevicesMap>,
    data_file: Option<PathBuf>,
}

impl DeviceRegistry {
    pub fn in_memory() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            data_file: None,
        }
    }

    /// Opens a registry persisted at `path`, loading existing records if the file exists.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        let devices = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str::<DevicesMap>(&content)?
            }
        } else {
            info!(path = %path.display(), "no device file yet, starting empty");
            HashMap::new()
        };

        info!(count = devices.len(), path = %path.display(), "device registry loaded");
        Ok(Self {
            devices: RwLock::new(devices),
            data_file: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    async fn save(&self, devices: &DevicesMap) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(devices)?;
        write_atomic(path, content.as_bytes()).await?;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl DeviceStore for DeviceRegistry {
    async fn find_by_identifier(&self, id: &DeviceId) -> Result<Device, StoreError> {
        self.devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update(&self, device: &Device) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let Some(slot) = devices.get_mut(&device.mac_address) else {
            return Err(StoreError::NotFound(device.mac_address.clone()));
        };
        *slot = device.clone();
        self.save(&devices).await
    }

    async fn create(&self, device: Device) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.mac_address) {
            return Err(StoreError::AlreadyExists(device.mac_address));
        }
        devices.insert(device.mac_address.clone(), device);
        self.save(&devices).await
    }

    async fn upsert(&self, registration: &Registration) -> Result<Device, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut devices = self.devices.write().await;

        let device = devices
            .entry(registration.device_id.clone())
            .or_insert_with(|| {
                debug!(device = %registration.device_id, "new device registered");
                Device::new(registration.device_id.clone(), None)
            });
        if registration.address.is_some() {
            device.ip_address = registration.address.clone();
        }
        if registration.hostname.is_some() {
            device.hostname = registration.hostname.clone();
        }
        device.last_seen = Some(now);
        let device = device.clone();

        self.save(&devices).await?;
        Ok(device)
    }

    async fn list(&self) -> Result<Vec<Device>, StoreError> {
        let mut all: Vec<Device> = self.devices.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        Ok(all)
    }

    async fn delete(&self, id: &DeviceId) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        if devices.remove(id).is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.save(&devices).await
    }
}
