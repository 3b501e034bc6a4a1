/*!
`DeviceStore` wrapper that remembers every `update` it receives.

Backed by an in-memory `DeviceRegistry`; updates can be made to fail to
exercise the orchestrator's store-error path.
*/

use async_trait::async_trait;
use netwatch_kernel::models::{Device, DeviceId, DeviceStatus, Registration};
use netwatch_kernel::store::{DeviceRegistry, DeviceStore, StoreError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct RecordingStore {
    inner: DeviceRegistry,
    updates: Mutex<Vec<Device>>,
    fail_updates: AtomicBool,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self {
            inner: DeviceRegistry::in_memory(),
            updates: Mutex::new(Vec::new()),
            fail_updates: AtomicBool::new(false),
        }
    }
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with one device (status `unknown`) per MAC.
    pub async fn with_devices(macs: &[&str]) -> Result<Self, StoreError> {
        let store = Self::new();
        for mac in macs {
            let id = DeviceId::parse(mac).map_err(|e| {
                StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
            })?;
            store.inner.create(Device::new(id, None)).await?;
        }
        Ok(store)
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<Device> {
        self.updates.lock().clone()
    }

    pub fn updates_for(&self, id: &DeviceId) -> Vec<DeviceStatus> {
        self.updates
            .lock()
            .iter()
            .filter(|d| &d.mac_address == id)
            .map(|d| d.status)
            .collect()
    }

    /// Polls until `id` received an update, returning the latest one.
    pub async fn wait_for_update(&self, id: &DeviceId, timeout: Duration) -> Option<Device> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let latest = self
                .updates
                .lock()
                .iter()
                .rev()
                .find(|d| &d.mac_address == id)
                .cloned();
            if latest.is_some() || tokio::time::Instant::now() >= deadline {
                return latest;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl DeviceStore for RecordingStore {
    async fn find_by_identifier(&self, id: &DeviceId) -> Result<Device, StoreError> {
        self.inner.find_by_identifier(id).await
    }

    async fn update(&self, device: &Device) -> Result<(), StoreError> {
        self.updates.lock().push(device.clone());
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("injected update failure")));
        }
        self.inner.update(device).await
    }

    async fn create(&self, device: Device) -> Result<(), StoreError> {
        self.inner.create(device).await
    }

    async fn upsert(&self, registration: &Registration) -> Result<Device, StoreError> {
        self.inner.upsert(registration).await
    }

    async fn list(&self) -> Result<Vec<Device>, StoreError> {
        self.inner.list().await
    }

    async fn delete(&self, id: &DeviceId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }
}
