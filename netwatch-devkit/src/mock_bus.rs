/*!
Status publisher that records instead of talking to a broker.

Mirrors `EventChannel`'s publish rules: a cancelled token or a
"disconnected" publisher fails before anything is recorded.
*/

use async_trait::async_trait;
use netwatch_kernel::channel::{ChannelError, StatusPublisher};
use netwatch_kernel::models::{DeviceStatusChanged, STATUS_TOPIC};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    disconnected: Arc<AtomicBool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn find_by_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Decodes the last message published on `topic`.
    pub fn last_json<T: DeserializeOwned>(&self, topic: &str) -> Option<T> {
        self.find_by_topic(topic)
            .last()
            .and_then(|m| serde_json::from_slice(&m.payload).ok())
    }

    pub fn status_changes(&self) -> Vec<DeviceStatusChanged> {
        self.find_by_topic(STATUS_TOPIC)
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    /// Polls until at least `count` messages were recorded or `timeout` elapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.published.lock().len() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish_status(
        &self,
        cancel: &CancellationToken,
        event: &DeviceStatusChanged,
    ) -> Result<(), ChannelError> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        let payload = serde_json::to_vec(event)?;
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }

        debug!(topic = STATUS_TOPIC, bytes = payload.len(), "[mock] published");
        self.published.lock().push(PublishedMessage {
            topic: STATUS_TOPIC.to_string(),
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netwatch_kernel::models::{DeviceId, DeviceStatus};

    fn changed() -> DeviceStatusChanged {
        DeviceStatusChanged::new(
            DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap(),
            "10.0.0.7",
            DeviceStatus::Unknown,
            DeviceStatus::Online,
        )
    }

    #[tokio::test]
    async fn records_status_changes() {
        let publisher = RecordingPublisher::new();
        publisher
            .publish_status(&CancellationToken::new(), &changed())
            .await
            .unwrap();

        let changes = publisher.status_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, DeviceStatus::Online);
        let last: Option<serde_json::Value> = publisher.last_json(STATUS_TOPIC);
        assert_eq!(last.unwrap()["ip_address"], "10.0.0.7");
    }

    #[tokio::test]
    async fn cancelled_or_disconnected_records_nothing() {
        let publisher = RecordingPublisher::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            publisher.publish_status(&cancel, &changed()).await,
            Err(ChannelError::Cancelled)
        ));

        publisher.set_disconnected(true);
        assert!(matches!(
            publisher
                .publish_status(&CancellationToken::new(), &changed())
                .await,
            Err(ChannelError::NotConnected)
        ));
        assert!(publisher.published().is_empty());
    }
}
