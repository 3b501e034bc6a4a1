//! Managed MQTT connection used to receive detections and publish status changes.
//!
//! The rumqttc event loop runs on its own task. It reconnects on its own after a
//! failure; connect, reconnect, disconnect and close are logged and reflected in
//! [`EventChannel::is_connected`], nothing more. Callers treat "not connected"
//! as "publish will fail".

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::models::{DeviceStatusChanged, STATUS_TOPIC};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("not connected to the message bus")]
    NotConnected,
    #[error("event channel is closed")]
    Closed,
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("bus client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("publish to {topic} timed out after {timeout:?}")]
    PublishTimeout { topic: String, timeout: Duration },
    #[error("no broker connection after {0:?}")]
    ConnectTimeout(Duration),
    #[error("graceful close did not finish within {0:?}, connection forced closed")]
    CloseTimeout(Duration),
    #[error("no handler registered for topic {0}")]
    NoHandler(String),
    #[error("handler for {topic} failed: {reason}")]
    Handler { topic: String, reason: String },
    #[error("publish task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type MessageHandler =
    Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Outbound seam used by the orchestrator for status-changed notifications.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_status(
        &self,
        cancel: &CancellationToken,
        event: &DeviceStatusChanged,
    ) -> Result<(), ChannelError>;
}

// State shared with the event-loop task.
struct Shared {
    client: AsyncClient,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    connected: watch::Sender<bool>,
    reconnects: AtomicU32,
    closing: AtomicBool,
}

impl Shared {
    fn route(&self, topic: &str) -> Option<MessageHandler> {
        self.handlers.read().get(topic).cloned()
    }

    async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        let handler = self
            .route(topic)
            .ok_or_else(|| ChannelError::NoHandler(topic.to_string()))?;
        handler(InboundMessage {
            topic: topic.to_string(),
            payload,
        })
        .await
        .map_err(|e| ChannelError::Handler {
            topic: topic.to_string(),
            reason: format!("{e:#}"),
        })
    }

    // Clean sessions drop subscriptions, so every ConnAck re-issues them.
    fn resubscribe(&self) {
        for topic in self.handlers.read().keys() {
            if let Err(e) = self.client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                warn!(%topic, error = %e, "failed to re-subscribe");
            }
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    publish_timeout: Duration,
    shutdown: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl EventChannel {
    /// Spawns the event loop and returns without waiting for the broker.
    pub fn new(config: &BusConfig) -> Self {
        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(config.keep_alive());
        opts.set_clean_session(true);
        if let Some(user) = &config.username {
            opts.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(opts, config.request_capacity);
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            client,
            handlers: RwLock::new(HashMap::new()),
            connected,
            reconnects: AtomicU32::new(0),
            closing: AtomicBool::new(false),
        });

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            shared.clone(),
            shutdown.clone(),
            config.reconnect_delay(),
        ));

        info!(host = %config.host, port = config.port, client_id = %config.client_id, "event channel started");

        Self {
            inner: Arc::new(Inner {
                shared,
                publish_timeout: config.publish_timeout(),
                shutdown,
                event_loop: Mutex::new(Some(handle)),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Like [`new`](Self::new) but waits for the first ConnAck; closes the channel on failure.
    pub async fn connect(config: &BusConfig) -> Result<Self, ChannelError> {
        let channel = Self::new(config);
        if let Err(e) = channel.wait_connected(config.connect_timeout()).await {
            if let Err(close_err) = channel.close(config.close_timeout()).await {
                warn!(error = %close_err, "failed to close channel after connect failure");
            }
            return Err(e);
        }
        Ok(channel)
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut rx = self.inner.shared.connected.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|up| *up).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::ConnectTimeout(timeout)),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.shared.connected.borrow()
    }

    pub fn reconnects(&self) -> u32 {
        self.inner.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Registers `handler` for messages on `topic` (exact match) and subscribes
    /// when connected. Subscriptions are re-issued after every reconnect.
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<(), ChannelError>
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let shared = &self.inner.shared;
        if shared.closing.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let handler: MessageHandler =
            Arc::new(move |msg| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(handler(msg)) });
        shared.handlers.write().insert(topic.to_string(), handler);

        if self.is_connected() {
            shared.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        }
        info!(%topic, "subscribed");
        Ok(())
    }

    /// Routes a message to the handler registered for `topic`, as the event loop does.
    pub async fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.inner.shared.deliver(topic, payload).await
    }

    /// Serializes `payload` as JSON and hands it to the transport.
    ///
    /// The send runs on its own task and is raced against `cancel` and the
    /// configured publish timeout, so a stalled transport never blocks the caller.
    pub async fn publish<T>(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: &T,
    ) -> Result<(), ChannelError>
    where
        T: Serialize + Sync + ?Sized,
    {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        if self.inner.shared.closing.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let bytes = serde_json::to_vec(payload)?;
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        let client = self.inner.shared.client.clone();
        let owned_topic = topic.to_string();
        let mut send = tokio::spawn(async move {
            client
                .publish(owned_topic, QoS::AtLeastOnce, false, bytes)
                .await
        });

        let timeout = self.inner.publish_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                send.abort();
                Err(ChannelError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                send.abort();
                Err(ChannelError::PublishTimeout { topic: topic.to_string(), timeout })
            }
            res = &mut send => match res {
                Ok(Ok(())) => {
                    debug!(%topic, "published");
                    Ok(())
                }
                Ok(Err(e)) => Err(ChannelError::Client(e)),
                Err(e) => Err(ChannelError::Task(e.to_string())),
            },
        }
    }

    /// Disconnects gracefully within `timeout`; past it the event loop is torn
    /// down anyway and `CloseTimeout` is returned. Closing twice is a no-op.
    pub async fn close(&self, timeout: Duration) -> Result<(), ChannelError> {
        let _transition = self.inner.lifecycle.lock().await;
        let Some(mut handle) = self.inner.event_loop.lock().take() else {
            return Ok(());
        };

        let shared = &self.inner.shared;
        shared.closing.store(true, Ordering::SeqCst);
        let connected = self.is_connected();

        let graceful = tokio::time::timeout(timeout, async {
            if connected {
                if let Err(e) = shared.client.disconnect().await {
                    warn!(error = %e, "disconnect request failed");
                    self.inner.shutdown.cancel();
                }
            } else {
                self.inner.shutdown.cancel();
            }
            if let Err(e) = (&mut handle).await {
                warn!(error = %e, "event loop task ended abnormally");
            }
        })
        .await;

        shared.connected.send_replace(false);
        match graceful {
            Ok(()) => {
                info!("event channel closed");
                Ok(())
            }
            Err(_) => {
                warn!(?timeout, "graceful close timed out, forcing");
                self.inner.shutdown.cancel();
                handle.abort();
                Err(ChannelError::CloseTimeout(timeout))
            }
        }
    }
}

#[async_trait]
impl StatusPublisher for EventChannel {
    async fn publish_status(
        &self,
        cancel: &CancellationToken,
        event: &DeviceStatusChanged,
    ) -> Result<(), ChannelError> {
        self.publish(cancel, STATUS_TOPIC, event).await
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
) {
    let mut ever_connected = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                shared.connected.send_replace(true);
                if ever_connected {
                    let total = shared.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(reconnects = total, "bus reconnected");
                } else {
                    info!("bus connected");
                }
                ever_connected = true;
                shared.resubscribe();
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = shared.deliver(&p.topic, p.payload.to_vec()).await {
                        warn!(topic = %p.topic, error = %e, "inbound message rejected");
                    }
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.connected.send_replace(false);
                info!("bus disconnected on request");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = shared.connected.send_replace(false);
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
                if was_connected {
                    warn!(error = %e, "bus connection lost, reconnecting");
                } else {
                    debug!(error = %e, "bus connection attempt failed");
                }
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    shared.connected.send_replace(false);
    debug!("event loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    // Nothing listens on port 1, so the channel never connects.
    fn unreachable_bus() -> BusConfig {
        BusConfig {
            host: "127.0.0.1".into(),
            port: 1,
            connect_timeout_secs: 1,
            reconnect_delay_secs: 1,
            ..BusConfig::default()
        }
    }

    #[tokio::test]
    async fn new_channel_starts_disconnected() {
        let channel = EventChannel::new(&unreachable_bus());
        assert!(!channel.is_connected());
        assert_eq!(channel.reconnects(), 0);
        channel.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn publish_with_cancelled_token_never_sends() {
        let channel = EventChannel::new(&unreachable_bus());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = channel
            .publish(&cancel, STATUS_TOPIC, &serde_json::json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled));
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails() {
        let channel = EventChannel::new(&unreachable_bus());
        let err = channel
            .publish(&CancellationToken::new(), STATUS_TOPIC, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let channel = EventChannel::new(&unreachable_bus());
        channel.close(Duration::from_secs(1)).await.unwrap();
        channel.close(Duration::from_secs(1)).await.unwrap();

        let err = channel
            .publish(&CancellationToken::new(), STATUS_TOPIC, "late")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert!(matches!(
            channel.subscribe("a/b", |_| async { Ok::<_, anyhow::Error>(()) }),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn connect_gives_up_after_timeout() {
        let err = EventChannel::connect(&unreachable_bus()).await.err().unwrap();
        assert!(matches!(err, ChannelError::ConnectTimeout(_)));
    }

    #[tokio::test]
    async fn deliver_routes_by_topic() {
        let channel = EventChannel::new(&unreachable_bus());
        let (tx, mut rx) = mpsc::unbounded_channel();

        channel
            .subscribe("netwatch/test@v1", move |msg: InboundMessage| {
                let tx = tx.clone();
                async move {
                    tx.send(msg.payload)?;
                    Ok::<_, anyhow::Error>(())
                }
            })
            .unwrap();
        channel
            .subscribe("netwatch/fail@v1", |_| async {
                Err::<(), _>(anyhow::anyhow!("bad payload"))
            })
            .unwrap();

        channel.deliver("netwatch/test@v1", b"ping".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"ping".to_vec());

        assert!(matches!(
            channel.deliver("netwatch/other@v1", Vec::new()).await,
            Err(ChannelError::NoHandler(_))
        ));
        match channel.deliver("netwatch/fail@v1", Vec::new()).await {
            Err(ChannelError::Handler { reason, .. }) => assert!(reason.contains("bad payload")),
            other => panic!("unexpected: {other:?}"),
        }

        channel.close(Duration::from_secs(1)).await.unwrap();
    }

    // Minimal MQTT 3.1.1 peer. Acknowledges CONNECT and SUBSCRIBE, answers each
    // SUBSCRIBE with one QoS 0 "hello" on the same topic, and reports every
    // packet it reads as (connection index, packet type).
    mod broker {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::sync::mpsc;

        pub const CONNECT: u8 = 1;
        pub const PUBLISH: u8 = 3;
        pub const SUBSCRIBE: u8 = 8;
        pub const DISCONNECT: u8 = 14;

        async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
            let header = stream.read_u8().await.ok()?;
            let mut len = 0usize;
            let mut shift = 0;
            loop {
                let byte = stream.read_u8().await.ok()?;
                len |= ((byte & 0x7f) as usize) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            let mut body = vec![0; len];
            stream.read_exact(&mut body).await.ok()?;
            Some((header >> 4, body))
        }

        fn hello_on(subscribe_body: &[u8]) -> Vec<u8> {
            let topic_len = u16::from_be_bytes([subscribe_body[2], subscribe_body[3]]) as usize;
            let topic = &subscribe_body[4..4 + topic_len];
            let payload = b"hello";
            let mut packet = vec![0x30, (2 + topic_len + payload.len()) as u8];
            packet.extend_from_slice(&(topic_len as u16).to_be_bytes());
            packet.extend_from_slice(topic);
            packet.extend_from_slice(payload);
            packet
        }

        /// With `drop_first`, the first connection is closed right after its first SUBACK.
        pub async fn spawn(drop_first: bool) -> (u16, mpsc::UnboundedReceiver<(usize, u8)>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (tx, rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                let mut index = 0usize;
                while let Ok((mut stream, _)) = listener.accept().await {
                    let tx = tx.clone();
                    let drop_after_suback = drop_first && index == 0;
                    let conn = index;
                    tokio::spawn(async move {
                        while let Some((kind, body)) = read_packet(&mut stream).await {
                            let _ = tx.send((conn, kind));
                            let reply = match kind {
                                CONNECT => vec![0x20, 0x02, 0x00, 0x00],
                                SUBSCRIBE => {
                                    let mut reply = vec![0x90, 0x03, body[0], body[1], 0x00];
                                    if !drop_after_suback {
                                        reply.extend(hello_on(&body));
                                    }
                                    reply
                                }
                                _ => continue,
                            };
                            if stream.write_all(&reply).await.is_err() {
                                return;
                            }
                            if kind == SUBSCRIBE && drop_after_suback {
                                return;
                            }
                        }
                    });
                    index += 1;
                }
            });

            (port, rx)
        }

        pub async fn expect(rx: &mut mpsc::UnboundedReceiver<(usize, u8)>, want: (usize, u8)) {
            let seen = tokio::time::timeout(std::time::Duration::from_secs(5), async {
                while let Some(packet) = rx.recv().await {
                    if packet == want {
                        return true;
                    }
                }
                false
            })
            .await;
            assert_eq!(seen, Ok(true), "broker never saw {want:?}");
        }
    }

    fn local_bus(port: u16) -> BusConfig {
        BusConfig {
            host: "127.0.0.1".into(),
            port,
            connect_timeout_secs: 5,
            reconnect_delay_secs: 0,
            ..BusConfig::default()
        }
    }

    #[tokio::test]
    async fn connected_lifecycle_publishes_receives_and_disconnects() {
        let (port, mut seen) = broker::spawn(false).await;
        let channel = EventChannel::connect(&local_bus(port)).await.unwrap();
        assert!(channel.is_connected());
        assert_eq!(channel.reconnects(), 0);

        let (tx, mut inbound) = mpsc::unbounded_channel();
        channel
            .subscribe("netwatch/test@v1", move |msg: InboundMessage| {
                let tx = tx.clone();
                async move {
                    tx.send(msg)?;
                    Ok::<_, anyhow::Error>(())
                }
            })
            .unwrap();
        broker::expect(&mut seen, (0, broker::SUBSCRIBE)).await;

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "netwatch/test@v1");
        assert_eq!(msg.payload, b"hello".to_vec());

        channel
            .publish(&CancellationToken::new(), STATUS_TOPIC, &serde_json::json!({"status": "online"}))
            .await
            .unwrap();
        broker::expect(&mut seen, (0, broker::PUBLISH)).await;

        channel.close(Duration::from_secs(2)).await.unwrap();
        broker::expect(&mut seen, (0, broker::DISCONNECT)).await;
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn reconnect_reissues_subscriptions() {
        let (port, mut seen) = broker::spawn(true).await;
        let channel = EventChannel::connect(&local_bus(port)).await.unwrap();

        channel
            .subscribe("netwatch/test@v1", |_| async { Ok::<_, anyhow::Error>(()) })
            .unwrap();
        broker::expect(&mut seen, (0, broker::SUBSCRIBE)).await;

        // The broker hangs up; the second connection must see the subscription again.
        broker::expect(&mut seen, (1, broker::CONNECT)).await;
        broker::expect(&mut seen, (1, broker::SUBSCRIBE)).await;
        assert_eq!(channel.reconnects(), 1);
        channel.wait_connected(Duration::from_secs(1)).await.unwrap();

        channel.close(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn close_past_its_deadline_is_forced() {
        let (port, _seen) = broker::spawn(false).await;
        let config = BusConfig {
            request_capacity: 1,
            ..local_bus(port)
        };
        let channel = EventChannel::connect(&config).await.unwrap();

        // The broker never acknowledges QoS 1 publishes: once the client's
        // 100-message in-flight window is full the request queue backs up, so
        // the disconnect request can never be handed to the event loop.
        let cancel = CancellationToken::new();
        for seq in 0..101 {
            channel.publish(&cancel, STATUS_TOPIC, &seq).await.unwrap();
        }

        let err = channel.close(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, ChannelError::CloseTimeout(_)));
        assert!(!channel.is_connected());

        channel.close(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            channel.publish(&cancel, STATUS_TOPIC, "late").await,
            Err(ChannelError::Closed)
        ));
    }
}
