/**
 * HEALTH CHECK ORCHESTRATOR - From "device detected" to persisted status
 *
 * FLOW: validate -> cooldown -> spawn on tracker -> semaphore slot -> probe
 *       -> store lookup -> store update -> (optional) status-changed publish
 *
 * CONTEXTS: checks run under the orchestrator's own dispatch token, not the
 * caller's, so closing the event channel never aborts a probe in flight. Only
 * `shutdown` cancels that token, and only once the grace period has run out.
 *
 * ERRORS: everything past dispatch is logged with device and event ids and
 * summarized in the `CheckReport`; nothing is retried at this level.
 */

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::channel::StatusPublisher;
use crate::config::HealthCheckConfig;
use crate::cooldown::{CooldownCache, CooldownSweeper};
use crate::models::{DetectionEvent, DeviceId, DeviceStatus, DeviceStatusChanged, EventError};
use crate::probe::{HealthChecker, ProbeError};
use crate::store::{DeviceStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid detection event: {0}")]
    Invalid(#[from] EventError),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

/// What happened to an accepted detection event.
#[derive(Debug)]
pub enum Dispatch {
    /// A check was spawned; the handle resolves once it is finished.
    Started(JoinHandle<CheckReport>),
    /// The device was probed recently.
    Suppressed { retry_in: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Updated {
        previous: DeviceStatus,
        status: DeviceStatus,
    },
    DeviceNotFound,
    StoreFailed(String),
    /// Cancelled by shutdown before a status could be computed.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub device_id: DeviceId,
    pub event_id: String,
    pub attempts: u32,
    pub outcome: CheckOutcome,
}

struct Inner {
    cooldown: Arc<CooldownCache>,
    sweeper: CooldownSweeper,
    checker: Arc<dyn HealthChecker>,
    store: Arc<dyn DeviceStore>,
    publisher: Option<Arc<dyn StatusPublisher>>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    tracker: TaskTracker,
    dispatch: CancellationToken,
}

#[derive(Clone)]
pub struct HealthCheckOrchestrator {
    inner: Arc<Inner>,
}

impl HealthCheckOrchestrator {
    /// `publisher` is only used when `publish_status_changes` is enabled.
    pub fn new(
        config: &HealthCheckConfig,
        checker: Arc<dyn HealthChecker>,
        store: Arc<dyn DeviceStore>,
        publisher: Option<Arc<dyn StatusPublisher>>,
    ) -> Self {
        let cooldown = Arc::new(CooldownCache::new(config.cooldown()));
        let sweeper = CooldownSweeper::new(cooldown.clone(), config.cleanup_interval());
        let max_concurrent = config.max_concurrent.max(1);

        Self {
            inner: Arc::new(Inner {
                cooldown,
                sweeper,
                checker,
                store,
                publisher: publisher.filter(|_| config.publish_status_changes),
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                tracker: TaskTracker::new(),
                dispatch: CancellationToken::new(),
            }),
        }
    }

    /// Validates the event and, unless the device is cooling down, spawns its check.
    ///
    /// Only validation and shutdown are reported here; the check's own result
    /// is available through the returned handle and the logs.
    pub fn on_detection_event(&self, event: DetectionEvent) -> Result<Dispatch, OrchestratorError> {
        if let Err(e) = event.validate() {
            warn!(event_id = %event.event_id, device = %event.device_id, error = %e, "rejected detection event");
            return Err(e.into());
        }
        if self.inner.tracker.is_closed() {
            return Err(OrchestratorError::ShuttingDown);
        }

        if !self.inner.cooldown.can_check(&event.device_id) {
            let retry_in = self.inner.cooldown.time_until_next_check(&event.device_id);
            debug!(
                device = %event.device_id,
                event_id = %event.event_id,
                retry_in_secs = retry_in.as_secs(),
                "device in cooldown, skipping check"
            );
            return Ok(Dispatch::Suppressed { retry_in });
        }

        debug!(device = %event.device_id, event_id = %event.event_id, address = %event.address, "dispatching health check");
        // Marked at dispatch so repeats are suppressed while the check waits for a slot.
        self.inner.cooldown.mark_checked(&event.device_id);
        let inner = self.inner.clone();
        let handle = self.inner.tracker.spawn(run_check(inner, event));
        Ok(Dispatch::Started(handle))
    }

    /// Parses a raw bus payload and hands it to [`on_detection_event`](Self::on_detection_event).
    pub fn handle_payload(&self, payload: &[u8]) -> Result<Dispatch, OrchestratorError> {
        let event = DetectionEvent::from_payload(payload).inspect_err(|e| {
            warn!(error = %e, "malformed detection payload");
        })?;
        self.on_detection_event(event)
    }

    pub fn start_cleanup(&self, shutdown: &CancellationToken) {
        self.inner.sweeper.start(shutdown);
    }

    pub fn stop_cleanup(&self) {
        self.inner.sweeper.stop();
    }

    pub fn cooldown(&self) -> &CooldownCache {
        &self.inner.cooldown
    }

    /// Probes currently holding a concurrency slot.
    pub fn in_flight(&self) -> usize {
        self.inner.max_concurrent - self.inner.semaphore.available_permits()
    }

    /// Checks spawned and not yet finished, including those waiting for a slot.
    pub fn pending(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stops accepting events and waits up to `grace` for running checks.
    /// Returns `false` when the remaining checks had to be cancelled.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.sweeper.stop();
        self.inner.tracker.close();

        let pending = self.inner.tracker.len();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs_f32(), "waiting for in-flight health checks");
        }

        let drained = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                pending = self.inner.tracker.len(),
                "health checks still running after grace period, cancelling"
            );
            self.inner.dispatch.cancel();
            self.inner.tracker.wait().await;
        }

        info!(drained, "health check orchestrator stopped");
        drained
    }
}

async fn run_check(inner: Arc<Inner>, event: DetectionEvent) -> CheckReport {
    let device_id = event.device_id.clone();
    let report = |attempts: u32, outcome: CheckOutcome| CheckReport {
        device_id: event.device_id.clone(),
        event_id: event.event_id.clone(),
        attempts,
        outcome,
    };

    let permit = tokio::select! {
        biased;
        _ = inner.dispatch.cancelled() => {
            info!(device = %device_id, event_id = %event.event_id, "check abandoned while waiting for a slot");
            return report(0, CheckOutcome::Abandoned);
        }
        permit = inner.semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return report(0, CheckOutcome::Abandoned),
        },
    };

    let probe = inner.checker.check_health(&inner.dispatch, &event.address).await;
    inner.cooldown.mark_checked(&device_id);
    drop(permit);

    let (alive, attempts) = match &probe {
        Ok(outcome) => (true, outcome.attempts),
        Err(ProbeError::Cancelled) => {
            info!(device = %device_id, event_id = %event.event_id, "check abandoned during probe");
            return report(0, CheckOutcome::Abandoned);
        }
        Err(e) => {
            warn!(device = %device_id, event_id = %event.event_id, error = %e, "device failed health check");
            let attempts = match e {
                ProbeError::Exhausted { attempts, .. } => *attempts,
                _ => 1,
            };
            (false, attempts)
        }
    };

    let status = DeviceStatus::from_probe(alive);
    let outcome = persist_status(&inner, &event, status).await;
    report(attempts, outcome)
}

async fn persist_status(inner: &Inner, event: &DetectionEvent, status: DeviceStatus) -> CheckOutcome {
    let device_id = &event.device_id;

    let mut device = match inner.store.find_by_identifier(device_id).await {
        Ok(device) => device,
        Err(StoreError::NotFound(_)) => {
            warn!(device = %device_id, event_id = %event.event_id, "detected device is not registered");
            return CheckOutcome::DeviceNotFound;
        }
        Err(e) => {
            error!(device = %device_id, event_id = %event.event_id, error = %e, "device lookup failed");
            return CheckOutcome::StoreFailed(e.to_string());
        }
    };

    let now = OffsetDateTime::now_utc();
    let previous = device.status;
    device.status = status;
    device.last_checked = Some(now);
    device.ip_address = Some(event.address.clone());
    if status == DeviceStatus::Online {
        device.last_seen = Some(now);
    }

    match inner.store.update(&device).await {
        Ok(()) => {}
        Err(StoreError::NotFound(_)) => {
            warn!(device = %device_id, event_id = %event.event_id, "device removed before status update");
            return CheckOutcome::DeviceNotFound;
        }
        Err(e) => {
            error!(device = %device_id, event_id = %event.event_id, error = %e, "failed to persist device status");
            return CheckOutcome::StoreFailed(e.to_string());
        }
    }

    info!(device = %device_id, %previous, %status, "device status updated");

    if previous != status {
        if let Some(publisher) = &inner.publisher {
            let changed = DeviceStatusChanged::new(device_id.clone(), &event.address, previous, status);
            if let Err(e) = publisher.publish_status(&inner.dispatch, &changed).await {
                warn!(device = %device_id, error = %e, "failed to publish status change");
            }
        }
    }

    CheckOutcome::Updated { previous, status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Device;
    use crate::probe::ProbeOutcome;
    use crate::store::DeviceRegistry;
    use async_trait::async_trait;

    struct FixedChecker(bool);

    #[async_trait]
    impl HealthChecker for FixedChecker {
        async fn check_health(&self, _: &CancellationToken, _: &str) -> Result<ProbeOutcome, ProbeError> {
            if self.0 {
                Ok(ProbeOutcome {
                    attempts: 1,
                    status: 200,
                    last_attempt: Duration::ZERO,
                    snippet: String::new(),
                })
            } else {
                Err(ProbeError::Exhausted {
                    attempts: 3,
                    last: Box::new(ProbeError::UnexpectedStatus {
                        status: 503,
                        snippet: String::new(),
                    }),
                })
            }
        }
    }

    // Never answers; only returns once cancelled.
    struct StuckChecker;

    #[async_trait]
    impl HealthChecker for StuckChecker {
        async fn check_health(&self, cancel: &CancellationToken, _: &str) -> Result<ProbeOutcome, ProbeError> {
            cancel.cancelled().await;
            Err(ProbeError::Cancelled)
        }
    }

    fn config(max_concurrent: usize) -> HealthCheckConfig {
        HealthCheckConfig {
            cooldown_secs: 60,
            max_concurrent,
            ..HealthCheckConfig::default()
        }
    }

    fn mac(s: &str) -> DeviceId {
        DeviceId::parse(s).unwrap()
    }

    async fn registry_with(ids: &[&str]) -> Arc<DeviceRegistry> {
        let store = Arc::new(DeviceRegistry::in_memory());
        for id in ids {
            store.create(Device::new(mac(id), None)).await.unwrap();
        }
        store
    }

    fn event(id: &str) -> DetectionEvent {
        DetectionEvent::new(format!("evt-{id}"), mac(id), "10.0.0.7")
    }

    async fn finished(dispatch: Dispatch) -> CheckReport {
        match dispatch {
            Dispatch::Started(handle) => handle.await.unwrap(),
            Dispatch::Suppressed { .. } => panic!("check was suppressed"),
        }
    }

    #[tokio::test]
    async fn healthy_device_goes_online() {
        let store = registry_with(&["aa:bb:cc:dd:ee:ff"]).await;
        let orch = HealthCheckOrchestrator::new(&config(2), Arc::new(FixedChecker(true)), store.clone(), None);

        let report = finished(orch.on_detection_event(event("aa:bb:cc:dd:ee:ff")).unwrap()).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(
            report.outcome,
            CheckOutcome::Updated { previous: DeviceStatus::Unknown, status: DeviceStatus::Online }
        );

        let device = store.find_by_identifier(&mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.ip_address.as_deref(), Some("10.0.0.7"));
        assert!(device.last_checked.is_some());
    }

    #[tokio::test]
    async fn failed_probe_marks_offline() {
        let store = registry_with(&["aa:bb:cc:dd:ee:ff"]).await;
        let orch = HealthCheckOrchestrator::new(&config(2), Arc::new(FixedChecker(false)), store.clone(), None);

        let report = finished(orch.on_detection_event(event("aa:bb:cc:dd:ee:ff")).unwrap()).await;
        assert_eq!(report.attempts, 3);
        assert!(matches!(report.outcome, CheckOutcome::Updated { status: DeviceStatus::Offline, .. }));
    }

    #[tokio::test]
    async fn second_event_within_cooldown_is_suppressed() {
        let store = registry_with(&["aa:bb:cc:dd:ee:ff"]).await;
        let orch = HealthCheckOrchestrator::new(&config(2), Arc::new(FixedChecker(true)), store, None);

        finished(orch.on_detection_event(event("aa:bb:cc:dd:ee:ff")).unwrap()).await;
        match orch.on_detection_event(event("aa:bb:cc:dd:ee:ff")).unwrap() {
            Dispatch::Suppressed { retry_in } => assert!(retry_in <= Duration::from_secs(60)),
            Dispatch::Started(_) => panic!("expected suppression"),
        }
    }

    #[tokio::test]
    async fn unknown_device_is_reported_not_found() {
        let store = registry_with(&[]).await;
        let orch = HealthCheckOrchestrator::new(&config(2), Arc::new(FixedChecker(true)), store.clone(), None);

        let report = finished(orch.on_detection_event(event("aa:bb:cc:dd:ee:ff")).unwrap()).await;
        assert_eq!(report.outcome, CheckOutcome::DeviceNotFound);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_event_has_no_side_effect() {
        let store = registry_with(&["aa:bb:cc:dd:ee:ff"]).await;
        let orch = HealthCheckOrchestrator::new(&config(2), Arc::new(FixedChecker(true)), store, None);

        let mut bad = event("aa:bb:cc:dd:ee:ff");
        bad.address = "not an address".into();
        assert!(matches!(orch.on_detection_event(bad), Err(OrchestratorError::Invalid(_))));
        assert!(orch.cooldown().is_empty());
        assert_eq!(orch.pending(), 0);

        assert!(matches!(orch.handle_payload(b"{}"), Err(OrchestratorError::Invalid(_))));
    }

    #[tokio::test]
    async fn shutdown_cancels_stuck_checks_and_refuses_new_ones() {
        let store = registry_with(&["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]).await;
        let orch = HealthCheckOrchestrator::new(&config(1), Arc::new(StuckChecker), store.clone(), None);

        let first = orch.on_detection_event(event("aa:bb:cc:dd:ee:01")).unwrap();
        let second = orch.on_detection_event(event("aa:bb:cc:dd:ee:02")).unwrap();
        while orch.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert_eq!(orch.in_flight(), 1);
        assert_eq!(orch.pending(), 2);

        assert!(!orch.shutdown(Duration::from_millis(50)).await);

        assert_eq!(finished(first).await.outcome, CheckOutcome::Abandoned);
        assert_eq!(finished(second).await.outcome, CheckOutcome::Abandoned);
        assert_eq!(orch.in_flight(), 0);

        let device = store.find_by_identifier(&mac("aa:bb:cc:dd:ee:01")).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Unknown);

        assert!(matches!(
            orch.on_detection_event(event("aa:bb:cc:dd:ee:03")),
            Err(OrchestratorError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn repeats_are_suppressed_while_waiting_for_a_slot() {
        let store = registry_with(&["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]).await;
        let orch = HealthCheckOrchestrator::new(&config(1), Arc::new(StuckChecker), store, None);

        let busy = orch.on_detection_event(event("aa:bb:cc:dd:ee:01")).unwrap();
        while orch.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let queued = orch.on_detection_event(event("aa:bb:cc:dd:ee:02")).unwrap();
        assert!(matches!(queued, Dispatch::Started(_)));
        for _ in 0..4 {
            match orch.on_detection_event(event("aa:bb:cc:dd:ee:02")).unwrap() {
                Dispatch::Suppressed { retry_in } => assert!(retry_in > Duration::ZERO),
                Dispatch::Started(_) => panic!("repeat detection started a second check"),
            }
        }
        assert_eq!(orch.pending(), 2);
        assert_eq!(orch.cooldown().period(), Duration::from_secs(60));

        orch.shutdown(Duration::from_millis(10)).await;
        assert_eq!(finished(busy).await.outcome, CheckOutcome::Abandoned);
        assert_eq!(finished(queued).await.outcome, CheckOutcome::Abandoned);
    }

    #[tokio::test]
    async fn shutdown_with_nothing_pending_drains_immediately() {
        let store = registry_with(&[]).await;
        let orch = HealthCheckOrchestrator::new(&config(1), Arc::new(FixedChecker(true)), store, None);
        orch.start_cleanup(&CancellationToken::new());
        assert!(orch.shutdown(Duration::from_secs(1)).await);
        orch.stop_cleanup();
    }
}
