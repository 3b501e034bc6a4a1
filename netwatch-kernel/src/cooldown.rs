//! Per-device probe cooldown.
//!
//! The cache remembers when each device was last probed so that a burst of
//! detections for the same device results in a single health check. Entries
//! older than twice the cooldown period are swept by [`CooldownSweeper`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::DeviceId;

#[derive(Debug)]
pub struct CooldownCache {
    period: Duration,
    entries: RwLock<HashMap<DeviceId, Instant>>,
}

impl CooldownCache {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// True when the device was never probed or its cooldown has elapsed.
    pub fn can_check(&self, id: &DeviceId) -> bool {
        match self.entries.read().get(id) {
            Some(last) => Instant::now().saturating_duration_since(*last) >= self.period,
            None => true,
        }
    }

    /// Records a probe attempt now, overwriting any previous timestamp.
    pub fn mark_checked(&self, id: &DeviceId) {
        self.entries.write().insert(id.clone(), Instant::now());
    }

    pub fn time_until_next_check(&self, id: &DeviceId) -> Duration {
        match self.entries.read().get(id) {
            Some(last) => self
                .period
                .saturating_sub(Instant::now().saturating_duration_since(*last)),
            None => Duration::ZERO,
        }
    }

    /// Drops entries last checked more than `2 × period` ago. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let max_age = self.period.checked_mul(2).unwrap_or(Duration::MAX);
        let now = Instant::now();

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, last| now.saturating_duration_since(*last) <= max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Background task that periodically calls [`CooldownCache::cleanup`].
///
/// `start` only has an effect the first time it is called; `stop` may be
/// called any number of times, before or after `start`.
pub struct CooldownSweeper {
    cache: Arc<CooldownCache>,
    interval: Duration,
    started: AtomicBool,
    stop: CancellationToken,
}

impl CooldownSweeper {
    pub fn new(cache: Arc<CooldownCache>, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }

    /// Spawns the sweep loop. It exits when `shutdown` or [`stop`](Self::stop) fires.
    pub fn start(&self, shutdown: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("cooldown sweeper already running");
            return;
        }

        let cache = self.cache.clone();
        let interval = self.interval;
        let stop = self.stop.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.cleanup();
                        debug!(removed, remaining = cache.len(), "cooldown sweep");
                    }
                }
            }
            debug!("cooldown sweeper stopped");
        });
    }

    pub fn stop(&self) {
        if self.started.load(Ordering::SeqCst) {
            self.stop.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stop.is_cancelled()
    }
}
