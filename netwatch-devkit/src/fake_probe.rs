/*!
Fake health checker with concurrency instrumentation.

Each call sleeps for a fixed delay (cancellable) and then reports the
configured result. The checker tracks how many calls overlap so tests can
assert the orchestrator's concurrency bound.
*/

use async_trait::async_trait;
use netwatch_kernel::probe::{HealthChecker, ProbeError, ProbeOutcome};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct InstrumentedChecker {
    delay: Duration,
    offline: Mutex<HashSet<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InstrumentedChecker {
    /// Every address answers after `delay` unless marked offline.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            offline: Mutex::new(HashSet::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_offline(&self, address: &str) {
        self.offline.lock().insert(address.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthChecker for InstrumentedChecker {
    async fn check_health(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> Result<ProbeOutcome, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.current);
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        if self.offline.lock().contains(address) {
            return Err(ProbeError::Exhausted {
                attempts: 1,
                last: Box::new(ProbeError::UnexpectedStatus {
                    status: 503,
                    snippet: String::new(),
                }),
            });
        }
        Ok(ProbeOutcome {
            attempts: 1,
            status: 200,
            last_attempt: self.delay,
            snippet: String::new(),
        })
    }
}
