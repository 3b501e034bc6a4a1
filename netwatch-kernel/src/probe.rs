//! HTTP reachability probes.
//!
//! [`HealthProbe`] performs one `GET http://{address}/whoami` and reads at most
//! [`MAX_BODY_BYTES`] of the answer. [`RetryingHealthProbe`] wraps it with a
//! bounded number of attempts and exponential backoff, and is the
//! [`HealthChecker`] the orchestrator uses.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HealthCheckConfig;

pub const WHOAMI_PATH: &str = "/whoami";

/// Upper bound on how much of a device's response body is ever buffered.
pub const MAX_BODY_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe address '{0}'")]
    InvalidAddress(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected HTTP status {status}")]
    UnexpectedStatus { status: u16, snippet: String },
    #[error("probe cancelled")]
    Cancelled,
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("device unreachable after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: Box<ProbeError> },
}

impl ProbeError {
    /// The error of the final attempt when retries were exhausted, otherwise `self`.
    pub fn last(&self) -> &ProbeError {
        match self {
            ProbeError::Exhausted { last, .. } => last,
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled)
    }
}

/// Raw result of a single HTTP attempt.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    /// First bytes of the body, lossily decoded.
    pub snippet: String,
    pub elapsed: Duration,
}

impl ProbeResponse {
    /// Only a plain 200 counts; redirects are not followed and count as failure.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Summary of a successful health check.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub attempts: u32,
    pub status: u16,
    /// Duration of the attempt that succeeded.
    pub last_attempt: Duration,
    pub snippet: String,
}

/// Anything able to tell whether the device behind `address` is alive.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check_health(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> Result<ProbeOutcome, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("netwatch-kernel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ProbeError::Client)?;
        Ok(Self { client, timeout })
    }

    pub fn url_for(address: &str) -> Result<reqwest::Url, ProbeError> {
        let address = address.trim();
        if address.is_empty() || address.contains(&['/', '?', '#', '@'][..]) {
            return Err(ProbeError::InvalidAddress(address.to_string()));
        }
        let url = reqwest::Url::parse(&format!("http://{address}{WHOAMI_PATH}"))
            .map_err(|_| ProbeError::InvalidAddress(address.to_string()))?;
        if url.host_str().is_none() || url.path() != WHOAMI_PATH {
            return Err(ProbeError::InvalidAddress(address.to_string()));
        }
        Ok(url)
    }

    /// One GET attempt. Non-200 statuses are returned as a response, not an error.
    pub async fn probe(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> Result<ProbeResponse, ProbeError> {
        let url = Self::url_for(address)?;
        let started = Instant::now();

        let (status, snippet) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            res = self.fetch(url) => res?,
        };

        Ok(ProbeResponse {
            status,
            snippet,
            elapsed: started.elapsed(),
        })
    }

    async fn fetch(&self, url: reqwest::Url) -> Result<(u16, String), ProbeError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = resp.status().as_u16();

        // The response (and its connection) is released when `resp` drops,
        // including when the cap is hit before the end of the body.
        let mut body = Vec::with_capacity(512);
        while body.len() < MAX_BODY_BYTES {
            match resp.chunk().await.map_err(|e| self.classify(e))? {
                Some(chunk) => {
                    let take = chunk.len().min(MAX_BODY_BYTES - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }

        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    }

    fn classify(&self, err: reqwest::Error) -> ProbeError {
        if err.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else {
            ProbeError::Transport(err)
        }
    }
}

/// Attempt count and exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay,
        }
    }

    /// Sleeps between consecutive attempts: `attempts - 1` values, doubling each time.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let mut delay = self.initial_delay;
        (1..self.attempts).map(move |_| {
            let current = delay;
            delay = delay.saturating_mul(2);
            current
        })
    }
}

pub struct RetryingHealthProbe {
    probe: HealthProbe,
    policy: RetryPolicy,
}

impl RetryingHealthProbe {
    pub fn new(probe: HealthProbe, policy: RetryPolicy) -> Self {
        Self { probe, policy }
    }

    pub fn from_config(cfg: &HealthCheckConfig) -> Result<Self, ProbeError> {
        let probe = HealthProbe::new(cfg.request_timeout())?;
        Ok(Self::new(
            probe,
            RetryPolicy::new(cfg.retry_attempts, cfg.initial_backoff()),
        ))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl HealthChecker for RetryingHealthProbe {
    async fn check_health(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> Result<ProbeOutcome, ProbeError> {
        let mut delays = self.policy.backoff();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            attempt += 1;

            let err = match self.probe.probe(cancel, address).await {
                Ok(resp) if resp.is_success() => {
                    debug!(%address, attempt, elapsed_ms = resp.elapsed.as_millis() as u64, "device answered");
                    return Ok(ProbeOutcome {
                        attempts: attempt,
                        status: resp.status,
                        last_attempt: resp.elapsed,
                        snippet: resp.snippet,
                    });
                }
                Ok(resp) => ProbeError::UnexpectedStatus {
                    status: resp.status,
                    snippet: resp.snippet,
                },
                Err(ProbeError::Cancelled) => return Err(ProbeError::Cancelled),
                Err(e) => e,
            };

            let Some(delay) = delays.next() else {
                warn!(%address, attempts = attempt, error = %err, "health probe failed, giving up");
                return Err(ProbeError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            };

            debug!(
                %address,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "health probe failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
