//! Dynamic DNS heartbeat with exponential backoff
//!
//! Each cycle probes the host's public address and, if it differs from the last
//! address successfully published, pushes it to the dynamic DNS update endpoint.
//! The loop owns a [`RetryState`] and advances it after every cycle:
//!
//! - unchanged address: nothing is sent, next cycle after `min_delay`
//! - publish succeeded: failures reset, the new address is remembered
//! - probe or publish failed: failures grow, the last published address is kept, and
//!   the next cycle waits `clamp((2^failures - 1) × 500ms, min_delay, max_delay)`
//!
//! Failures never end the loop; only the cancellation token does.

use crate::config::HeartbeatConfig;
use crate::error::{Error, Result};
use crate::types::Event;
use async_trait::async_trait;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Backoff step unit
const BACKOFF_UNIT_MS: u64 = 500;

/// Exponential backoff delay for `failures` consecutive failures
///
/// `(2^failures - 1) × 500ms`, clamped to `[min, max]`. Saturates instead of
/// overflowing for large failure counts.
pub fn calculate_backoff(failures: u32, min: Duration, max: Duration) -> Duration {
    let steps = 2u64
        .checked_pow(failures)
        .map(|p| p - 1)
        .unwrap_or(u64::MAX);
    let raw = Duration::from_millis(steps.saturating_mul(BACKOFF_UNIT_MS));
    raw.max(min).min(max)
}

/// Heartbeat retry state, mutated only by the heartbeat loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    last_published: Option<String>,
    failures: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl RetryState {
    /// Fresh state: nothing published yet, no failures
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            last_published: None,
            failures: 0,
            min_delay,
            max_delay,
        }
    }

    /// Last address the DNS endpoint accepted
    pub fn last_published(&self) -> Option<&str> {
        self.last_published.as_deref()
    }

    /// Consecutive failed cycles
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether `address` is already published
    pub fn is_current(&self, address: &str) -> bool {
        self.last_published.as_deref() == Some(address)
    }

    /// Record an accepted publish; returns the next delay
    pub fn record_success(&mut self, address: String) -> Duration {
        self.failures = 0;
        self.last_published = Some(address);
        self.min_delay
    }

    /// Record a cycle that found nothing to publish; returns the next delay
    pub fn record_unchanged(&self) -> Duration {
        self.min_delay
    }

    /// Record a failed cycle; returns the next delay
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        calculate_backoff(self.failures, self.min_delay, self.max_delay)
    }
}

/// Public address probe and DNS record update
#[async_trait]
pub trait DynamicDns: Send + Sync {
    /// Resolve the host's current public address
    async fn current_address(&self) -> Result<String>;

    /// Point the DNS record at `address`
    async fn publish(&self, address: &str) -> Result<()>;
}

/// HTTP client for the address probe and the DNS update endpoint
pub struct DdnsClient {
    http: reqwest::Client,
    address_probe_url: String,
    update_url: String,
    host: String,
    domain: String,
    password: String,
}

impl DdnsClient {
    /// Build a client from heartbeat configuration
    pub fn new(config: &HeartbeatConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            address_probe_url: config.address_probe_url.clone(),
            update_url: config.update_url.clone(),
            host: config.host.clone(),
            domain: config.domain.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl DynamicDns for DdnsClient {
    async fn current_address(&self) -> Result<String> {
        let body = self
            .http
            .get(&self.address_probe_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(redact)?
            .text()
            .await
            .map_err(redact)?;

        let candidate = body.trim();
        candidate
            .parse::<IpAddr>()
            .map(|ip| ip.to_string())
            .map_err(|_| Error::Publish(format!("address probe returned {:?}", candidate)))
    }

    async fn publish(&self, address: &str) -> Result<()> {
        let body = self
            .http
            .get(&self.update_url)
            .query(&[
                ("host", self.host.as_str()),
                ("domain", self.domain.as_str()),
                ("password", self.password.as_str()),
                ("ip", address),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(redact)?
            .text()
            .await
            .map_err(redact)?;

        parse_update_response(&body)
    }
}

/// Drop the request URL from a transport error; the update query carries the password
fn redact(error: reqwest::Error) -> Error {
    Error::Network(error.without_url())
}

/// Check the XML update response for a zero error count
pub fn parse_update_response(body: &str) -> Result<()> {
    let count_re = Regex::new(r"<ErrCount>\s*(\d+)\s*</ErrCount>")
        .map_err(|e| Error::Other(e.to_string()))?;

    let count: u32 = count_re
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| Error::Publish("update response has no ErrCount".to_string()))?;

    if count == 0 {
        return Ok(());
    }

    let first_error = Regex::new(r"(?s)<Err1>(.*?)</Err1>")
        .ok()
        .and_then(|re| re.captures(body))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "no detail".to_string());

    Err(Error::Publish(format!(
        "update endpoint reported {} error(s): {}",
        count, first_error
    )))
}

/// Result of one heartbeat cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A changed address was published
    Published(String),
    /// Address matches the last published one
    Unchanged(String),
    /// Probe or publish failed
    Failed(String),
}

/// Keeps the DNS record pointed at the host's public address
pub struct HeartbeatUpdater {
    dns: Arc<dyn DynamicDns>,
    event_tx: broadcast::Sender<Event>,
    min_delay: Duration,
    max_delay: Duration,
}

impl HeartbeatUpdater {
    /// Create an updater with the backoff bounds from `config`
    pub fn new(
        dns: Arc<dyn DynamicDns>,
        config: &HeartbeatConfig,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            dns,
            event_tx,
            min_delay: config.min_delay,
            max_delay: config.max_delay,
        }
    }

    /// State the loop starts from
    pub fn initial_state(&self) -> RetryState {
        RetryState::new(self.min_delay, self.max_delay)
    }

    /// Run one probe/publish cycle, advance `state`, and return the delay before the next
    pub async fn run_cycle(&self, state: &mut RetryState) -> (CycleOutcome, Duration) {
        let address = match self.dns.current_address().await {
            Ok(a) => a,
            Err(e) => return self.fail(state, e),
        };

        if state.is_current(&address) {
            tracing::debug!(%address, "public address unchanged");
            self.event_tx
                .send(Event::HeartbeatSkipped {
                    address: address.clone(),
                })
                .ok();
            return (CycleOutcome::Unchanged(address), state.record_unchanged());
        }

        match self.dns.publish(&address).await {
            Ok(()) => {
                tracing::info!(
                    %address,
                    previous = state.last_published().unwrap_or("none"),
                    "published new address"
                );
                self.event_tx
                    .send(Event::HeartbeatPublished {
                        address: address.clone(),
                    })
                    .ok();
                let delay = state.record_success(address.clone());
                (CycleOutcome::Published(address), delay)
            }
            Err(e) => self.fail(state, e),
        }
    }

    fn fail(&self, state: &mut RetryState, error: Error) -> (CycleOutcome, Duration) {
        let delay = state.record_failure();
        tracing::warn!(
            failures = state.failures(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "heartbeat cycle failed"
        );
        self.event_tx
            .send(Event::HeartbeatFailed {
                failures: state.failures(),
                retry_in_ms: delay.as_millis() as u64,
                error: error.to_string(),
            })
            .ok();
        (CycleOutcome::Failed(error.to_string()), delay)
    }

    /// Cycle forever, sleeping between cycles, until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            min_delay_ms = self.min_delay.as_millis() as u64,
            max_delay_ms = self.max_delay.as_millis() as u64,
            "heartbeat started"
        );

        let mut state = self.initial_state();
        loop {
            let delay = tokio::select! {
                (_, delay) = self.run_cycle(&mut state) => delay,
                _ = cancel.cancelled() => break,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("heartbeat stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }
}
