//! Service readiness polling for the memvault coordinators
//!
//! This crate provides the health gate used by both the backup and restore
//! coordinators: a polling primitive that blocks until a caller-supplied,
//! read-only probe succeeds once, or a bounded timeout elapses.
//!
//! Polling is fixed-interval by design. The services this gate waits on
//! (database and graph engines) become ready within a bounded warm-up window,
//! so exponential backoff buys nothing and only delays detection.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transient health of a single service while a coordinator is running.
///
/// This state is never persisted; it exists only to gate adapter calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Probing,
    Healthy,
    Unhealthy,
}

/// A single failed probe attempt.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ProbeFailure {
    pub message: String,
}

impl ProbeFailure {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The gate gave up: the probe never succeeded within the timeout.
#[derive(Error, Debug)]
#[error("service '{service}' not healthy after {elapsed:.1?} ({attempts} attempts, last failure: {last_failure})")]
pub struct HealthTimeout {
    pub service: String,
    pub elapsed: Duration,
    pub attempts: u32,
    pub last_failure: String,
}

/// A read-only readiness check for one service.
///
/// Implementations must not mutate the service they probe; the gate may call
/// `check` any number of times.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Name of the service this probe targets, used in errors and logs.
    fn service(&self) -> &str;

    /// Run the probe once.
    async fn check(&self) -> Result<(), ProbeFailure>;
}

/// Timeout and poll interval for one gate invocation.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Short policy for probes against services expected to already be up.
    pub fn fast() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_millis(500))
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(2))
    }
}

/// Block until `probe` succeeds once, retrying at `policy.interval`.
///
/// Returns `Ok(())` on the first successful probe. Returns a typed
/// [`HealthTimeout`] once `policy.timeout` has elapsed, so callers can decide
/// whether to abort or continue in degraded mode.
pub async fn wait_until_healthy(
    probe: &dyn HealthProbe,
    policy: PollPolicy,
) -> Result<(), HealthTimeout> {
    let start = Instant::now();
    let mut attempts: u32 = 0;
    let mut last_failure = String::from("probe never ran");

    loop {
        attempts += 1;
        debug!(
            service = probe.service(),
            attempt = attempts,
            state = ?HealthState::Probing,
            "probing service"
        );

        match probe.check().await {
            Ok(()) => {
                debug!(
                    service = probe.service(),
                    attempts,
                    elapsed = ?start.elapsed(),
                    state = ?HealthState::Healthy,
                    "service healthy"
                );
                return Ok(());
            }
            Err(failure) => {
                last_failure = failure.message;
                debug!(
                    service = probe.service(),
                    attempt = attempts,
                    state = ?HealthState::Unhealthy,
                    failure = %last_failure,
                    "probe failed"
                );
            }
        }

        if start.elapsed() + policy.interval > policy.timeout {
            warn!(
                service = probe.service(),
                attempts,
                "giving up waiting for service"
            );
            return Err(HealthTimeout {
                service: probe.service().to_string(),
                elapsed: start.elapsed(),
                attempts,
                last_failure,
            });
        }

        tokio::time::sleep(policy.interval).await;
    }
}
