//! Health checker
//!
//! Polls a service's probe command until it succeeds, fails `retries` times
//! in a row, or the overall ceiling passes. Failures during the start period
//! are not counted, and the ceiling is measured after the start period.

use crate::cancel::CancelToken;
use crate::compose::config::HealthCheckSpec;
use crate::error::{Result, WardenError};
use crate::runtime::{LaunchSpec, Runtime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in for "never" when a configured wait does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Outcome of waiting for a service to become healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthResult {
    /// A probe succeeded
    Healthy,
    /// `retries` consecutive probes failed
    Unhealthy,
    /// The ceiling passed without a success
    TimedOut,
}

impl std::fmt::Display for HealthResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthResult::Healthy => write!(f, "healthy"),
            HealthResult::Unhealthy => write!(f, "unhealthy"),
            HealthResult::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Health checker
#[derive(Clone)]
pub struct HealthChecker {
    runtime: Arc<dyn Runtime>,
}

impl HealthChecker {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self { runtime }
    }

    /// Wait until the service is healthy, unhealthy, or out of time
    ///
    /// With no check configured the service is trusted as soon as it starts.
    pub async fn wait_healthy(
        &self,
        launch: &LaunchSpec,
        check: Option<&HealthCheckSpec>,
        cancel: &mut CancelToken,
    ) -> Result<HealthResult> {
        let Some(check) = check else {
            return Ok(HealthResult::Healthy);
        };

        let interval = check.effective_interval();
        let probe_timeout = check.effective_timeout();
        let retries = check.effective_retries();
        let ceiling = check.effective_ceiling();
        let grace_end = instant_after(Instant::now(), check.effective_start_period());
        let deadline = instant_after(grace_end, ceiling);

        let mut failures = 0u32;
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("{} not healthy within {:?}", launch.service, ceiling);
                return Ok(HealthResult::TimedOut);
            }

            // A probe never outlives the ceiling
            let probe_deadline = instant_after(now, probe_timeout).min(deadline);
            let probe = tokio::time::timeout_at(
                probe_deadline,
                self.runtime.probe(launch, &check.command),
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WardenError::Cancelled),
                outcome = probe => outcome,
            };

            match outcome {
                Ok(Ok(true)) => {
                    tracing::debug!("{} probe succeeded", launch.service);
                    return Ok(HealthResult::Healthy);
                }
                Ok(Ok(false)) => {
                    tracing::debug!("{} probe failed", launch.service);
                }
                Ok(Err(e)) => {
                    tracing::debug!("{} probe errored: {}", launch.service, e);
                }
                Err(_) if Instant::now() >= deadline => continue,
                Err(_) => {
                    tracing::debug!(
                        "{} probe timed out after {:?}",
                        launch.service,
                        probe_timeout
                    );
                }
            }

            if Instant::now() >= grace_end {
                failures += 1;
                if failures >= retries {
                    tracing::warn!(
                        "{} unhealthy after {} consecutive failed probes",
                        launch.service,
                        failures
                    );
                    return Ok(HealthResult::Unhealthy);
                }
            }

            let wake = instant_after(Instant::now(), interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WardenError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

/// `base + duration`, saturating far in the future instead of overflowing
fn instant_after(base: Instant, duration: Duration) -> Instant {
    base.checked_add(duration)
        .unwrap_or_else(|| base + FAR_FUTURE)
}
