//! Health monitoring (spec §4.6.4), grounded on `doctor::run`'s battery of
//! independent pass/fail checks, generalized into periodic response-time
//! banded polling feeding a per-service `CircuitBreaker`.

use std::time::Duration;

use tracing::warn;

use crate::breaker::{CircuitBreaker, State};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSample {
    Healthy,
    Degraded,
    Failing,
    Unknown,
}

/// Classifies a probe result by response-time bands: `< healthy_ms` is
/// healthy, `< 2 * healthy_ms` is degraded, else failing. A probe error
/// (rather than a slow success) is always failing.
pub fn classify(result: &Result<(), Error>, elapsed: Duration, healthy_threshold: Duration) -> HealthSample {
    if result.is_err() {
        return HealthSample::Failing;
    }
    if elapsed < healthy_threshold {
        HealthSample::Healthy
    } else if elapsed < healthy_threshold * 2 {
        HealthSample::Degraded
    } else {
        HealthSample::Failing
    }
}

/// One health-monitored service: a name, the breaker gating its restarts,
/// and the response-time band it's judged against.
pub struct MonitoredService {
    pub name: String,
    pub breaker: CircuitBreaker,
    pub healthy_threshold: Duration,
}

impl MonitoredService {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration, healthy_threshold: Duration) -> Self {
        let name = name.into();
        Self { breaker: CircuitBreaker::new(name.clone(), failure_threshold, recovery_timeout), name, healthy_threshold }
    }

    /// Runs one probe cycle. `probe` performs the actual cheap health
    /// check (e.g. an HTTP GET against the service's own health route).
    pub async fn poll<F, Fut>(&self, probe: F) -> HealthSample
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
    {
        let started = std::time::Instant::now();
        let result = self.breaker.call(probe).await;
        let elapsed = started.elapsed();
        let sample = classify(&result, elapsed, self.healthy_threshold);
        if sample == HealthSample::Failing && self.breaker.snapshot().state == State::Open {
            warn!(service = %self.name, "service escalated to terminal failing state");
        }
        sample
    }

    pub fn is_terminal(&self) -> bool {
        self.breaker.snapshot().state == State::Open
    }
}
