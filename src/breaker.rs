//! Circuit breaker and retry fabric shared across every external I/O
//! boundary (store queries, bulk inserts, health probes, monitored-tree
//! file reads). See spec §4.1.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: State,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub success_count: u32,
}

struct Inner {
    state: State,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// A single protected call site. One `CircuitBreaker` is created per
/// downstream dependency (store, telemetry collector, a monitored file
/// tree) and reused across every call against it.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_success_required: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            half_open_success_required: 3,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
            success_count: inner.success_count,
        }
    }

    /// Whether a call may proceed right now, flipping `Open` → `HalfOpen`
    /// when the recovery timeout has elapsed.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    inner.state = State::HalfOpen;
                    inner.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.failure_count = 0;
            }
            State::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.half_open_success_required {
                    inner.state = State::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            State::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = State::Open;
                    inner.last_failure_time = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.success_count = 0;
            }
            State::Open => {}
        }
    }

    /// Run `f` through the breaker. Rejects immediately with
    /// `Error::Transient` tagged `CircuitOpen` when the breaker is open.
    #[instrument(skip(self, f), fields(breaker = %self.name))]
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        if !self.admit() {
            return Err(Error::Transient(format!(
                "CircuitOpen: breaker '{}' is open",
                self.name
            )));
        }
        match f().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                self.on_failure();
                if matches!(self.snapshot().state, State::Open) {
                    warn!(breaker = %self.name, "breaker tripped open");
                }
                Err(e)
            }
        }
    }
}

/// Exponential backoff retry policy, applied only to transient failures.
/// 4xx/validation errors propagate immediately without retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let scaled = self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        std::cmp::min(scaled, self.max_backoff)
    }

    /// Runs `f` through `breaker`, retrying on transient failure with
    /// exponential backoff. The breaker wraps the call; the retry policy
    /// wraps the breaker, so a retry after backoff re-checks breaker state.
    pub async fn call<F, Fut, T>(&self, breaker: &CircuitBreaker, mut f: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;
        loop {
            let result = breaker.call(|| f()).await;
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff_for(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn opens_after_n_consecutive_failures() {
        let b = CircuitBreaker::new("test", 3, Duration::from_millis(50));
        for _ in 0..3 {
            let _ = b
                .call(|| async { Err::<(), _>(Error::Transient("boom".into())) })
                .await;
        }
        assert_eq!(b.snapshot().state, State::Open);

        let err = b
            .call(|| async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(msg) if msg.contains("CircuitOpen")));
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout_then_closes_after_three_successes() {
        let b = CircuitBreaker::new("test", 2, Duration::from_millis(20));
        for _ in 0..2 {
            let _ = b
                .call(|| async { Err::<(), _>(Error::Transient("boom".into())) })
                .await;
        }
        assert_eq!(b.snapshot().state, State::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        for _ in 0..3 {
            b.call(|| async { Ok::<_, Error>(()) }).await.unwrap();
        }
        assert_eq!(b.snapshot().state, State::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let b = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        let _ = b
            .call(|| async { Err::<(), _>(Error::Transient("boom".into())) })
            .await;
        assert_eq!(b.snapshot().state, State::Open);
        tokio::time::sleep(Duration::from_millis(15)).await;

        let _ = b
            .call(|| async { Err::<(), _>(Error::Transient("boom again".into())) })
            .await;
        assert_eq!(b.snapshot().state, State::Open);
    }

    #[tokio::test]
    async fn permanent_errors_never_retried() {
        let b = CircuitBreaker::new("test", 5, Duration::from_secs(1));
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result = policy
            .call(&b, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Permanent("bad request".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_retried_up_to_max_attempts() {
        let b = CircuitBreaker::new("test", 10, Duration::from_secs(1));
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let result: Result<(), Error> = policy
            .call(&b, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Transient("boom".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
