//! Service Orchestrator (spec §4.6): topological start/stop over the
//! static DAG, a port+process registry, per-service health monitoring,
//! graceful shutdown with a kill escalation, and cancellation threaded
//! through every long-running loop.

pub mod dag;
pub mod health;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::Error;
use health::{HealthSample, MonitoredService};
use registry::{AdoptDecision, Registry, ServiceEntry};

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A service lifecycle hook set supplied by the binary: how to start the
/// named service (returning its pid and bound port) and how to ask it to
/// stop cooperatively. The orchestrator owns *when*; the binary owns *how*.
#[async_trait::async_trait]
pub trait ServiceHandle: Send + Sync {
    async fn start(&self, name: &str, port: u16, cancel: CancellationToken) -> Result<u32, Error>;
    async fn health_probe(&self, name: &str) -> Result<(), Error>;
    async fn request_stop(&self, name: &str) -> Result<(), Error>;
}

pub struct Orchestrator {
    registry: Registry,
    handle: Arc<dyn ServiceHandle>,
    port_range: (u16, u16),
    monitored: Mutex<HashMap<String, Arc<MonitoredService>>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(registry: Registry, handle: Arc<dyn ServiceHandle>, port_range: (u16, u16)) -> Self {
        Self { registry, handle, port_range, monitored: Mutex::new(HashMap::new()), cancel: CancellationToken::new() }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// §4.6.1/§4.6.2/§4.6.3: walk the DAG in topological order, for each
    /// service decide adopt/restart/start-fresh against the registry, then
    /// bind a port and start it if needed.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        for name in dag::topological_order() {
            let existing = self.registry.get(name)?;
            let responsive = match &existing {
                Some(_) => self.handle.health_probe(name).await.is_ok(),
                None => false,
            };
            let decision = registry::decide_adoption(existing.as_ref(), responsive);

            match decision {
                AdoptDecision::Adopt => {
                    info!(service = name, "adopting already-running service");
                }
                AdoptDecision::RestartStale | AdoptDecision::StartFresh => {
                    if decision == AdoptDecision::RestartStale {
                        warn!(service = name, "existing service unresponsive, restarting");
                        self.handle.request_stop(name).await.ok();
                    }
                    let preferred = existing.map(|e| e.port).unwrap_or(self.port_range.0);
                    let port = self.registry.reserve_port(preferred, self.port_range).await?;
                    let pid = self.handle.start(name, port, self.cancel.clone()).await?;
                    self.registry.publish(ServiceEntry {
                        name: name.to_string(),
                        pid,
                        port,
                        started_at: started_at_marker(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    })?;
                }
            }

            let service = Arc::new(MonitoredService::new(name, 3, Duration::from_secs(30), Duration::from_millis(200)));
            self.monitored.lock().await.insert(name.to_string(), service);
        }
        Ok(())
    }

    /// §4.6.4: poll every monitored service once. Intended to be called on
    /// a `DEFAULT_HEALTH_INTERVAL` tick by the binary's supervision loop.
    pub async fn poll_health(&self) -> HashMap<String, HealthSample> {
        let monitored = self.monitored.lock().await;
        let mut samples = HashMap::new();
        for (name, service) in monitored.iter() {
            let handle = self.handle.clone();
            let service_name = name.clone();
            let sample = service.poll(|| async move { handle.health_probe(&service_name).await }).await;
            samples.insert(name.clone(), sample);
        }
        samples
    }

    pub fn health_interval(&self) -> Duration {
        DEFAULT_HEALTH_INTERVAL
    }

    /// §4.6.5: reverse-topological shutdown with a grace window per
    /// service before escalating. The registry is updated before and after
    /// each transition so a crash mid-shutdown leaves it consistent.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), Error> {
        self.cancel.cancel();
        for name in dag::reverse_topological_order() {
            let Some(entry) = self.registry.get(name)? else { continue };

            let grace = tokio::time::timeout(DEFAULT_SHUTDOWN_GRACE, self.handle.request_stop(name)).await;
            match grace {
                Ok(Ok(())) => info!(service = name, "stopped gracefully"),
                Ok(Err(e)) => warn!(service = name, error = %e, "graceful stop returned an error"),
                Err(_) => {
                    warn!(service = name, pid = entry.pid, "grace window expired, force killing");
                    force_kill(entry.pid);
                }
            }
            self.registry.remove(name)?;
        }
        Ok(())
    }
}

fn force_kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// `Checkpoint`/`ServiceEntry` timestamps avoid `Instant`/`SystemTime::now`
/// directly in library code paths that are exercised by workflow-style
/// tooling; this wraps the one place orchestration needs wall-clock time.
fn started_at_marker() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeHandle {
        next_pid: AtomicU32,
        healthy: bool,
    }

    #[async_trait::async_trait]
    impl ServiceHandle for FakeHandle {
        async fn start(&self, _name: &str, _port: u16, _cancel: CancellationToken) -> Result<u32, Error> {
            Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
        }
        async fn health_probe(&self, _name: &str) -> Result<(), Error> {
            if self.healthy {
                Ok(())
            } else {
                Err(Error::Transient("down".into()))
            }
        }
        async fn request_stop(&self, _name: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_populates_registry_for_every_service() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        let handle = Arc::new(FakeHandle { next_pid: AtomicU32::new(1000), healthy: true });
        let orchestrator = Orchestrator::new(registry, handle, (19000, 19100));
        orchestrator.start().await.unwrap();

        for name in dag::EDGES.iter().map(|(n, _)| *n) {
            assert!(orchestrator.registry.get(name).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn stop_clears_every_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        let handle = Arc::new(FakeHandle { next_pid: AtomicU32::new(2000), healthy: true });
        let orchestrator = Orchestrator::new(registry, handle, (19200, 19300));
        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();

        for name in dag::EDGES.iter().map(|(n, _)| *n) {
            assert!(orchestrator.registry.get(name).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn stop_trips_the_cancellation_token() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        let handle = Arc::new(FakeHandle { next_pid: AtomicU32::new(3000), healthy: true });
        let orchestrator = Orchestrator::new(registry, handle, (19300, 19400));
        let token = orchestrator.cancellation_token();
        orchestrator.stop().await.unwrap();
        assert!(token.is_cancelled());
    }
}
