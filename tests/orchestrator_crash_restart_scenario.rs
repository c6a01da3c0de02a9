//! Cross-module scenario: a service that crashed between orchestrator
//! restarts (registry entry present, pid no longer alive) is detected and
//! started fresh rather than either adopted or endlessly restarted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use context_cleaner_core::error::Error;
use context_cleaner_core::orchestrator::dag;
use context_cleaner_core::orchestrator::registry::{Registry, ServiceEntry};
use context_cleaner_core::orchestrator::{Orchestrator, ServiceHandle};
use tokio_util::sync::CancellationToken;

struct RecordingHandle {
    next_pid: AtomicU32,
    starts: std::sync::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ServiceHandle for RecordingHandle {
    async fn start(&self, name: &str, _port: u16, _cancel: CancellationToken) -> Result<u32, Error> {
        self.starts.lock().unwrap().push(name.to_string());
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
    async fn health_probe(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }
    async fn request_stop(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// Spawns and immediately reaps a child so its pid is guaranteed dead,
/// the same technique `orchestrator::registry`'s own tests use.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait for true to exit");
    pid
}

#[tokio::test]
async fn a_service_left_with_a_dead_pid_is_restarted_fresh_not_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("registry.json");

    // Simulate a prior process that crashed: every service has a registry
    // entry, but the ingest worker's pid no longer refers to a live process.
    let registry = Registry::new(registry_path.clone());
    for name in dag::topological_order() {
        let pid = if name == dag::INGEST_WORKER { dead_pid() } else { std::process::id() };
        registry
            .publish(ServiceEntry { name: name.to_string(), pid, port: 19500, started_at: 0, version: "0.1.0".to_string() })
            .unwrap();
    }

    let handle = Arc::new(RecordingHandle { next_pid: AtomicU32::new(20000), starts: std::sync::Mutex::new(Vec::new()) });
    let orchestrator = Orchestrator::new(Registry::new(registry_path.clone()), handle.clone(), (19500, 19600));
    orchestrator.start().await.unwrap();

    let starts = handle.starts.lock().unwrap();
    assert!(starts.contains(&dag::INGEST_WORKER.to_string()), "the service with a dead pid must be restarted");
    assert!(!starts.contains(&dag::STORE.to_string()), "services with a live pid should be adopted, not restarted");

    let entry = Registry::new(registry_path).get(dag::INGEST_WORKER).unwrap().unwrap();
    assert_ne!(entry.pid, 0);
    assert!(context_cleaner_core::orchestrator::registry::process_alive(entry.pid));
}
