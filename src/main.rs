use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use context_cleaner_core::bridge::{Bridge, RateLimiter};
use context_cleaner_core::config::Config;
use context_cleaner_core::crypto::{self, EncryptionKey};
use context_cleaner_core::dashboard_api::{self, ApiState};
use context_cleaner_core::error::Error;
use context_cleaner_core::ingest::pipeline::{spawn_watcher, tail_file};
use context_cleaner_core::ingest::{discover, CursorStore, IngestPipeline, PathGuard};
use context_cleaner_core::migration::{CheckpointStore, MigrationEngine};
use context_cleaner_core::orchestrator::dag;
use context_cleaner_core::orchestrator::registry::Registry;
use context_cleaner_core::orchestrator::{Orchestrator, ServiceHandle};
use context_cleaner_core::store::{Client, HttpStore};
use context_cleaner_core::telemetry;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let exit_code = match args.first().map(String::as_str) {
        Some("orchestrator") => run_orchestrator(&args[1..]).await,
        Some("migrate") => run_migrate(&args[1..]).await,
        Some("doctor") => run_doctor().await,
        _ => {
            eprintln!("context-cleaner: usage: context-cleaner <orchestrator start|stop|status|migrate run|doctor>");
            64
        }
    };

    std::process::exit(exit_code);
}

fn load_config_or_exit() -> Option<Config> {
    match Config::from_env() {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!("context-cleaner: configuration error: {e}");
            None
        }
    }
}

/// Loads the cursor-store encryption key from the environment, or derives
/// an ephemeral one for this run if none was configured. An ephemeral key
/// means cursors written this run cannot be decrypted next run, so tailing
/// effectively restarts from scratch — acceptable for a single missing
/// session, not something to rely on across restarts.
fn load_or_ephemeral_key() -> EncryptionKey {
    match EncryptionKey::load() {
        Some(key) => key,
        None => {
            tracing::warn!("CONTEXT_CLEANER_ENCRYPTION_KEY not set, using an ephemeral key for this run");
            let bytes = STANDARD.decode(crypto::generate_key_b64()).expect("freshly generated key is valid base64");
            let arr: [u8; 32] = bytes.try_into().expect("generate_key_b64 always returns 32 bytes");
            EncryptionKey::from_bytes(arr)
        }
    }
}

/// Lifecycles every orchestrated service as an in-process `tokio` task.
/// There is no separate worker binary: "process" in the IPC registry
/// sense is this one binary's own pid for every task it owns.
struct InProcessServices {
    config: Config,
    store: Arc<Client>,
    bridge: Arc<Bridge>,
}

#[async_trait::async_trait]
impl ServiceHandle for InProcessServices {
    async fn start(&self, name: &str, port: u16, cancel: CancellationToken) -> Result<u32, Error> {
        match name {
            dag::STORE => {}
            dag::TELEMETRY_FEED => {
                let (tx, mut rx) = tokio::sync::mpsc::channel(1000);
                let addr: SocketAddr = format!("127.0.0.1:{port}").parse().map_err(|e| Error::configuration(format!("{e}")))?;
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = telemetry::serve(addr, tx, cancel).await {
                        tracing::error!(error = %e, "telemetry collector exited");
                    }
                });
                // The store/bridge side of OTLP event consumption is out of
                // scope for this entrypoint's non-goal dashboard UI; drain
                // so the channel never backs up the collector.
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
            }
            dag::INGEST_WORKER => {
                let store = self.store.clone();
                let privacy_level = self.config.privacy_level;
                let root = self.config.projects_dir.clone();
                let max_file_size = context_cleaner_core::ingest::security::DEFAULT_MAX_FILE_SIZE;
                let cursors_path = self.config.cursors_path();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let key = load_or_ephemeral_key();
                    let cursor_store = match CursorStore::load(cursors_path, key).await {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to load cursor store");
                            return;
                        }
                    };
                    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());
                    let guard = PathGuard::new(vec![canonical_root]);
                    let pipeline = Arc::new(IngestPipeline::new(store, privacy_level));
                    let (tx, rx) = IngestPipeline::channel();
                    let worker = tokio::spawn(pipeline.run_workers(rx, cancel.clone()));

                    let (watch_tx, mut watch_rx) = tokio::sync::mpsc::channel(256);
                    let _watcher = match spawn_watcher(root.clone(), watch_tx) {
                        Ok(w) => Some(w),
                        Err(e) => {
                            tracing::warn!(error = %e, "filesystem watcher failed to start, relying on startup scan only");
                            None
                        }
                    };

                    if let Ok(manifest) = discover(&[root.clone()], max_file_size) {
                        for entry in manifest.valid() {
                            let _ = tail_file(&entry.path, &cursor_store, &guard, &tx).await;
                        }
                    }

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            changed = watch_rx.recv() => match changed {
                                Some(path) => { let _ = tail_file(&path, &cursor_store, &guard, &tx).await; }
                                None => break,
                            }
                        }
                    }
                    drop(tx);
                    let _ = worker.await;
                });
            }
            dag::BRIDGE => {}
            dag::DASHBOARD_API => {
                let state = ApiState {
                    bridge: self.bridge.clone(),
                    explorer_limiter: Arc::new(RateLimiter::new(Duration::from_secs(60), 120)),
                    registry: Arc::new(Registry::new(self.config.registry_path())),
                };
                let router = dashboard_api::router(state, port);
                let addr: SocketAddr = format!("127.0.0.1:{port}").parse().map_err(|e| Error::configuration(format!("{e}")))?;
                let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::from)?;
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _ = axum::serve(listener, router).with_graceful_shutdown(async move { cancel.cancelled().await }).await;
                });
            }
            other => return Err(Error::ServiceLifecycle(format!("unknown service '{other}'"))),
        }
        Ok(std::process::id())
    }

    async fn health_probe(&self, name: &str) -> Result<(), Error> {
        match name {
            dag::STORE => self.store.health_check().await.map(|_| ()),
            _ => Ok(()),
        }
    }

    async fn request_stop(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }
}

async fn run_orchestrator(args: &[String]) -> i32 {
    let Some(config) = load_config_or_exit() else { return 64 };
    let store = Arc::new(build_store(&config));
    let bridge = Arc::new(Bridge::new(store.clone()));
    let registry = Registry::new(config.registry_path());
    let handle = Arc::new(InProcessServices { config: config.clone(), store, bridge });
    let orchestrator = Orchestrator::new(registry, handle, config.port_range);

    match args.first().map(String::as_str) {
        Some("start") => match orchestrator.start().await {
            Ok(()) => {
                tracing::info!("orchestrator started");
                let mut ticker = tokio::time::interval(orchestrator.health_interval());
                let mut shutdown = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        eprintln!("context-cleaner: failed to install signal handler: {e}");
                        return 70;
                    }
                };
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let samples = orchestrator.poll_health().await;
                            tracing::debug!(?samples, "health poll");
                        }
                        _ = shutdown.recv() => {
                            tracing::info!("shutdown signal received");
                            break;
                        }
                    }
                }
                match orchestrator.stop().await {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("context-cleaner: shutdown error: {e}");
                        70
                    }
                }
            }
            Err(e) => {
                eprintln!("context-cleaner: failed to start services: {e}");
                69
            }
        },
        Some("stop") => match orchestrator.stop().await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("context-cleaner: {e}");
                70
            }
        },
        Some("status") => {
            let registry = Registry::new(config.registry_path());
            for name in dag::topological_order() {
                match registry.get(name) {
                    Ok(Some(entry)) => {
                        let alive = context_cleaner_core::orchestrator::registry::process_alive(entry.pid);
                        println!("{name}: pid={} port={} alive={alive}", entry.pid, entry.port);
                    }
                    Ok(None) => println!("{name}: not running"),
                    Err(e) => println!("{name}: error reading registry ({e})"),
                }
            }
            0
        }
        _ => {
            eprintln!("context-cleaner: usage: context-cleaner orchestrator <start|stop|status>");
            64
        }
    }
}

async fn run_migrate(args: &[String]) -> i32 {
    if args.first().map(String::as_str) != Some("run") {
        eprintln!("context-cleaner: usage: context-cleaner migrate run");
        return 64;
    }
    let Some(config) = load_config_or_exit() else { return 64 };
    let store = Arc::new(build_store(&config));
    let canonical_root = config.projects_dir.canonicalize().unwrap_or_else(|_| config.projects_dir.clone());
    let guard = Arc::new(PathGuard::new(vec![canonical_root]));
    let checkpoints = CheckpointStore::new(config.checkpoints_dir().join("migration.json"));
    let engine = MigrationEngine::new(store, guard, config.privacy_level, checkpoints);

    match engine
        .run(&[config.projects_dir.clone()], context_cleaner_core::ingest::security::DEFAULT_MAX_FILE_SIZE, CancellationToken::new())
        .await
    {
        Ok(report) => {
            println!(
                "migration complete: {}/{} files, {} records, {} errors",
                report.files_done, report.files_total, report.records_done, report.errors.len()
            );
            if report.errors.is_empty() { 0 } else { 70 }
        }
        Err(e) => {
            eprintln!("context-cleaner: migration failed: {e}");
            70
        }
    }
}

async fn run_doctor() -> i32 {
    let Some(config) = load_config_or_exit() else { return 64 };
    println!("context-cleaner doctor");
    println!("  data dir: {}", config.data_dir.display());
    println!("  projects dir: {}", config.projects_dir.display());
    println!("  privacy level: {:?}", config.privacy_level);

    let store = build_store(&config);
    match store.health_check().await {
        Ok(status) if status.ok => println!("  store: reachable ({} ms)", status.latency_ms),
        Ok(_) => println!("  store: unreachable"),
        Err(e) => println!("  store: error ({e})"),
    }

    let registry = Registry::new(config.registry_path());
    match registry.all() {
        Ok(entries) => println!("  registry: {} service(s) recorded", entries.len()),
        Err(e) => println!("  registry: error ({e})"),
    }

    if EncryptionKey::load().is_none() {
        println!("  encryption key: not set (CONTEXT_CLEANER_ENCRYPTION_KEY), cursors will not survive a restart");
    } else {
        println!("  encryption key: configured");
    }

    println!("  session marker: {}", Uuid::new_v4());
    0
}

fn build_store(config: &Config) -> Client {
    if config.store_url.is_empty() {
        Client::Stub(context_cleaner_core::store::StubStore::default())
    } else {
        Client::Real(HttpStore::new(config.store_url.clone()))
    }
}
