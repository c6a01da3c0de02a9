//! Tailer + worker pool wiring (spec §4.3.3, §4.3.7). Grounded on the
//! teacher's `ledger::append_event` atomic-write discipline (generalized
//! from "append one event" to "persist a cursor after a successful tail")
//! and its already-present `notify` dependency (gated behind the
//! `dashboard` feature there for live reload; first-class here for
//! filesystem watching).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::PrivacyLevel;
use crate::error::Error;
use crate::ingest::batcher::{AdaptiveBatcher, BatchOutcome};
use crate::ingest::cursor_state::{CursorStore, FileCursor};
use crate::ingest::parser::parse_line;
use crate::ingest::security::PathGuard;
use crate::redact;
use crate::store::{Client, Row};

pub const BACKPRESSURE_QUEUE_CAPACITY: usize = 1000;
const SEND_TIMEOUT: Duration = Duration::from_millis(50);
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RawLineEvent {
    pub file_path: String,
    pub line: String,
}

#[derive(Debug, Default)]
pub struct TailStats {
    pub lines_enqueued: usize,
    pub lines_dropped_backpressure: bool,
}

/// Incrementally tails `path`: consults the persisted cursor, does nothing
/// if the file hasn't grown, otherwise reads new complete lines from the
/// last offset and tries to hand each to `tx`. A line that cannot be sent
/// because the queue is full stops the scan right there — the cursor only
/// advances past lines that were actually enqueued, so unread bytes are
/// revisited on the next pass.
#[instrument(skip(cursor_store, guard, tx), fields(path = %path.display()))]
pub async fn tail_file(
    path: &Path,
    cursor_store: &CursorStore,
    guard: &PathGuard,
    tx: &mpsc::Sender<RawLineEvent>,
) -> Result<TailStats, Error> {
    let canonical = guard.admit(path)?;
    let key = canonical.to_string_lossy().to_string();

    let meta = tokio::fs::metadata(&canonical).await?;
    let size = meta.len();
    let mtime = mtime_unix(&meta);

    let cursor = cursor_store.get(&key).await.unwrap_or(FileCursor { offset_bytes: 0, size_bytes: 0, mtime: 0 });
    if cursor.unchanged(size, mtime) || size <= cursor.size_bytes {
        return Ok(TailStats::default());
    }

    let file = tokio::fs::File::open(&canonical).await?;
    let mut reader = BufReader::new(file);
    reader.seek(std::io::SeekFrom::Start(cursor.offset_bytes)).await?;

    let mut stats = TailStats::default();
    let mut consumed = cursor.offset_bytes;

    loop {
        let mut buf = String::new();
        let n = reader.read_line(&mut buf).await?;
        if n == 0 || !buf.ends_with('\n') {
            // EOF or a partial trailing line: hold until it is completed.
            break;
        }

        let event = RawLineEvent { file_path: key.clone(), line: buf.trim_end_matches('\n').to_string() };
        match tokio::time::timeout(SEND_TIMEOUT, tx.send(event)).await {
            Ok(Ok(())) => {
                consumed += n as u64;
                stats.lines_enqueued += 1;
            }
            _ => {
                warn!(path = %canonical.display(), "backpressure queue full, dropping tail event");
                stats.lines_dropped_backpressure = true;
                break;
            }
        }
    }

    if consumed > cursor.offset_bytes {
        cursor_store.update(&key, FileCursor { offset_bytes: consumed, size_bytes: size, mtime }).await?;
    }

    Ok(stats)
}

fn mtime_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parser/batcher side of the pipeline: one adaptive batcher per table,
/// fed by workers draining the backpressure queue.
pub struct IngestPipeline {
    store: Arc<Client>,
    privacy_level: PrivacyLevel,
    messages: Mutex<AdaptiveBatcher<Row>>,
    file_accesses: Mutex<AdaptiveBatcher<Row>>,
    tool_executions: Mutex<AdaptiveBatcher<Row>>,
}

impl IngestPipeline {
    pub fn new(store: Arc<Client>, privacy_level: PrivacyLevel) -> Self {
        Self {
            store,
            privacy_level,
            messages: Mutex::new(AdaptiveBatcher::new(FLUSH_INTERVAL)),
            file_accesses: Mutex::new(AdaptiveBatcher::new(FLUSH_INTERVAL)),
            tool_executions: Mutex::new(AdaptiveBatcher::new(FLUSH_INTERVAL)),
        }
    }

    pub fn channel() -> (mpsc::Sender<RawLineEvent>, mpsc::Receiver<RawLineEvent>) {
        mpsc::channel(BACKPRESSURE_QUEUE_CAPACITY)
    }

    /// Drains `rx` until the sender side is dropped or `cancel` trips. On
    /// cancellation, whatever is already queued is flushed before exit so
    /// no in-flight work is silently lost (spec §4.6.6).
    pub async fn run_workers(self: Arc<Self>, mut rx: mpsc::Receiver<RawLineEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush_all().await;
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_stale().await;
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => self.handle_line(&event.line).await,
                        None => {
                            self.flush_all().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let parsed = match parse_line(line) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "skipping malformed JSONL line");
                return;
            }
        };

        if let Some(message) = parsed.message {
            let row = message_row(&message, self.privacy_level);
            self.push("messages", row, &self.messages).await;
        }
        if let Some(file_access) = parsed.file_access {
            let row = file_access_row(&file_access, self.privacy_level);
            self.push("file_accesses", row, &self.file_accesses).await;
        }
        for tool_execution in parsed.tool_executions {
            let row = tool_execution_row(&tool_execution, self.privacy_level);
            self.push("tool_executions", row, &self.tool_executions).await;
        }
    }

    async fn push(&self, table: &str, row: Row, batcher: &Mutex<AdaptiveBatcher<Row>>) {
        let drained = {
            let mut guard = batcher.lock().await;
            guard.push(row)
        };
        if let Some(batch) = drained {
            self.flush_table(table, batch, batcher).await;
        }
    }

    async fn flush_all(&self) {
        for (table, batcher) in
            [("messages", &self.messages), ("file_accesses", &self.file_accesses), ("tool_executions", &self.tool_executions)]
        {
            let batch = {
                let mut guard = batcher.lock().await;
                if guard.is_empty() {
                    continue;
                }
                guard.drain()
            };
            self.flush_table(table, batch, batcher).await;
        }
    }

    /// Drains only the batchers whose `flush_interval` has elapsed while
    /// below `batch_size` (spec §4.3.6: flush on size OR time, whichever
    /// comes first). Tables still accumulating toward a size-triggered
    /// flush are left alone.
    async fn flush_stale(&self) {
        for (table, batcher) in
            [("messages", &self.messages), ("file_accesses", &self.file_accesses), ("tool_executions", &self.tool_executions)]
        {
            let batch = {
                let mut guard = batcher.lock().await;
                if !guard.should_flush_on_interval() {
                    continue;
                }
                guard.drain()
            };
            self.flush_table(table, batch, batcher).await;
        }
    }

    #[instrument(skip(self, batch, batcher), fields(table, n = batch.len()))]
    async fn flush_table(&self, table: &str, batch: Vec<Row>, batcher: &Mutex<AdaptiveBatcher<Row>>) {
        let started = Instant::now();
        let size = batch.len();
        let result = self.store.bulk_insert(table, &batch).await;
        let duration = started.elapsed();
        let success = result.is_ok();

        let mut guard = batcher.lock().await;
        guard.record_outcome(BatchOutcome { size, duration, success });
        if let Err(e) = result {
            debug!(table, error = %e, "batch insert failed, moving to dead-letter queue");
            guard.dead_letter(batch);
        }
    }
}

pub(crate) fn to_row<T: Serialize>(record: &T) -> Row {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

pub(crate) fn message_row(record: &crate::model::MessageRecord, level: PrivacyLevel) -> Row {
    let (redacted, analysis) = redact::redact(&record.content_text, level);
    let mut row = to_row(record);
    row.insert("content_text".to_string(), Value::from(redacted));
    tag_risk(&mut row, &analysis);
    row
}

pub(crate) fn file_access_row(record: &crate::model::FileAccessRecord, level: PrivacyLevel) -> Row {
    let (redacted, analysis) = redact::redact(&record.file_content, level);
    let mut row = to_row(record);
    row.insert("file_content".to_string(), Value::from(redacted));
    tag_risk(&mut row, &analysis);
    row
}

pub(crate) fn tool_execution_row(record: &crate::model::ToolExecutionRecord, level: PrivacyLevel) -> Row {
    let (out_redacted, out_analysis) = redact::redact(&record.tool_output, level);
    let (err_redacted, err_analysis) = redact::redact(&record.tool_error, level);
    let mut row = to_row(record);
    row.insert("tool_output".to_string(), Value::from(out_redacted));
    row.insert("tool_error".to_string(), Value::from(err_redacted));
    row.insert("success".to_string(), Value::from(record.success()));
    tag_risk(&mut row, &out_analysis);
    if err_analysis.risk_level() as u8 > out_analysis.risk_level() as u8 {
        tag_risk(&mut row, &err_analysis);
    }
    row
}

pub(crate) fn tag_risk(row: &mut Row, analysis: &redact::RiskAnalysis) {
    row.insert("risk_level".to_string(), Value::from(format!("{:?}", analysis.risk_level()).to_lowercase()));
    row.insert("contains_pii".to_string(), Value::from(analysis.contains_pii));
    row.insert("contains_secrets".to_string(), Value::from(analysis.contains_secrets));
    row.insert("contains_credentials".to_string(), Value::from(analysis.contains_credentials));
}

/// Watches `root` recursively and forwards modified `*.jsonl` paths to
/// `tx`. Returns the live watcher so the caller controls its lifetime —
/// dropping it stops the watch.
pub fn spawn_watcher(root: PathBuf, tx: mpsc::Sender<PathBuf>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        for path in event.paths {
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                let _ = tx.try_send(path);
            }
        }
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    Ok(watcher)
}
