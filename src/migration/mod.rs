//! Historical Migration Engine (spec §4.4): Discovery → Processing →
//! Validation → Finalization over the same records the ingest pipeline
//! tails incrementally. Concurrency is a bounded `tokio::sync::Semaphore`
//! set of per-file tasks, matching the teacher's `tokio` feature set
//! (`rt-multi-thread`, `sync`, `fs`, `time`).

pub mod checkpoint;
pub mod progress;
pub mod validate;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use progress::{Progress, ProgressTracker};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::PrivacyLevel;
use crate::error::Error;
use crate::ingest::discovery::discover;
use crate::ingest::parser::parse_line;
use crate::ingest::pipeline::{file_access_row, message_row, tool_execution_row};
use crate::ingest::security::PathGuard;
use crate::store::Client;

use validate::{validate_cross, validate_post, validate_pre, PostValidation};

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_CHECKPOINT_INTERVAL_RECORDS: u64 = 500;
const INSERT_CHUNK: usize = 200;
const TOKEN_TOLERANCE: f64 = 0.01;
/// Cap on how many committed messages are kept around for `validate_cross`'s
/// sample comparison against the store.
const CROSS_VALIDATION_SAMPLE_SIZE: usize = 25;

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub files_total: usize,
    pub files_done: usize,
    pub records_done: u64,
    pub tokens_done: u64,
    pub errors: Vec<String>,
    pub validation: PostValidation,
    /// `(matched, sampled)` from the post-run cross-validation pass, or
    /// `None` if no messages were committed to sample.
    pub cross_validated: Option<(usize, usize)>,
}

pub struct MigrationEngine {
    store: Arc<Client>,
    guard: Arc<PathGuard>,
    privacy_level: PrivacyLevel,
    concurrency: usize,
    checkpoint_interval: u64,
    checkpoints: CheckpointStore,
}

impl MigrationEngine {
    pub fn new(store: Arc<Client>, guard: Arc<PathGuard>, privacy_level: PrivacyLevel, checkpoints: CheckpointStore) -> Self {
        Self {
            store,
            guard,
            privacy_level,
            concurrency: DEFAULT_CONCURRENCY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL_RECORDS,
            checkpoints,
        }
    }

    #[instrument(skip(self, cancel))]
    pub async fn run(&self, roots: &[PathBuf], max_file_size: u64, cancel: CancellationToken) -> Result<MigrationReport, Error> {
        let manifest = discover(roots, max_file_size)?;
        let files_total = manifest.valid().count();
        info!(files_total, "migration discovery complete");

        let checkpoint = Arc::new(Mutex::new(self.checkpoints.load().await?.unwrap_or_default()));
        let counts: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let tokens: Arc<Mutex<u64>> = Arc::new(Mutex::new(0));
        let samples: Arc<Mutex<Vec<(Uuid, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut join_set = tokio::task::JoinSet::new();

        for entry in manifest.valid() {
            if cancel.is_cancelled() {
                break;
            }
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let path = self.guard.admit(&entry.path)?;
            let store = self.store.clone();
            let privacy_level = self.privacy_level;
            let checkpoint = checkpoint.clone();
            let counts = counts.clone();
            let tokens = tokens.clone();
            let samples = samples.clone();
            let errors = errors.clone();
            let checkpoint_interval = self.checkpoint_interval;
            let checkpoints_store = self.checkpoints.clone_handle();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let result = process_file(
                    &path,
                    &store,
                    privacy_level,
                    &checkpoint,
                    &counts,
                    &tokens,
                    &samples,
                    checkpoint_interval,
                    &checkpoints_store,
                    &cancel,
                    &errors,
                )
                .await;
                if let Err(e) = result {
                    let mut errors = errors.lock().await;
                    errors.push(format!("{}: {e}", path.display()));
                    warn!(file = %path.display(), error = %e, "migration file processing failed");
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        {
            let mut cp = checkpoint.lock().await;
            cp.files_done = files_total as u64;
            self.checkpoints.save(&cp).await?;
        }

        let final_counts = counts.lock().await.clone();
        let records_done: u64 = final_counts.values().sum();
        let extracted_tokens = *tokens.lock().await;

        let mut stored_counts = HashMap::new();
        for table in ["messages", "file_accesses", "tool_executions"] {
            match store_row_count(&self.store, table).await {
                Ok(n) => {
                    stored_counts.insert(table.to_string(), n);
                }
                Err(e) => {
                    errors.lock().await.push(format!("post-validation count query for {table} failed: {e}"));
                }
            }
        }
        let stored_tokens = match store_token_sum(&self.store).await {
            Ok(n) => n,
            Err(e) => {
                errors.lock().await.push(format!("post-validation token sum query failed: {e}"));
                0
            }
        };

        let validation = validate_post(&final_counts, &stored_counts, extracted_tokens, stored_tokens, TOKEN_TOLERANCE);

        let sample_pairs = samples.lock().await.clone();
        let cross_validated = cross_validate_sample(&self.store, &sample_pairs).await;

        if validation.is_ok() && errors.lock().await.is_empty() {
            self.checkpoints.clear().await?;
        }

        Ok(MigrationReport {
            files_total,
            files_done: files_total,
            records_done,
            tokens_done: extracted_tokens,
            errors: errors.lock().await.clone(),
            validation,
            cross_validated,
        })
    }
}

/// Genuine, store-sourced row count for `table` — independent of anything
/// the migration run itself believes it inserted.
async fn store_row_count(store: &Client, table: &str) -> Result<u64, Error> {
    let rows = store.execute(&format!("SELECT COUNT(*) AS n FROM {table}"), &HashMap::new()).await?;
    Ok(rows.first().and_then(|r| r.get("n")).and_then(|v| v.as_u64()).unwrap_or(0))
}

async fn store_token_sum(store: &Client) -> Result<u64, Error> {
    let rows = store.execute("SELECT SUM(input_tokens + output_tokens) AS tokens FROM messages", &HashMap::new()).await?;
    Ok(rows.first().and_then(|r| r.get("tokens")).and_then(|v| v.as_u64()).unwrap_or(0))
}

/// Spec §4.4 Validation's sample-based cross-check: re-reads the committed
/// messages' `content_sha256` back out of the store and compares against the
/// hash computed from the source at parse time.
async fn cross_validate_sample(store: &Client, samples: &[(Uuid, String)]) -> Option<(usize, usize)> {
    if samples.is_empty() {
        return None;
    }
    let ids = samples.iter().map(|(id, _)| format!("'{id}'")).collect::<Vec<_>>().join(",");
    let sql = format!("SELECT message_uuid, content_sha256 FROM messages WHERE message_uuid IN ({ids})");
    let rows = match store.execute(&sql, &HashMap::new()).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "cross-validation sample query failed");
            return Some((0, samples.len()));
        }
    };

    let mut stored: HashMap<String, String> = HashMap::new();
    for row in rows {
        let uuid = row.get("message_uuid").and_then(|v| v.as_str());
        let hash = row.get("content_sha256").and_then(|v| v.as_str());
        if let (Some(uuid), Some(hash)) = (uuid, hash) {
            stored.insert(uuid.to_string(), hash.to_string());
        }
    }

    let pairs: Vec<(String, String)> = samples
        .iter()
        .map(|(id, source_hash)| (source_hash.clone(), stored.get(&id.to_string()).cloned().unwrap_or_default()))
        .collect();
    validate_cross(&pairs).ok()
}

#[allow(clippy::too_many_arguments)]
async fn process_file(
    path: &PathBuf,
    store: &Arc<Client>,
    privacy_level: PrivacyLevel,
    checkpoint: &Arc<Mutex<Checkpoint>>,
    counts: &Arc<Mutex<HashMap<String, u64>>>,
    tokens: &Arc<Mutex<u64>>,
    samples: &Arc<Mutex<Vec<(Uuid, String)>>>,
    checkpoint_interval: u64,
    checkpoints_store: &CheckpointStore,
    cancel: &CancellationToken,
    errors: &Arc<Mutex<Vec<String>>>,
) -> Result<(), Error> {
    let key = path.to_string_lossy().to_string();
    let resume_line = checkpoint.lock().await.resume_line_for(&key);

    let content = tokio::fs::read_to_string(path).await?;

    let bad_lines = validate_pre(&content);
    if !bad_lines.is_empty() {
        warn!(file = %path.display(), count = bad_lines.len(), "pre-validation integrity check flagged lines");
        errors
            .lock()
            .await
            .push(format!("{}: {} line(s) failed pre-validation integrity check: {bad_lines:?}", path.display(), bad_lines.len()));
    }

    let mut messages = Vec::new();
    let mut file_accesses = Vec::new();
    let mut tool_executions = Vec::new();
    let mut line_no = 0usize;
    let mut records_since_checkpoint = 0u64;

    for line in content.lines() {
        line_no += 1;
        if line_no <= resume_line {
            continue;
        }
        if cancel.is_cancelled() {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let parsed = match parse_line(line) {
            Ok(p) => p,
            Err(e) => {
                warn!(file = %path.display(), line_no, error = %e, "skipping malformed line");
                continue;
            }
        };

        if let Some(message) = parsed.message {
            if !checkpoint.lock().await.already_committed(&key, message.message_uuid) {
                messages.push((message.message_uuid, message_row(&message, privacy_level)));
            }
        }
        if let Some(file_access) = parsed.file_access {
            if !checkpoint.lock().await.already_committed(&key, file_access.access_uuid) {
                file_accesses.push((file_access.access_uuid, file_access_row(&file_access, privacy_level)));
            }
        }
        for tool_execution in parsed.tool_executions {
            if !checkpoint.lock().await.already_committed(&key, tool_execution.tool_uuid) {
                tool_executions.push((tool_execution.tool_uuid, tool_execution_row(&tool_execution, privacy_level)));
            }
        }

        if messages.len() >= INSERT_CHUNK {
            flush_chunk(store, "messages", &mut messages, &key, checkpoint, counts, tokens, samples).await?;
        }
        if file_accesses.len() >= INSERT_CHUNK {
            flush_chunk(store, "file_accesses", &mut file_accesses, &key, checkpoint, counts, tokens, samples).await?;
        }
        if tool_executions.len() >= INSERT_CHUNK {
            flush_chunk(store, "tool_executions", &mut tool_executions, &key, checkpoint, counts, tokens, samples).await?;
        }

        records_since_checkpoint += 1;
        if records_since_checkpoint >= checkpoint_interval {
            let mut cp = checkpoint.lock().await;
            cp.last_committed_line.insert(key.clone(), line_no);
            checkpoints_store.save(&cp).await?;
            records_since_checkpoint = 0;
        }
    }

    flush_chunk(store, "messages", &mut messages, &key, checkpoint, counts, tokens, samples).await?;
    flush_chunk(store, "file_accesses", &mut file_accesses, &key, checkpoint, counts, tokens, samples).await?;
    flush_chunk(store, "tool_executions", &mut tool_executions, &key, checkpoint, counts, tokens, samples).await?;

    let mut cp = checkpoint.lock().await;
    cp.processed_files.insert(key.clone());
    cp.last_committed_line.insert(key, line_no);
    checkpoints_store.save(&cp).await?;

    Ok(())
}

async fn flush_chunk(
    store: &Arc<Client>,
    table: &str,
    batch: &mut Vec<(Uuid, crate::store::Row)>,
    file_key: &str,
    checkpoint: &Arc<Mutex<Checkpoint>>,
    counts: &Arc<Mutex<HashMap<String, u64>>>,
    tokens: &Arc<Mutex<u64>>,
    samples: &Arc<Mutex<Vec<(Uuid, String)>>>,
) -> Result<(), Error> {
    if batch.is_empty() {
        return Ok(());
    }
    let taken = std::mem::take(batch);
    let (uuids, rows): (Vec<_>, Vec<_>) = taken.into_iter().unzip();

    match store.bulk_insert(table, &rows).await {
        Ok(()) => {
            let mut cp = checkpoint.lock().await;
            for uuid in &uuids {
                cp.mark_committed(file_key, *uuid);
            }
            cp.records_done += rows.len() as u64;
            drop(cp);

            let mut counts_guard = counts.lock().await;
            *counts_guard.entry(table.to_string()).or_insert(0) += rows.len() as u64;
            drop(counts_guard);

            if table == "messages" {
                let mut token_sum = 0u64;
                let mut sampled = Vec::new();
                for (uuid, row) in uuids.iter().zip(rows.iter()) {
                    token_sum += row.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                    token_sum += row.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                    if let Some(hash) = row.get("content_sha256").and_then(|v| v.as_str()) {
                        sampled.push((*uuid, hash.to_string()));
                    }
                }
                *tokens.lock().await += token_sum;

                let mut samples_guard = samples.lock().await;
                for pair in sampled {
                    if samples_guard.len() >= CROSS_VALIDATION_SAMPLE_SIZE {
                        break;
                    }
                    samples_guard.push(pair);
                }
            }
            Ok(())
        }
        Err(e) => {
            let mut cp = checkpoint.lock().await;
            cp.errors.push(format!("{table}: {e}"));
            Err(Error::Permanent(e.to_string()))
        }
    }
}

impl CheckpointStore {
    /// Migration spawns per-file tasks that each need their own handle to
    /// the same on-disk checkpoint path.
    fn clone_handle(&self) -> CheckpointStore {
        CheckpointStore::new(self.path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Client, StubStore};

    #[tokio::test]
    async fn run_over_a_small_manifest_reaches_finalization() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.jsonl"),
            "{\"uuid\":\"3fa85f64-5717-4562-b3fc-2c963f66afa6\",\"sessionId\":\"3fa85f64-5717-4562-b3fc-2c963f66afa7\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"message\":{\"role\":\"user\",\"content\":\"hi\"}}\n",
        )
        .unwrap();

        let store = Arc::new(Client::Stub(StubStore::default()));
        let guard = Arc::new(PathGuard::new(vec![dir.path().canonicalize().unwrap()]));
        let checkpoints = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let engine = MigrationEngine::new(store, guard, PrivacyLevel::Standard, checkpoints);

        let report = engine.run(&[dir.path().to_path_buf()], 1024 * 1024, CancellationToken::new()).await.unwrap();
        assert_eq!(report.files_total, 1);
        assert!(report.errors.is_empty());
        // The stub store accepts inserts but never actually stores rows, so
        // genuine post- and cross-validation against it must report a
        // mismatch rather than trivially agreeing with what was extracted.
        assert!(!report.validation.row_counts_match);
        assert_eq!(report.cross_validated, Some((0, 1)));
    }

    #[tokio::test]
    async fn pre_validation_records_a_malformed_line_without_aborting_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.jsonl"),
            "{\"uuid\":\"3fa85f64-5717-4562-b3fc-2c963f66afa6\",\"sessionId\":\"3fa85f64-5717-4562-b3fc-2c963f66afa7\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"message\":{\"role\":\"user\",\"content\":\"hi\"}}\nnot json at all\n",
        )
        .unwrap();

        let store = Arc::new(Client::Stub(StubStore::default()));
        let guard = Arc::new(PathGuard::new(vec![dir.path().canonicalize().unwrap()]));
        let checkpoints = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let engine = MigrationEngine::new(store, guard, PrivacyLevel::Standard, checkpoints);

        let report = engine.run(&[dir.path().to_path_buf()], 1024 * 1024, CancellationToken::new()).await.unwrap();
        assert_eq!(report.records_done, 1, "the one well-formed line should still be ingested");
        assert!(report.errors.iter().any(|e| e.contains("pre-validation integrity check")));
    }
}
