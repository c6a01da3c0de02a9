//! Stored and transient entities (spec §3).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const PREVIEW_MAX_CHARS: usize = 200;

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn preview_of(content: &str) -> String {
    content.chars().take(PREVIEW_MAX_CHARS).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// `(message_uuid, session_id, timestamp, role, content_text, content_preview,
/// content_sha256, content_length, model_name, input_tokens, output_tokens,
/// cost_usd, programming_languages)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_uuid: Uuid,
    pub session_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub role: Role,
    pub content_text: String,
    pub content_preview: String,
    pub content_sha256: String,
    pub content_length: usize,
    pub model_name: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Defaults to `0.0` when absent upstream — see SPEC_FULL / DESIGN open
    /// question on `cost_usd`.
    pub cost_usd: f64,
    pub programming_languages: HashSet<String>,
}

impl MessageRecord {
    pub fn new(
        message_uuid: Uuid,
        session_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
        role: Role,
        content_text: String,
        model_name: Option<String>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        cost_usd: f64,
        programming_languages: HashSet<String>,
    ) -> Self {
        let content_sha256 = sha256_hex(&content_text);
        let content_length = content_text.chars().count();
        let content_preview = preview_of(&content_text);
        Self {
            message_uuid,
            session_id,
            timestamp,
            role,
            content_text,
            content_preview,
            content_sha256,
            content_length,
            model_name,
            input_tokens,
            output_tokens,
            cost_usd,
            programming_languages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Code,
    Config,
    Data,
    Documentation,
    Text,
}

/// `(access_uuid, session_id, message_uuid, timestamp, file_path,
/// file_content, file_sha256, size_bytes, extension, operation, file_type,
/// language)`. Deduplicated by `(file_path, file_sha256)` — see
/// `FileAccessRecord::dedup_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccessRecord {
    pub access_uuid: Uuid,
    pub session_id: Uuid,
    pub message_uuid: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub file_path: String,
    pub file_content: String,
    pub file_sha256: String,
    pub size_bytes: u64,
    pub extension: Option<String>,
    pub operation: FileOperation,
    pub file_type: FileType,
    pub language: Option<String>,
}

impl FileAccessRecord {
    pub fn new(
        access_uuid: Uuid,
        session_id: Uuid,
        message_uuid: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
        file_path: String,
        file_content: String,
        operation: FileOperation,
        file_type: FileType,
        language: Option<String>,
    ) -> Self {
        let file_sha256 = sha256_hex(&file_content);
        let size_bytes = file_content.len() as u64;
        let extension = std::path::Path::new(&file_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_lowercase());
        Self {
            access_uuid,
            session_id,
            message_uuid,
            timestamp,
            file_path,
            file_content,
            file_sha256,
            size_bytes,
            extension,
            operation,
            file_type,
            language,
        }
    }

    /// Replacing-on-key identity: the store keeps exactly one row per
    /// `(file_path, file_sha256)` — the latest timestamp wins.
    pub fn dedup_key(&self) -> (String, String) {
        (self.file_path.clone(), self.file_sha256.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Text,
    Json,
    Xml,
    Error,
    FileContent,
    CommandOutput,
    FileOperation,
    Empty,
}

/// `(tool_uuid, session_id, message_uuid, timestamp, tool_name,
/// tool_input_json, tool_output, tool_error, execution_ms, success,
/// exit_code, output_type)`. `success ⇔ |tool_error| = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub tool_uuid: Uuid,
    pub session_id: Uuid,
    pub message_uuid: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tool_name: String,
    pub tool_input_json: serde_json::Value,
    pub tool_output: String,
    pub tool_error: String,
    pub execution_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub output_type: OutputType,
}

impl ToolExecutionRecord {
    pub fn success(&self) -> bool {
        self.tool_error.is_empty()
    }
}

/// `(session_id, reported_input_tokens, reported_output_tokens,
/// reported_cache_creation_tokens, reported_cache_read_tokens,
/// calculated_total_tokens, accuracy_ratio, undercount_pct, files_processed,
/// processing_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokenMetrics {
    pub session_id: Uuid,
    pub reported_input_tokens: u64,
    pub reported_output_tokens: u64,
    pub reported_cache_creation_tokens: u64,
    pub reported_cache_read_tokens: u64,
    pub calculated_total_tokens: u64,
    pub accuracy_ratio: f64,
    pub undercount_pct: f64,
    pub files_processed: u64,
    pub processing_ms: u64,
}

impl SessionTokenMetrics {
    pub fn new(
        session_id: Uuid,
        reported_input_tokens: u64,
        reported_output_tokens: u64,
        reported_cache_creation_tokens: u64,
        reported_cache_read_tokens: u64,
        actual_total_tokens: u64,
        files_processed: u64,
        processing_ms: u64,
    ) -> Self {
        let calculated_total_tokens = reported_input_tokens
            + reported_output_tokens
            + reported_cache_creation_tokens
            + reported_cache_read_tokens;
        let accuracy_ratio = if calculated_total_tokens == 0 {
            1.0
        } else {
            (actual_total_tokens as f64 / calculated_total_tokens as f64).clamp(0.0, 2.0)
        };
        let undercount_pct = if actual_total_tokens == 0 {
            0.0
        } else {
            (1.0 - (calculated_total_tokens as f64 / actual_total_tokens as f64)).max(0.0) * 100.0
        };
        Self {
            session_id,
            reported_input_tokens,
            reported_output_tokens,
            reported_cache_creation_tokens,
            reported_cache_read_tokens,
            calculated_total_tokens,
            accuracy_ratio,
            undercount_pct,
            files_processed,
            processing_ms,
        }
    }

    pub fn is_valid(&self) -> bool {
        let sum = self.reported_input_tokens
            + self.reported_output_tokens
            + self.reported_cache_creation_tokens
            + self.reported_cache_read_tokens;
        sum == self.calculated_total_tokens && (0.0..=2.0).contains(&self.accuracy_ratio)
    }
}

/// `(timestamp, session_id, rot_score, confidence, indicator_breakdown,
/// requires_attention)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRotMeasurement {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub session_id: Uuid,
    pub rot_score: f64,
    pub confidence: f64,
    pub indicator_breakdown: HashMap<String, f64>,
    pub requires_attention: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_record_content_length_matches_text() {
        let m = MessageRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            chrono::Utc::now(),
            Role::User,
            "hello world".to_string(),
            None,
            None,
            None,
            0.0,
            HashSet::new(),
        );
        assert_eq!(m.content_length, "hello world".chars().count());
        assert_eq!(m.content_sha256, sha256_hex("hello world"));
    }

    #[test]
    fn message_record_preview_is_prefix() {
        let long = "x".repeat(500);
        let m = MessageRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            chrono::Utc::now(),
            Role::Assistant,
            long.clone(),
            None,
            None,
            None,
            0.0,
            HashSet::new(),
        );
        assert_eq!(m.content_preview.len(), PREVIEW_MAX_CHARS);
        assert!(long.starts_with(&m.content_preview));
    }

    #[test]
    fn file_access_dedup_key_is_path_and_hash() {
        let r = FileAccessRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            chrono::Utc::now(),
            "/tmp/a.rs".into(),
            "fn main() {}".into(),
            FileOperation::Read,
            FileType::Code,
            Some("rust".into()),
        );
        assert_eq!(r.dedup_key(), ("/tmp/a.rs".to_string(), sha256_hex("fn main() {}")));
    }

    #[test]
    fn session_token_metrics_arithmetic_invariant_holds() {
        let m = SessionTokenMetrics::new(Uuid::new_v4(), 100, 50, 10, 5, 165, 3, 42);
        assert_eq!(m.calculated_total_tokens, 165);
        assert!(m.is_valid());
    }

    #[test]
    fn session_token_metrics_accuracy_ratio_is_clamped() {
        let m = SessionTokenMetrics::new(Uuid::new_v4(), 1, 0, 0, 0, 1000, 0, 0);
        assert!(m.accuracy_ratio <= 2.0);
    }

    #[test]
    fn tool_execution_success_iff_error_empty() {
        let mut t = ToolExecutionRecord {
            tool_uuid: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            message_uuid: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            tool_name: "Bash".into(),
            tool_input_json: serde_json::json!({}),
            tool_output: "ok".into(),
            tool_error: String::new(),
            execution_ms: Some(12),
            exit_code: Some(0),
            output_type: OutputType::Text,
        };
        assert!(t.success());
        t.tool_error = "boom".into();
        assert!(!t.success());
    }
}
