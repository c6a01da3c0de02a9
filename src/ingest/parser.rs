//! JSONL record parsing (spec §4.3.4). Grounded on the teacher's
//! `hook_helpers` transcript reconstruction (content-as-string-or-parts,
//! `tool_use` marker injection, token usage extraction), generalized from
//! "one JSONL line becomes one ledger event" into "one JSONL line becomes
//! up to three stored records."

use std::collections::HashSet;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::Error;
use crate::model::{FileAccessRecord, FileOperation, FileType, MessageRecord, OutputType, Role, ToolExecutionRecord};

#[derive(Debug, Deserialize)]
struct RawLine {
    uuid: Uuid,
    #[serde(rename = "sessionId")]
    session_id: Uuid,
    timestamp: String,
    message: Option<RawMessage>,
    #[serde(rename = "toolUseResult")]
    tool_use_result: Option<RawToolUseResult>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    role: Option<String>,
    content: RawContent,
    model: Option<String>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Parts(Vec<RawPart>),
}

#[derive(Debug, Deserialize)]
struct RawPart {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cost_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawToolUseResult {
    file: Option<RawFile>,
    stdout: Option<String>,
    stderr: Option<String>,
    exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "filePath")]
    file_path: String,
    content: String,
}

#[derive(Debug, Default)]
pub struct ParsedLine {
    pub message: Option<MessageRecord>,
    pub file_access: Option<FileAccessRecord>,
    pub tool_executions: Vec<ToolExecutionRecord>,
}

/// Fixed namespace for deriving stable record UUIDs from a line's own
/// uuid, so re-parsing the same line (on tail replay or migration resume)
/// always yields the same `access_uuid`/`tool_uuid` — required for tail
/// idempotence (spec §8) since these sub-records have no uuid of their own
/// in the upstream transcript.
const DERIVED_UUID_NAMESPACE: Uuid = Uuid::from_u128(0x1f2e_3d4c_5b6a_7988_90a1_b2c3_d4e5_f607);

fn derive_uuid(parts: &[&str]) -> Uuid {
    Uuid::new_v5(&DERIVED_UUID_NAMESPACE, parts.join("|").as_bytes())
}

/// Parses ISO-8601 with a trailing `Z` treated as UTC.
pub fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, Error> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| Error::decode(format!("bad timestamp '{raw}': {e}")))
}

pub fn parse_line(line: &str) -> Result<ParsedLine, Error> {
    let raw: RawLine = serde_json::from_str(line)?;
    let timestamp = parse_timestamp(&raw.timestamp)?;

    let mut parsed = ParsedLine::default();
    let mut tool_use_parts: Vec<&RawPart> = Vec::new();

    if let Some(message) = &raw.message {
        let (content_text, parts) = reconstruct_content(&message.content);
        tool_use_parts = parts;

        let role = match message.role.as_deref() {
            Some("user") => Role::User,
            _ => Role::Assistant,
        };
        let languages = detect_languages(&content_text);
        let (input_tokens, output_tokens, cost_usd) = match &message.usage {
            Some(u) => (u.input_tokens, u.output_tokens, u.cost_usd.unwrap_or(0.0)),
            None => (None, None, 0.0),
        };

        parsed.message = Some(MessageRecord::new(
            raw.uuid,
            raw.session_id,
            timestamp,
            role,
            content_text,
            message.model.clone(),
            input_tokens,
            output_tokens,
            cost_usd,
            languages,
        ));
    }

    if let Some(tur) = &raw.tool_use_result {
        if let Some(file) = &tur.file {
            let operation = infer_operation(&tool_use_parts);
            let file_type = derive_file_type(&file.file_path);
            let language = detect_file_language(&file.file_path, &file.content);
            parsed.file_access = Some(FileAccessRecord::new(
                derive_uuid(&[&raw.uuid.to_string(), "file_access"]),
                raw.session_id,
                raw.uuid,
                timestamp,
                file.file_path.clone(),
                file.content.clone(),
                operation,
                file_type,
                language,
            ));
        }

        let stdout = tur.stdout.clone().unwrap_or_default();
        let stderr = tur.stderr.clone().unwrap_or_default();
        let has_file = tur.file.is_some();
        let output_type = infer_output_type(&stdout, &stderr, has_file);

        for (i, part) in tool_use_parts.iter().enumerate() {
            parsed.tool_executions.push(ToolExecutionRecord {
                tool_uuid: derive_uuid(&[&raw.uuid.to_string(), "tool_execution", &i.to_string()]),
                session_id: raw.session_id,
                message_uuid: raw.uuid,
                timestamp,
                tool_name: part.name.clone().unwrap_or_default(),
                tool_input_json: part.input.clone().unwrap_or(serde_json::Value::Null),
                tool_output: stdout.clone(),
                tool_error: stderr.clone(),
                execution_ms: None,
                exit_code: tur.exit_code,
                output_type,
            });
        }
    }

    Ok(parsed)
}

/// Concatenates text parts in order; for each `tool_use` part appends a
/// marker so downstream text search captures tool intent. Returns the
/// reconstructed text plus references to the tool_use parts encountered.
fn reconstruct_content(content: &RawContent) -> (String, Vec<&RawPart>) {
    match content {
        RawContent::Text(s) => (s.clone(), Vec::new()),
        RawContent::Parts(parts) => {
            let mut out = String::new();
            let mut tool_use_parts = Vec::new();
            for part in parts {
                match part.kind.as_str() {
                    "text" => {
                        if let Some(t) = &part.text {
                            out.push_str(t);
                        }
                    }
                    "tool_use" => {
                        let pretty = part
                            .input
                            .as_ref()
                            .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
                            .unwrap_or_default();
                        out.push_str(&format!(
                            "\n[TOOL_USE: {}]\nInput: {}\n",
                            part.name.as_deref().unwrap_or("unknown"),
                            pretty
                        ));
                        tool_use_parts.push(part);
                    }
                    _ => {}
                }
            }
            (out, tool_use_parts)
        }
    }
}

const LANGUAGE_KEYWORDS: &[(&str, &[&str])] = &[
    ("rust", &["fn main(", "let mut ", "impl ", "pub fn", "::std::"]),
    ("python", &["def ", "import ", "self.", "elif "]),
    ("javascript", &["function ", "const ", "=>", "require("]),
    ("typescript", &["interface ", ": string", ": number", "export type"]),
    ("go", &["func ", "package ", ":= "]),
    ("java", &["public class ", "public static void main"]),
    ("shell", &["#!/bin/bash", "#!/bin/sh", "echo "]),
];

/// Detects programming languages by fenced code-block tags and a small
/// keyword table; results are deduplicated.
fn detect_languages(text: &str) -> HashSet<String> {
    static FENCE_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let fence_re = FENCE_RE.get_or_init(|| regex::Regex::new(r"```([A-Za-z0-9_+-]+)").unwrap());

    let mut languages = HashSet::new();
    for cap in fence_re.captures_iter(text) {
        languages.insert(cap[1].to_lowercase());
    }
    for (lang, keywords) in LANGUAGE_KEYWORDS {
        if keywords.iter().any(|k| text.contains(k)) {
            languages.insert(lang.to_string());
        }
    }
    languages
}

fn infer_operation(tool_use_parts: &[&RawPart]) -> FileOperation {
    for part in tool_use_parts {
        let name = part.name.as_deref().unwrap_or_default().to_lowercase();
        if name.contains("write") {
            return FileOperation::Write;
        }
        if name.contains("edit") {
            return FileOperation::Edit;
        }
    }
    FileOperation::Read
}

const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "ini", "cfg", "conf", "env"];
const DOC_EXTENSIONS: &[&str] = &["md", "rst", "adoc"];
const CODE_EXTENSIONS: &[&str] =
    &["rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "cpp", "h", "hpp", "rb", "sh", "swift", "kt"];
const DATA_EXTENSIONS: &[&str] = &["csv", "tsv", "parquet", "sql", "db", "json"];

fn derive_file_type(path: &str) -> FileType {
    let lower = path.to_lowercase();
    let ext = std::path::Path::new(&lower).extension().and_then(|e| e.to_str()).unwrap_or("");

    let base = std::path::Path::new(&lower)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("");
    if base.starts_with("readme") || base.starts_with("changelog") || base.starts_with("license") {
        return FileType::Documentation;
    }
    if DOC_EXTENSIONS.contains(&ext) {
        return FileType::Documentation;
    }
    if base.contains("config") || CONFIG_EXTENSIONS.contains(&ext) {
        return FileType::Config;
    }
    if CODE_EXTENSIONS.contains(&ext) {
        return FileType::Code;
    }
    if DATA_EXTENSIONS.contains(&ext) {
        return FileType::Data;
    }
    FileType::Text
}

const EXTENSION_LANGUAGE: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("java", "java"),
    ("rb", "ruby"),
    ("cpp", "cpp"),
    ("c", "c"),
    ("kt", "kotlin"),
    ("swift", "swift"),
];

/// Extension map drives language detection; ambiguous extensions (`.h`,
/// `.sh`, none at all) fall back to content heuristics.
fn detect_file_language(path: &str, content: &str) -> Option<String> {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase());

    if let Some(ext) = &ext {
        if let Some((_, lang)) = EXTENSION_LANGUAGE.iter().find(|(e, _)| e == ext) {
            return Some(lang.to_string());
        }
        if ext == "h" {
            return Some(if content.contains("class ") { "cpp" } else { "c" }.to_string());
        }
        if ext == "sh" || content.starts_with("#!/bin/bash") || content.starts_with("#!/bin/sh") {
            return Some("shell".to_string());
        }
    }

    let detected = detect_languages(content);
    detected.into_iter().next()
}

fn infer_output_type(stdout: &str, stderr: &str, has_file: bool) -> OutputType {
    if !stderr.is_empty() {
        return OutputType::Error;
    }
    if has_file {
        return OutputType::FileContent;
    }
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return OutputType::Empty;
    }
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return OutputType::Json;
    }
    if trimmed.starts_with('<') {
        return OutputType::Xml;
    }
    OutputType::CommandOutput
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_string_message() {
        let line = r#"{"uuid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","sessionId":"3fa85f64-5717-4562-b3fc-2c963f66afa7","timestamp":"2024-01-01T00:00:00Z","message":{"role":"user","content":"hello"}}"#;
        let parsed = parse_line(line).unwrap();
        let msg = parsed.message.unwrap();
        assert_eq!(msg.content_text, "hello");
        assert_eq!(msg.role, Role::User);
    }

    #[test]
    fn reconstructs_tool_use_marker_in_content() {
        let line = r#"{"uuid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","sessionId":"3fa85f64-5717-4562-b3fc-2c963f66afa7","timestamp":"2024-01-01T00:00:00Z","message":{"role":"assistant","content":[{"type":"text","text":"Let's run it."},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let parsed = parse_line(line).unwrap();
        let msg = parsed.message.unwrap();
        assert!(msg.content_text.contains("[TOOL_USE: Bash]"));
        assert!(msg.content_text.contains("\"command\""));
    }

    #[test]
    fn derives_file_access_and_tool_execution_together() {
        let line = r#"{"uuid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","sessionId":"3fa85f64-5717-4562-b3fc-2c963f66afa7","timestamp":"2024-01-01T00:00:00Z","message":{"role":"assistant","content":[{"type":"tool_use","name":"Write","input":{}}]},"toolUseResult":{"file":{"filePath":"src/main.rs","content":"fn main() {}"},"stdout":"ok","stderr":"","exit_code":0}}"#;
        let parsed = parse_line(line).unwrap();
        let file_access = parsed.file_access.unwrap();
        assert_eq!(file_access.operation, FileOperation::Write);
        assert_eq!(file_access.file_type, FileType::Code);
        assert_eq!(file_access.language.as_deref(), Some("rust"));

        assert_eq!(parsed.tool_executions.len(), 1);
        let exec = &parsed.tool_executions[0];
        assert!(exec.success());
        assert_eq!(exec.tool_name, "Write");
    }

    #[test]
    fn tool_error_marks_execution_as_failed_and_output_as_error() {
        let line = r#"{"uuid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","sessionId":"3fa85f64-5717-4562-b3fc-2c963f66afa7","timestamp":"2024-01-01T00:00:00Z","message":{"role":"assistant","content":[{"type":"tool_use","name":"Bash","input":{}}]},"toolUseResult":{"stdout":"","stderr":"command not found","exit_code":127}}"#;
        let parsed = parse_line(line).unwrap();
        let exec = &parsed.tool_executions[0];
        assert!(!exec.success());
        assert_eq!(exec.output_type, OutputType::Error);
    }

    #[test]
    fn rejects_malformed_json_line() {
        assert!(parse_line("{not json").is_err());
    }

    #[test]
    fn timestamp_z_suffix_parses_as_utc() {
        let dt = parse_timestamp("2024-06-01T12:30:00Z").unwrap();
        assert_eq!(dt.timezone(), chrono::Utc);
    }

    #[test]
    fn fenced_code_block_language_is_detected() {
        let languages = detect_languages("here:\n```python\nprint(1)\n```\n");
        assert!(languages.contains("python"));
    }

    #[test]
    fn reparsing_the_same_line_yields_identical_derived_uuids() {
        let line = r#"{"uuid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","sessionId":"3fa85f64-5717-4562-b3fc-2c963f66afa7","timestamp":"2024-01-01T00:00:00Z","message":{"role":"assistant","content":[{"type":"tool_use","name":"Write","input":{}}]},"toolUseResult":{"file":{"filePath":"src/main.rs","content":"fn main() {}"},"stdout":"ok","stderr":"","exit_code":0}}"#;
        let first = parse_line(line).unwrap();
        let second = parse_line(line).unwrap();
        assert_eq!(first.file_access.unwrap().access_uuid, second.file_access.unwrap().access_uuid);
        assert_eq!(first.tool_executions[0].tool_uuid, second.tool_executions[0].tool_uuid);
    }
}
