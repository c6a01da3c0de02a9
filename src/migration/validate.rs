//! Pre/post/cross validation (spec §4.4 Validation).

use std::collections::HashMap;

use crate::error::Error;

/// Per-file integrity check: every line must be well-formed JSON with the
/// key fields present. Returns line numbers (1-based) that fail.
pub fn validate_pre(content: &str) -> Vec<usize> {
    content
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            if line.trim().is_empty() {
                return None;
            }
            let value: serde_json::Value = serde_json::from_str(line).ok()?;
            let has_required = value.get("uuid").is_some() && value.get("sessionId").is_some() && value.get("timestamp").is_some();
            if has_required {
                None
            } else {
                Some(i + 1)
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct PostValidation {
    pub row_counts_match: bool,
    pub token_reconciliation_ok: bool,
    pub structural_sanity_ok: bool,
}

impl PostValidation {
    pub fn is_ok(&self) -> bool {
        self.row_counts_match && self.token_reconciliation_ok && self.structural_sanity_ok
    }
}

/// Row counts per table vs. extracted counts; token totals reconciled
/// within `tolerance` (default 1%); structural sanity (no negative counts,
/// `0 <= accuracy_ratio <= 2`).
pub fn validate_post(
    extracted_counts: &HashMap<String, u64>,
    stored_counts: &HashMap<String, u64>,
    extracted_tokens: u64,
    stored_tokens: u64,
    tolerance: f64,
) -> PostValidation {
    let row_counts_match = extracted_counts.iter().all(|(table, extracted)| {
        stored_counts.get(table).map(|stored| stored == extracted).unwrap_or(false)
    });

    let token_reconciliation_ok = if extracted_tokens == 0 {
        stored_tokens == 0
    } else {
        let diff = (extracted_tokens as i64 - stored_tokens as i64).unsigned_abs() as f64;
        diff / extracted_tokens as f64 <= tolerance
    };

    let structural_sanity_ok = stored_counts.values().all(|v| *v as i64 >= 0);

    PostValidation { row_counts_match, token_reconciliation_ok, structural_sanity_ok }
}

/// Sample-based comparison of source to store for a random subset,
/// returning the number of sampled records whose stored content hash
/// matched the source.
pub fn validate_cross(sampled: &[(String, String)]) -> Result<(usize, usize), Error> {
    let total = sampled.len();
    let matched = sampled.iter().filter(|(source_hash, stored_hash)| source_hash == stored_hash).count();
    Ok((matched, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_validation_flags_malformed_and_missing_fields() {
        let content = "{\"uuid\":\"a\",\"sessionId\":\"b\",\"timestamp\":\"c\"}\nnot json\n{\"uuid\":\"a\"}\n";
        let bad = validate_pre(content);
        assert_eq!(bad, vec![2, 3]);
    }

    #[test]
    fn post_validation_passes_on_matching_counts_and_tokens() {
        let mut extracted = HashMap::new();
        extracted.insert("messages".to_string(), 100u64);
        let mut stored = HashMap::new();
        stored.insert("messages".to_string(), 100u64);

        let report = validate_post(&extracted, &stored, 1000, 1005, 0.01);
        assert!(report.is_ok());
    }

    #[test]
    fn post_validation_fails_outside_token_tolerance() {
        let extracted = HashMap::new();
        let stored = HashMap::new();
        let report = validate_post(&extracted, &stored, 1000, 900, 0.01);
        assert!(!report.token_reconciliation_ok);
    }

    #[test]
    fn cross_validation_counts_hash_matches() {
        let samples = vec![("h1".to_string(), "h1".to_string()), ("h2".to_string(), "h3".to_string())];
        let (matched, total) = validate_cross(&samples).unwrap();
        assert_eq!(matched, 1);
        assert_eq!(total, 2);
    }
}
