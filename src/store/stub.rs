use std::collections::HashMap;

use serde_json::Value;

use crate::error::Error;

use super::{BulkError, HealthStatus, Row};

/// No-op store used when the store is disabled in configuration. Never
/// performs I/O and always returns a clearly-synthesized, empty result so
/// callers can detect "demo" data without inspecting contents.
#[derive(Default)]
pub struct StubStore;

impl StubStore {
    pub async fn execute(&self, _sql: &str, _params: &HashMap<String, Value>) -> Result<Vec<Row>, Error> {
        Ok(Vec::new())
    }

    pub async fn bulk_insert(&self, _table: &str, records: &[Row]) -> Result<(), BulkError> {
        // Accept-and-discard: a stub never rejects rows, it simply never
        // persists them.
        let _ = records;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<HealthStatus, Error> {
        Ok(HealthStatus { ok: true, latency_ms: 0, version: Some("stub".to_string()) })
    }
}
