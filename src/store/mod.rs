//! Columnar store client (spec §4.2) — typed access to an external
//! analytic SQL store over HTTP. Grounded on the teacher's `cursor::api`
//! reqwest usage (named constant endpoints, `.context`-annotated failures)
//! generalized into a parameterized SQL client with chunked bulk insert.

mod http;
mod stub;

pub use http::HttpStore;
pub use stub::StubStore;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::Error;

pub const DEFAULT_MAX_BATCH: usize = 500;

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub ok: bool,
    pub latency_ms: u64,
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BulkError {
    pub accepted_count: usize,
    pub rejected: Vec<(usize, String)>,
}

impl std::fmt::Display for BulkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bulk insert accepted {} rows, rejected {}",
            self.accepted_count,
            self.rejected.len()
        )
    }
}

impl std::error::Error for BulkError {}

pub type Row = HashMap<String, Value>;

/// Duck-typed dependency: `Real` talks to the store over HTTP; `Stub` is a
/// no-op used when the store is disabled in configuration. Per §9 Design
/// Notes, availability/fallback behavior is driven off this tag rather
/// than introspected at runtime.
pub enum Client {
    Real(HttpStore),
    Stub(StubStore),
}

impl Client {
    pub fn is_stub(&self) -> bool {
        matches!(self, Client::Stub(_))
    }

    pub async fn execute(&self, sql: &str, params: &HashMap<String, Value>) -> Result<Vec<Row>, Error> {
        match self {
            Client::Real(c) => c.execute(sql, params).await,
            Client::Stub(c) => c.execute(sql, params).await,
        }
    }

    pub async fn bulk_insert(&self, table: &str, records: &[Row]) -> Result<(), BulkError> {
        match self {
            Client::Real(c) => c.bulk_insert(table, records).await,
            Client::Stub(c) => c.bulk_insert(table, records).await,
        }
    }

    pub async fn health_check(&self) -> Result<HealthStatus, Error> {
        match self {
            Client::Real(c) => c.health_check().await,
            Client::Stub(c) => c.health_check().await,
        }
    }
}
