use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::instrument;

use crate::breaker::{CircuitBreaker, RetryPolicy};
use crate::error::Error;

use super::{BulkError, HealthStatus, Row, DEFAULT_MAX_BATCH};

/// Typed client for the external columnar store, speaking a SQL-like
/// dialect over HTTP. Every call passes through a dedicated breaker (§4.2).
pub struct HttpStore {
    base_url: String,
    http: reqwest::Client,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    max_batch: usize,
    query_timeout: Duration,
}

#[derive(serde::Serialize)]
struct QueryRequest<'a> {
    sql: &'a str,
    params: &'a HashMap<String, Value>,
}

#[derive(serde::Deserialize)]
struct QueryResponse {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            breaker: CircuitBreaker::new("store", 5, Duration::from_secs(30)),
            retry: RetryPolicy::default(),
            max_batch: DEFAULT_MAX_BATCH,
            query_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    #[instrument(skip(self, params), fields(sql_len = sql.len()))]
    pub async fn execute(&self, sql: &str, params: &HashMap<String, Value>) -> Result<Vec<Row>, Error> {
        let url = format!("{}/query", self.base_url);
        let body = QueryRequest { sql, params };

        let resp: QueryResponse = self
            .retry
            .call(&self.breaker, || async {
                let resp = tokio::time::timeout(self.query_timeout, self.http.post(&url).json(&body).send())
                    .await
                    .map_err(|_| Error::Transient("query deadline exceeded".to_string()))?
                    .map_err(Error::from)?;

                if !resp.status().is_success() {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return if status.is_server_error() {
                        Err(Error::Transient(format!("store returned {status}: {text}")))
                    } else {
                        Err(Error::Permanent(format!("store returned {status}: {text}")))
                    };
                }
                resp.json::<QueryResponse>().await.map_err(Error::from)
            })
            .await?;

        Ok(rows_from_columns(resp.columns, resp.data))
    }

    /// Sends `records` to `table` in chunks of at most `max_batch` rows, so
    /// a single statement never exceeds the store's request-size limit.
    #[instrument(skip(self, records), fields(table, n = records.len()))]
    pub async fn bulk_insert(&self, table: &str, records: &[Row]) -> Result<(), BulkError> {
        let mut accepted = 0usize;
        let mut rejected = Vec::new();

        for (chunk_idx, chunk) in records.chunks(self.max_batch).enumerate() {
            let url = format!("{}/insert/{table}", self.base_url);
            let offset = chunk_idx * self.max_batch;

            let result = self
                .retry
                .call(&self.breaker, || async {
                    let resp = self
                        .http
                        .post(&url)
                        .json(&serde_json::json!({ "rows": chunk }))
                        .send()
                        .await
                        .map_err(Error::from)?;
                    if !resp.status().is_success() {
                        let status = resp.status();
                        return if status.is_server_error() {
                            Err(Error::Transient(format!("insert returned {status}")))
                        } else {
                            Err(Error::Permanent(format!("insert returned {status}")))
                        };
                    }
                    Ok(())
                })
                .await;

            match result {
                Ok(()) => accepted += chunk.len(),
                Err(e) => {
                    for i in 0..chunk.len() {
                        rejected.push((offset + i, e.to_string()));
                    }
                }
            }
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(BulkError { accepted_count: accepted, rejected })
        }
    }

    pub async fn health_check(&self) -> Result<HealthStatus, Error> {
        let start = Instant::now();
        let mut params = HashMap::new();
        params.insert("probe".to_string(), Value::from(1));
        let result = self.execute("SELECT 1", &params).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(_) => Ok(HealthStatus { ok: true, latency_ms, version: None }),
            Err(_) => Ok(HealthStatus { ok: false, latency_ms, version: None }),
        }
    }
}

fn rows_from_columns(columns: Vec<String>, data: Vec<Vec<Value>>) -> Vec<Row> {
    data.into_iter()
        .map(|row| {
            columns
                .iter()
                .cloned()
                .zip(row.into_iter())
                .collect::<Row>()
        })
        .collect()
}
