//! Telemetry Bridge & Widget Manager (spec §4.5). Serves pre-computed,
//! TTL-cached widget snapshots over the store, detects when a dependency
//! is only a stub, and hosts the Data-Explorer SQL gateway.

pub mod explorer;
pub mod widgets;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Error;
use crate::store::Client;

pub use explorer::{ExplorerRequest, ExplorerResponse, RateLimiter};
pub use widgets::{DataSource, WidgetCache, WidgetKind, WidgetSnapshot};

/// The query each widget kind runs against the store. Intentionally
/// simple aggregates over the three ingest tables — the widget-specific
/// shaping happens in `shape_payload`, not in SQL.
fn sql_template(kind: WidgetKind) -> &'static str {
    match kind {
        WidgetKind::ErrorMonitor => {
            "SELECT tool_name, COUNT(*) AS error_count FROM tool_executions WHERE success = false GROUP BY tool_name ORDER BY error_count DESC LIMIT 20"
        }
        WidgetKind::CostTracker => "SELECT model_name, SUM(cost_usd) AS total_cost FROM messages GROUP BY model_name",
        WidgetKind::ToolOptimizer => {
            "SELECT tool_name, COUNT(*) AS calls, AVG(duration_ms) AS avg_duration_ms FROM tool_executions GROUP BY tool_name ORDER BY calls DESC"
        }
        WidgetKind::WorkflowPerformance => {
            "SELECT session_id, COUNT(*) AS messages, SUM(input_tokens + output_tokens) AS tokens FROM messages GROUP BY session_id"
        }
        WidgetKind::ContextRotMeter => "SELECT session_id, MAX(content_length) AS peak_content_length FROM messages GROUP BY session_id",
        WidgetKind::ConversationTimeline => "SELECT session_id, timestamp, role FROM messages ORDER BY timestamp DESC LIMIT 200",
        WidgetKind::CodePatternAnalysis => "SELECT language, COUNT(*) AS occurrences FROM file_accesses GROUP BY language",
        WidgetKind::ContentSearchWidget => "SELECT file_path, COUNT(*) AS touches FROM file_accesses GROUP BY file_path ORDER BY touches DESC LIMIT 50",
        WidgetKind::JsonlProcessingStatus => "SELECT COUNT(*) AS records FROM messages",
    }
}

async fn compute_widget(kind: WidgetKind, store: &Client) -> Result<Value, Error> {
    let rows = store.execute(sql_template(kind), &HashMap::new()).await?;
    Ok(json!({ "rows": rows }))
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct FreshnessEntry {
    pub last_generated_secs_ago: Option<f64>,
    pub generation_ms: u64,
    pub data_source: Option<String>,
    pub fallback_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FreshnessReport {
    pub widgets: HashMap<String, FreshnessEntry>,
    pub service_stubbed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WidgetHealth {
    pub stuck: Vec<String>,
    pub zeroed: Vec<String>,
}

/// Threshold past which a widget's age is reported as "stuck" in
/// `widget_health` — ten times its own TTL with no successful refresh.
fn stuck_threshold(kind: WidgetKind) -> Duration {
    kind.ttl() * 10
}

pub struct Bridge {
    store: std::sync::Arc<Client>,
    cache: RwLock<WidgetCache>,
}

impl Bridge {
    pub fn new(store: std::sync::Arc<Client>) -> Self {
        Self { store, cache: RwLock::new(WidgetCache::new()) }
    }

    pub fn store(&self) -> &Client {
        &self.store
    }

    /// §4.5.3: any stubbed dependency demotes every widget request to demo
    /// mode, suffixing the title and tagging the payload.
    fn service_stubbed(&self) -> bool {
        self.store.is_stub()
    }

    pub async fn get_widget(&self, kind: WidgetKind) -> WidgetSnapshot {
        if let Some(fresh) = self.cache.read().await.fresh(kind) {
            return fresh.clone();
        }

        let started = Instant::now();
        let stubbed = self.service_stubbed();

        match compute_widget(kind, &self.store).await {
            Ok(payload) => {
                let title = if stubbed { format!("{} (Demo)", kind.title()) } else { kind.title().to_string() };
                let snapshot = WidgetSnapshot {
                    kind,
                    title,
                    payload,
                    data_source: if stubbed { DataSource::Fallback } else { DataSource::Live },
                    fallback_mode: stubbed,
                    fallback_reason: None,
                    generation_ms: started.elapsed().as_millis() as u64,
                };
                self.cache.write().await.insert(kind, snapshot.clone());
                snapshot
            }
            Err(e) => {
                warn!(widget = ?kind, error = %e, "widget computation failed, serving stale snapshot");
                let cache = self.cache.read().await;
                if let Some(stale) = cache.stale(kind) {
                    let mut fallback = stale.clone();
                    fallback.data_source = DataSource::Cached;
                    fallback.fallback_mode = true;
                    fallback.fallback_reason = Some(e.to_string());
                    fallback
                } else {
                    WidgetSnapshot {
                        kind,
                        title: format!("{} (Demo)", kind.title()),
                        payload: Value::Null,
                        data_source: DataSource::Minimal,
                        fallback_mode: true,
                        fallback_reason: Some(e.to_string()),
                        generation_ms: started.elapsed().as_millis() as u64,
                    }
                }
            }
        }
    }

    pub async fn freshness_report(&self) -> FreshnessReport {
        let cache = self.cache.read().await;
        let mut widgets = HashMap::new();
        for kind in WidgetKind::ALL {
            let entry = match (cache.last_generated(kind), cache.stale(kind)) {
                (Some(inserted_at), Some(snapshot)) => FreshnessEntry {
                    last_generated_secs_ago: Some(inserted_at.elapsed().as_secs_f64()),
                    generation_ms: snapshot.generation_ms,
                    data_source: Some(format!("{:?}", snapshot.data_source)),
                    fallback_mode: snapshot.fallback_mode,
                },
                _ => FreshnessEntry::default(),
            };
            widgets.insert(format!("{:?}", kind), entry);
        }
        FreshnessReport { widgets, service_stubbed: self.service_stubbed() }
    }

    pub async fn widget_health(&self) -> WidgetHealth {
        let cache = self.cache.read().await;
        let mut stuck = Vec::new();
        let mut zeroed = Vec::new();
        for kind in WidgetKind::ALL {
            if let Some(inserted_at) = cache.last_generated(kind) {
                if inserted_at.elapsed() > stuck_threshold(kind) {
                    stuck.push(format!("{:?}", kind));
                }
            }
            if let Some(snapshot) = cache.stale(kind) {
                let is_zeroed = snapshot
                    .payload
                    .get("rows")
                    .and_then(Value::as_array)
                    .map(|rows| rows.is_empty())
                    .unwrap_or(true);
                if is_zeroed {
                    zeroed.push(format!("{:?}", kind));
                }
            }
        }
        WidgetHealth { stuck, zeroed }
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StubStore;

    #[tokio::test]
    async fn stubbed_store_marks_widgets_as_demo() {
        let bridge = Bridge::new(std::sync::Arc::new(Client::Stub(StubStore::default())));
        let snapshot = bridge.get_widget(WidgetKind::CostTracker).await;
        assert!(snapshot.fallback_mode);
        assert!(snapshot.title.ends_with("(Demo)"));
        assert_eq!(snapshot.data_source, DataSource::Fallback);
    }

    #[tokio::test]
    async fn second_request_within_ttl_is_served_from_cache() {
        let bridge = Bridge::new(std::sync::Arc::new(Client::Stub(StubStore::default())));
        let first = bridge.get_widget(WidgetKind::CostTracker).await;
        let second = bridge.get_widget(WidgetKind::CostTracker).await;
        assert_eq!(first.generation_ms, second.generation_ms);
    }

    #[tokio::test]
    async fn clear_cache_forces_a_fresh_compute() {
        let bridge = Bridge::new(std::sync::Arc::new(Client::Stub(StubStore::default())));
        bridge.get_widget(WidgetKind::CostTracker).await;
        bridge.clear_cache().await;
        let report = bridge.freshness_report().await;
        let entry = &report.widgets[&format!("{:?}", WidgetKind::CostTracker)];
        assert!(entry.last_generated_secs_ago.is_none());
    }

    #[tokio::test]
    async fn freshness_report_lists_every_widget_kind() {
        let bridge = Bridge::new(std::sync::Arc::new(Client::Stub(StubStore::default())));
        let report = bridge.freshness_report().await;
        assert_eq!(report.widgets.len(), WidgetKind::ALL.len());
    }
}
