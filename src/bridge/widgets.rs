//! Widget kinds and per-widget snapshot cache (spec §4.5.1–§4.5.2). The
//! TTL cache generalizes `cursor::cache::is_cache_stale`'s mtime-delta
//! staleness check from one cursor-token cache file to an in-memory map.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

const COUNTER_TTL: Duration = Duration::from_secs(30);
const AGGREGATE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    ErrorMonitor,
    CostTracker,
    ToolOptimizer,
    WorkflowPerformance,
    ContextRotMeter,
    ConversationTimeline,
    CodePatternAnalysis,
    ContentSearchWidget,
    JsonlProcessingStatus,
}

impl WidgetKind {
    pub const ALL: [WidgetKind; 9] = [
        WidgetKind::ErrorMonitor,
        WidgetKind::CostTracker,
        WidgetKind::ToolOptimizer,
        WidgetKind::WorkflowPerformance,
        WidgetKind::ContextRotMeter,
        WidgetKind::ConversationTimeline,
        WidgetKind::CodePatternAnalysis,
        WidgetKind::ContentSearchWidget,
        WidgetKind::JsonlProcessingStatus,
    ];

    /// Counters (cheap row-count style widgets) get the short TTL;
    /// analytical aggregates get the longer one.
    pub fn ttl(&self) -> Duration {
        match self {
            WidgetKind::ErrorMonitor | WidgetKind::CostTracker | WidgetKind::JsonlProcessingStatus => COUNTER_TTL,
            _ => AGGREGATE_TTL,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            WidgetKind::ErrorMonitor => "Error Monitor",
            WidgetKind::CostTracker => "Cost Tracker",
            WidgetKind::ToolOptimizer => "Tool Optimizer",
            WidgetKind::WorkflowPerformance => "Workflow Performance",
            WidgetKind::ContextRotMeter => "Context Rot Meter",
            WidgetKind::ConversationTimeline => "Conversation Timeline",
            WidgetKind::CodePatternAnalysis => "Code Pattern Analysis",
            WidgetKind::ContentSearchWidget => "Content Search",
            WidgetKind::JsonlProcessingStatus => "JSONL Processing Status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Computed against a live, non-stub store.
    Live,
    /// A previous live snapshot served stale because a fresh compute failed.
    Cached,
    /// Synthesized placeholder data from a stub/demo store, not a real read.
    Fallback,
    /// No prior snapshot exists and compute failed; payload is empty.
    Minimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct WidgetSnapshot {
    pub kind: WidgetKind,
    pub title: String,
    pub payload: Value,
    pub data_source: DataSource,
    pub fallback_mode: bool,
    pub fallback_reason: Option<String>,
    pub generation_ms: u64,
}

struct CacheEntry {
    snapshot: WidgetSnapshot,
    inserted_at: Instant,
}

/// Per-widget memoization guarded by a single lock — readers take a
/// shared borrow, writers replace one entry with an atomic pointer swap.
#[derive(Default)]
pub struct WidgetCache {
    entries: HashMap<WidgetKind, CacheEntry>,
}

impl WidgetCache {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn fresh(&self, kind: WidgetKind) -> Option<&WidgetSnapshot> {
        self.entries.get(&kind).and_then(|e| {
            if e.inserted_at.elapsed() < kind.ttl() {
                Some(&e.snapshot)
            } else {
                None
            }
        })
    }

    pub fn stale(&self, kind: WidgetKind) -> Option<&WidgetSnapshot> {
        self.entries.get(&kind).map(|e| &e.snapshot)
    }

    pub fn insert(&mut self, kind: WidgetKind, snapshot: WidgetSnapshot) {
        self.entries.insert(kind, CacheEntry { snapshot, inserted_at: Instant::now() });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn last_generated(&self, kind: WidgetKind) -> Option<Instant> {
        self.entries.get(&kind).map(|e| e.inserted_at)
    }
}
