//! Minimal HTTP surface for the Data-Explorer gateway and health/freshness
//! endpoints (spec §4.5.4, §4.5.5). The full dashboard UI is an explicit
//! non-goal; this hosts only the API routes, reusing the teacher's
//! `dashboard::mod::run` CORS/security-header/host-validation middleware
//! stack verbatim in spirit.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::bridge::{Bridge, ExplorerRequest, RateLimiter};
use crate::orchestrator::registry::Registry;

#[derive(Clone)]
pub struct ApiState {
    pub bridge: Arc<Bridge>,
    pub explorer_limiter: Arc<RateLimiter>,
    pub registry: Arc<Registry>,
}

pub fn router(state: ApiState, bound_port: u16) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            format!("http://127.0.0.1:{bound_port}").parse().unwrap(),
            format!("http://localhost:{bound_port}").parse().unwrap(),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/api/widgets/:kind", axum::routing::get(get_widget))
        .route("/api/explorer/query", axum::routing::post(explorer_query))
        .route("/api/freshness", axum::routing::get(freshness))
        .route("/api/health", axum::routing::get(widget_health))
        .route("/api/services", axum::routing::get(services))
        .route("/api/cache/clear", axum::routing::post(clear_cache))
        .layer(cors)
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(validate_host))
        .with_state(state)
}

async fn validate_host(req: Request<axum::body::Body>, next: Next) -> Response {
    let host = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()).unwrap_or("");
    let hostname = host.split(':').next().unwrap_or("");
    if !matches!(hostname, "127.0.0.1" | "localhost" | "[::1]" | "") {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await
}

async fn security_headers(req: Request<axum::body::Body>, next: Next) -> Response {
    let is_api = req.uri().path().starts_with("/api/");
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert(
        "Content-Security-Policy",
        "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; connect-src 'self'; img-src 'self' data:; font-src 'self'"
            .parse()
            .unwrap(),
    );
    if is_api {
        headers.insert("Cache-Control", "no-store".parse().unwrap());
    }
    response
}

async fn get_widget(State(state): State<ApiState>, axum::extract::Path(kind): axum::extract::Path<String>) -> impl IntoResponse {
    let Some(widget_kind) = parse_widget_kind(&kind) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown widget kind"}))).into_response();
    };
    let snapshot = state.bridge.get_widget(widget_kind).await;
    Json(snapshot).into_response()
}

fn parse_widget_kind(raw: &str) -> Option<crate::bridge::WidgetKind> {
    use crate::bridge::WidgetKind::*;
    Some(match raw {
        "error_monitor" => ErrorMonitor,
        "cost_tracker" => CostTracker,
        "tool_optimizer" => ToolOptimizer,
        "workflow_performance" => WorkflowPerformance,
        "context_rot_meter" => ContextRotMeter,
        "conversation_timeline" => ConversationTimeline,
        "code_pattern_analysis" => CodePatternAnalysis,
        "content_search_widget" => ContentSearchWidget,
        "jsonl_processing_status" => JsonlProcessingStatus,
        _ => return None,
    })
}

async fn explorer_query(State(state): State<ApiState>, Json(request): Json<ExplorerRequest>) -> impl IntoResponse {
    let response = crate::bridge::explorer::run_query(state.bridge.store(), &state.explorer_limiter, request).await;
    Json(response)
}

async fn freshness(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.bridge.freshness_report().await)
}

async fn widget_health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.bridge.widget_health().await)
}

async fn clear_cache(State(state): State<ApiState>) -> impl IntoResponse {
    state.bridge.clear_cache().await;
    StatusCode::NO_CONTENT
}

async fn services(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.all() {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_widget_kind_accepts_every_closed_set_member() {
        for raw in [
            "error_monitor",
            "cost_tracker",
            "tool_optimizer",
            "workflow_performance",
            "context_rot_meter",
            "conversation_timeline",
            "code_pattern_analysis",
            "content_search_widget",
            "jsonl_processing_status",
        ] {
            assert!(parse_widget_kind(raw).is_some(), "{raw} should parse");
        }
    }

    #[test]
    fn parse_widget_kind_rejects_unknown_strings() {
        assert!(parse_widget_kind("not_a_widget").is_none());
    }
}
