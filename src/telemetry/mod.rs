//! OTLP-gRPC telemetry consumer (spec §6). The teacher has no existing
//! telemetry-consumer code to learn from, so this reaches for the crates
//! the rest of the ecosystem uses for exactly this: `opentelemetry-proto`'s
//! generated `tonic` server stubs for the OTLP Logs service.

use std::collections::HashMap;
use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{LogsService, LogsServiceServer};
use opentelemetry_proto::tonic::collector::logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

pub const DEFAULT_OTLP_ADDR: &str = "127.0.0.1:4317";

/// One decoded `claude_code.*` log event: name, flattened attribute map,
/// and the timestamp OTel reports for it.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: HashMap<String, Value>,
}

fn any_value_to_json(value: &AnyValue) -> Value {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => Value::String(s.clone()),
        Some(any_value::Value::BoolValue(b)) => Value::Bool(*b),
        Some(any_value::Value::IntValue(i)) => Value::from(*i),
        Some(any_value::Value::DoubleValue(d)) => serde_json::Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
        Some(any_value::Value::BytesValue(b)) => Value::String(STANDARD.encode(b)),
        Some(any_value::Value::ArrayValue(arr)) => Value::Array(arr.values.iter().map(any_value_to_json).collect()),
        Some(any_value::Value::KvlistValue(kv)) => Value::Object(kv.values.iter().map(|e| (e.key.clone(), e.value.as_ref().map(any_value_to_json).unwrap_or(Value::Null))).collect()),
        None => Value::Null,
    }
}

fn attributes_to_map(attributes: &[KeyValue]) -> HashMap<String, Value> {
    attributes
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.as_ref().map(any_value_to_json).unwrap_or(Value::Null)))
        .collect()
}

fn nanos_to_datetime(nanos: u64) -> DateTime<Utc> {
    DateTime::from_timestamp((nanos / 1_000_000_000) as i64, (nanos % 1_000_000_000) as u32).unwrap_or_else(Utc::now)
}

/// The gRPC service implementation. Every decoded event is forwarded over
/// `tx`; a full channel drops the oldest-pressure event rather than
/// blocking the collector's export call (the OTLP spec expects a bounded
/// response time from `Export`).
struct LogsReceiver {
    tx: mpsc::Sender<TelemetryEvent>,
}

#[tonic::async_trait]
impl LogsService for LogsReceiver {
    async fn export(&self, request: Request<ExportLogsServiceRequest>) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let body = request.into_inner();
        for resource_logs in &body.resource_logs {
            for scope_logs in &resource_logs.scope_logs {
                for record in &scope_logs.log_records {
                    let attributes = attributes_to_map(&record.attributes);
                    let event_name = attributes
                        .get("event.name")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                        .or_else(|| record.body.as_ref().and_then(|b| b.value.as_ref()).and_then(|v| match v {
                            any_value::Value::StringValue(s) => Some(s.clone()),
                            _ => None,
                        }))
                        .unwrap_or_else(|| "claude_code.unknown".to_string());

                    let timestamp = nanos_to_datetime(record.time_unix_nano);
                    let event = TelemetryEvent { event_name, timestamp, attributes };

                    if self.tx.try_send(event).is_err() {
                        warn!("telemetry channel full, dropping event");
                    }
                }
            }
        }
        Ok(Response::new(ExportLogsServiceResponse { partial_success: None }))
    }
}

/// Runs the OTLP/gRPC log collector until `cancel` trips. Decoded events
/// are pushed onto `tx` for the bridge/store to consume.
pub async fn serve(addr: SocketAddr, tx: mpsc::Sender<TelemetryEvent>, cancel: CancellationToken) -> Result<(), tonic::transport::Error> {
    debug!(%addr, "starting OTLP log collector");
    let receiver = LogsReceiver { tx };
    Server::builder()
        .add_service(LogsServiceServer::new(receiver))
        .serve_with_shutdown(addr, async move { cancel.cancelled().await })
        .await
}
