//! The plain HTTP routes sharing the relay's listener: build version,
//! extension status, and the fire-and-forget logging sink.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::relay::state::Relay;

pub(crate) async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub(crate) async fn extension_status(State(relay): State<Arc<Relay>>) -> Json<Value> {
    let connected = relay.extension_connected().await;
    let targets: Vec<Value> = relay
        .target_snapshot()
        .await
        .into_iter()
        .filter_map(|(info, session_id)| {
            let mut value = serde_json::to_value(info).ok()?;
            if let (Some(session_id), Some(obj)) = (session_id, value.as_object_mut()) {
                obj.insert("sessionId".to_string(), Value::String(session_id));
            }
            Some(value)
        })
        .collect();
    Json(json!({ "connected": connected, "targets": targets }))
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    #[serde(default)]
    level: String,
    #[serde(default)]
    args: Vec<Value>,
}

/// Append-only sink for client-side status reports. Always answers 204;
/// malformed payloads are swallowed.
pub(crate) async fn mcp_log(body: Bytes) -> StatusCode {
    match serde_json::from_slice::<LogEntry>(&body) {
        Ok(entry) => {
            let message = entry
                .args
                .iter()
                .map(render_arg)
                .collect::<Vec<_>>()
                .join(" ");
            match entry.level.as_str() {
                "error" => error!(target: "mcp", "{}", message),
                "warn" | "warning" => warn!(target: "mcp", "{}", message),
                "debug" | "trace" => debug!(target: "mcp", "{}", message),
                _ => info!(target: "mcp", "{}", message),
            }
        }
        Err(e) => debug!(error = %e, "Ignoring malformed mcp-log payload"),
    }
    StatusCode::NO_CONTENT
}

fn render_arg(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_tolerates_missing_fields() {
        let entry: LogEntry = serde_json::from_str("{}").unwrap();
        assert!(entry.level.is_empty());
        assert!(entry.args.is_empty());

        let entry: LogEntry =
            serde_json::from_str(r#"{"level":"warn","args":["a",{"b":1},2]}"#).unwrap();
        assert_eq!(entry.level, "warn");
        assert_eq!(entry.args.len(), 3);
    }

    #[test]
    fn strings_render_bare_and_values_render_as_json() {
        assert_eq!(render_arg(&json!("hello")), "hello");
        assert_eq!(render_arg(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(render_arg(&json!(42)), "42");
    }

    #[tokio::test]
    async fn sink_swallows_malformed_bodies() {
        assert_eq!(
            mcp_log(Bytes::from_static(b"not json")).await,
            StatusCode::NO_CONTENT
        );
        assert_eq!(
            mcp_log(Bytes::from_static(br#"{"level":"info","args":["ok"]}"#)).await,
            StatusCode::NO_CONTENT
        );
    }
}
