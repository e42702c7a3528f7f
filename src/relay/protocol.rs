//! Wire shapes for the two sides of the relay.
//!
//! Clients speak plain CDP framing: `{id, method, params, sessionId?}`
//! requests, `{id, result|error}` responses, `{method, params, sessionId?}`
//! events. The extension side uses the same JSON but with relay-assigned
//! numeric ids; frames from it are either responses (have an `id`) or
//! events (have a `method`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{RelayError, Result};

/// WebSocket close codes used by the relay. The admission pair
/// (`UNAUTHORIZED`, `BAD_ORIGIN`) surfaces as HTTP 401/403 before the
/// upgrade; the others are sent as close frames on open sockets.
pub mod close {
    pub const SUPERSEDED: u16 = 4001;
    pub const EXTENSION_GONE: u16 = 4002;
    pub const SLOW_CONSUMER: u16 = 4008;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const BAD_ORIGIN: u16 = 4403;
}

/// Close code plus human-readable reason, delivered to a socket's writer
/// task when the relay decides to drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    pub const SUPERSEDED: CloseReason = CloseReason {
        code: close::SUPERSEDED,
        reason: "superseded by a new extension connection",
    };
    pub const EXTENSION_GONE: CloseReason = CloseReason {
        code: close::EXTENSION_GONE,
        reason: "extension disconnected",
    };
    pub const SLOW_CONSUMER: CloseReason = CloseReason {
        code: close::SLOW_CONSUMER,
        reason: "write queue overflow",
    };
    pub const SHUTTING_DOWN: CloseReason = CloseReason {
        code: 1001,
        reason: "relay shutting down",
    };
}

/// A CDP command as received from a client socket.
///
/// The `id` is echoed back verbatim in the response, so it is kept as a raw
/// JSON value rather than forced to a number.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientCommand {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

/// CDP error payload: `{code?, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
}

impl CdpError {
    pub fn server(message: impl Into<String>) -> Self {
        Self {
            code: Some(-32000),
            message: message.into(),
        }
    }
}

/// A frame read from the extension socket, classified by shape: a response
/// to a relay-issued command carries the relay-assigned `id`; everything
/// else with a `method` is a CDP event.
#[derive(Debug)]
pub enum ExtensionFrame {
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<CdpError>,
    },
    Event {
        method: String,
        params: Value,
        session_id: Option<String>,
    },
}

impl ExtensionFrame {
    pub fn parse(raw: &str) -> Result<ExtensionFrame> {
        let value: Value = serde_json::from_str(raw)?;

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let error = match value.get("error") {
                Some(e) => Some(serde_json::from_value(e.clone())?),
                None => None,
            };
            return Ok(ExtensionFrame::Response {
                id,
                result: value.get("result").cloned(),
                error,
            });
        }

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RelayError::Other("Extension frame has neither id nor method".to_string())
            })?
            .to_string();

        Ok(ExtensionFrame::Event {
            method,
            params: value.get("params").cloned().unwrap_or(Value::Null),
            session_id: value
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}

/// Target metadata as carried in `Target.*` events. Fields the relay does
/// not interpret (browserContextId and friends) pass through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn with_session(mut frame: Value, session_id: Option<&str>) -> Value {
    if let (Some(sid), Some(obj)) = (session_id, frame.as_object_mut()) {
        obj.insert("sessionId".to_string(), Value::String(sid.to_string()));
    }
    frame
}

/// `{id, result, sessionId?}` serialized for a client socket.
pub fn response_frame(id: &Value, session_id: Option<&str>, result: Value) -> String {
    with_session(json!({ "id": id, "result": result }), session_id).to_string()
}

/// `{id, error, sessionId?}` serialized for a client socket.
pub fn error_frame(id: &Value, session_id: Option<&str>, error: &CdpError) -> String {
    with_session(json!({ "id": id, "error": error }), session_id).to_string()
}

/// `{method, params, sessionId?}` serialized for a client socket.
pub fn event_frame(method: &str, params: Value, session_id: Option<&str>) -> String {
    with_session(json!({ "method": method, "params": params }), session_id).to_string()
}

/// `{id, method, params, sessionId?}` serialized for the extension socket,
/// with the relay-assigned id.
pub fn extension_request_frame(
    relay_id: u64,
    method: &str,
    params: &Value,
    session_id: Option<&str>,
) -> String {
    with_session(
        json!({ "id": relay_id, "method": method, "params": params }),
        session_id,
    )
    .to_string()
}
