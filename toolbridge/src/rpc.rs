use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{instrument, warn};

use crate::errors::ToolbridgeError;
use crate::tools::{ToolKind, ToolRegistry};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Value,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Value, code: i64, message: &str, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data,
            }),
            id,
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// JSON-RPC 2.0 dispatcher over the tool registry. Works on raw bytes so a
/// payload that fails to parse can still be answered with a well-formed
/// envelope carrying `id: null`.
pub struct Dispatcher {
    registry: ToolRegistry,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    /// Registered tool names, in registration order. Stable across calls.
    pub fn tool_names(&self) -> Vec<&'static str> {
        ToolKind::all().iter().map(|kind| kind.name()).collect()
    }

    #[instrument(skip(self, raw))]
    pub async fn handle(&self, raw: &[u8]) -> Vec<u8> {
        let response = self.dispatch(raw).await;
        match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to serialize rpc response");
                br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"internal error"},"id":null}"#
                    .to_vec()
            }
        }
    }

    async fn dispatch(&self, raw: &[u8]) -> RpcResponse {
        // Validation is ordered and short-circuiting: parse, version, method
        // shape, params shape, then method lookup. Each request is fully
        // independent; there is no cross-request state.
        let payload: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(err) => {
                return RpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    "parse error",
                    Some(json!({ "detail": err.to_string() })),
                );
            }
        };
        let Some(envelope) = payload.as_object() else {
            return RpcResponse::error(
                Value::Null,
                INVALID_REQUEST,
                "request must be a JSON object",
                None,
            );
        };
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);

        match envelope.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => {}
            _ => {
                return RpcResponse::error(id, INVALID_REQUEST, "invalid jsonrpc version", None);
            }
        }

        let method = match envelope.get("method").and_then(Value::as_str) {
            Some(method) if !method.is_empty() => method,
            _ => {
                return RpcResponse::error(
                    id,
                    INVALID_REQUEST,
                    "method must be a non-empty string",
                    None,
                );
            }
        };

        let params = match envelope.get("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(_) => {
                return RpcResponse::error(id, INVALID_PARAMS, "params must be an object", None);
            }
        };

        let Some(kind) = ToolKind::parse(method) else {
            return RpcResponse::error(id, METHOD_NOT_FOUND, "method not found", None);
        };

        // Timed around the invocation only so the meta block reflects tool
        // cost rather than protocol overhead.
        let started = Instant::now();
        match self.registry.invoke(kind, params).await {
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_millis();
                RpcResponse::success(id, attach_meta(result, kind, elapsed_ms))
            }
            Err(err) => {
                let (code, message) = map_error(&err);
                RpcResponse::error(id, code, &message, None)
            }
        }
    }
}

fn attach_meta(result: Value, kind: ToolKind, elapsed_ms: u128) -> Value {
    let meta = json!({
        "tool": kind.name(),
        "execution_time_ms": elapsed_ms,
        "timestamp": Utc::now().to_rfc3339(),
    });
    match result {
        Value::Object(mut map) => {
            map.insert("_meta".to_string(), meta);
            Value::Object(map)
        }
        other => json!({ "value": other, "_meta": meta }),
    }
}

fn map_error(err: &ToolbridgeError) -> (i64, String) {
    match err {
        ToolbridgeError::InvalidParams(_) => (INVALID_PARAMS, err.to_string()),
        ToolbridgeError::InvalidExpression(_)
        | ToolbridgeError::TableNotAllowed(_)
        | ToolbridgeError::ColumnNameInvalid(_)
        | ToolbridgeError::MissingRequiredField(_)
        | ToolbridgeError::PromptRejected(_)
        | ToolbridgeError::Database(_)
        | ToolbridgeError::CompletionFailed(_) => (SERVER_ERROR, err.to_string()),
        _ => (INTERNAL_ERROR, "internal error".to_string()),
    }
}
