//! JSON-RPC 2.0 message types.
//!
//! Requests and notifications are serialized with serde. Incoming lines are
//! classified by hand from a `serde_json::Value` because the distinction
//! between `"result": null` and a missing `result` matters, and serde's
//! `Option<Value>` collapses the two.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// An outgoing JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// An outgoing notification (no id, never answered).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error object of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Either side of a response: a result payload or an error object, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(JsonRpcError),
}

/// A response read from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// The `id` field exactly as received (`Value::Null` when absent).
    pub id: Value,
    pub outcome: Outcome,
}

impl JsonRpcResponse {
    /// The identifier as an integer, if it is one.
    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

/// Anything the server may write on its output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(JsonRpcResponse),
    /// Server-originated message carrying a method and no id.
    Notification { method: String, params: Option<Value> },
}

impl Incoming {
    /// Classify a parsed line.
    ///
    /// Returns a human-readable reason on failure; the caller attaches the
    /// raw line. The `jsonrpc` tag is not required: several servers omit it
    /// and it carries no information for correlation.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err("message is not a JSON object".to_string());
        };

        if let Some(tag) = obj.get("jsonrpc") {
            if tag.as_str() != Some(JSONRPC_VERSION) {
                return Err(format!("unsupported jsonrpc version {}", tag));
            }
        }

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| "method is not a string".to_string())?
                .to_string();
            // `"id": null` is how some servers spell a notification
            if obj.get("id").is_some_and(|id| !id.is_null()) {
                return Err(format!("unexpected request from server: {}", method));
            }
            return Ok(Incoming::Notification {
                method,
                params: obj.remove("params"),
            });
        }

        let id = obj.remove("id").unwrap_or(Value::Null);
        let outcome = match (obj.remove("result"), obj.remove("error")) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => Outcome::Error(parse_error_object(error)?),
            (Some(_), Some(_)) => {
                return Err("response carries both result and error".to_string())
            }
            (None, None) => return Err("response has neither result nor error".to_string()),
        };

        Ok(Incoming::Response(JsonRpcResponse { id, outcome }))
    }
}

fn parse_error_object(error: Value) -> Result<JsonRpcError, String> {
    if !error.is_object() {
        return Err(format!("error field is not an object: {}", error));
    }
    serde_json::from_value(error).map_err(|e| format!("malformed error object: {}", e))
}
