//! MCP payload types exchanged over the JSON-RPC connection.
//!
//! These mirror the shapes fixed by the Model Context Protocol. Fields the
//! client never interprets (schemas, capability maps) stay as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version sent in the handshake unless configured otherwise.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Handshake method name.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Notification sent once the handshake succeeded.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
/// Capability discovery.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Tool invocation.
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Client identity sent in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

impl InitializeParams {
    /// Handshake parameters advertising root list-change support.
    pub fn new(protocol_version: impl Into<String>, client_info: ClientInfo) -> Self {
        Self {
            protocol_version: protocol_version.into(),
            capabilities: serde_json::json!({
                "roots": { "listChanged": true }
            }),
            client_info,
        }
    }
}

/// Server identity reported in the handshake result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Result of a successful `initialize`.
///
/// Every field is optional: minimal servers answer with `{}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A tool advertised by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema of the arguments; opaque to the client.
    #[serde(default)]
    pub input_schema: Value,
}

/// One page of a `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Parameters of a `tools/call` request.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams<'a> {
    pub name: &'a str,
    pub arguments: &'a Value,
}

/// Content block of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    /// Content types this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Typed view of a `tools/call` result.
///
/// The client returns results unstructured; callers that expect the usual
/// MCP shape can convert with [`CallToolResult::from_value`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// All text blocks joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
