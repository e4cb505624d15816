//! mcp-stdio library
//!
//! A small JSON-RPC-over-stdio client for driving MCP tool servers:
//!
//! - `stdio` - child-process transport and the `McpClient` built on it
//! - `jsonrpc` - JSON-RPC 2.0 message types
//! - `models` - MCP payloads (tool descriptors, handshake, tool results)
//! - `config` - per-server launch configuration
//! - `error` - the `McpError` taxonomy
//!
//! ```ignore
//! use mcp_stdio::{McpClient, ServerConfig};
//!
//! let config = ServerConfig::new("docker")
//!     .with_args(["exec", "-i", "mcp-demo-github-mcp-1", "node", "src/index.js"]);
//! let client = McpClient::connect(config).await?;
//! let tools = client.list_capabilities().await?;
//! client.close().await?;
//! ```

pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod models;
pub mod stdio;

pub use config::{ServerConfig, ServersFile};
pub use error::McpError;
pub use models::{CallToolResult, Content, ToolDescriptor};
pub use stdio::{McpClient, StdioTransport};
