//! JSON-RPC client for MCP tool servers running as child processes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     stdin / stdout      ┌─────────────────────┐
//! │   McpClient     │  ◄────────────────────► │  tool server        │
//! │ (StdioTransport)│   newline-delimited     │  (child process)    │
//! └─────────────────┘   JSON-RPC 2.0          └─────────────────────┘
//!                     ◄──── stderr (diagnostics only)
//! ```
//!
//! # Protocol
//!
//! One JSON object per line, UTF-8, terminated by `\n`:
//!
//! ```text
//! {"jsonrpc":"2.0","id":1,"method":"initialize","params":{...}}
//! {"jsonrpc":"2.0","id":1,"result":{...}}
//! ```
//!
//! Calls are strictly sequential per connection: a request is written, its
//! response is read, and only then is the next request sent.

mod client;
mod framing;
mod transport;

pub use client::McpClient;
pub use framing::{decode, read_line, write_line, MAX_LINE_SIZE};
pub use transport::{StdioTransport, MAX_STDERR_CAPTURE};
