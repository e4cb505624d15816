//! Error types for the stdio JSON-RPC client.
//!
//! Every failure carries enough context to act on without inspecting the
//! client internals: captured stderr, the raw offending line, or the
//! structured error object reported by the server.

use std::time::Duration;

use thiserror::Error;

use crate::jsonrpc::JsonRpcError;

/// Errors produced by the transport and the RPC client.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be started.
    #[error("Failed to launch `{command}`: {source}")]
    Launch {
        /// Program that was being spawned
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A write was attempted after the transport was closed or the child exited.
    #[error("Transport is closed{}", format_stderr(.stderr))]
    TransportClosed {
        /// Stderr captured from a child that exited under the write, if any
        stderr: String,
    },

    /// The server closed its output before answering.
    #[error("No response from server{}", format_stderr(.stderr))]
    NoResponse {
        /// Whatever the server wrote to stderr before exiting
        stderr: String,
    },

    /// A line from the server was not a well-formed JSON-RPC message.
    #[error("Malformed message from server ({reason}): {line}")]
    Framing {
        /// What was wrong with the line
        reason: String,
        /// The raw line as received (lossily decoded if not UTF-8)
        line: String,
    },

    /// The server rejected the initialize handshake.
    #[error("Handshake failed {code}: {message}")]
    Handshake {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The server answered a request with an error object.
    #[error("Server error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The response identifier does not match the request just sent.
    #[error("Protocol violation: expected response id {expected}, got {actual}")]
    ProtocolViolation {
        expected: u64,
        /// The id as it appeared on the wire (`null` when absent)
        actual: String,
    },

    /// An operation was attempted before a successful handshake.
    #[error("Client not initialized")]
    NotInitialized,

    /// `initialize` was called on a connection that already completed it.
    #[error("Client already initialized")]
    AlreadyInitialized,

    /// The caller-imposed deadline expired; the server process was terminated.
    #[error("Request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The connection failed earlier and can no longer be used.
    #[error("Connection is unusable: {reason}")]
    Broken {
        /// Description of the failure that broke the connection
        reason: String,
    },

    /// I/O error while talking to the child process.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// A request could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(". Stderr: {}", trimmed)
    }
}

impl McpError {
    /// Build a `Remote` error from a JSON-RPC error object.
    pub fn remote(err: JsonRpcError) -> Self {
        McpError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }

    /// Build a `Handshake` error from a JSON-RPC error object.
    pub fn handshake(err: JsonRpcError) -> Self {
        McpError::Handshake {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }

    /// Whether this error leaves the connection unusable.
    ///
    /// Server-reported errors are not fatal: the exchange completed and the
    /// stream is still in sync. Everything else means the one-in-one-out
    /// ordering can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            McpError::Remote { .. }
                | McpError::Handshake { .. }
                | McpError::NotInitialized
                | McpError::AlreadyInitialized
                | McpError::Serialization(_)
        )
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => {
                McpError::TransportClosed {
                    stderr: String::new(),
                }
            }
            _ => McpError::Io(err),
        }
    }
}
