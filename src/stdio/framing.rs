//! Newline-delimited JSON framing.
//!
//! Each message is a single JSON document on one line, UTF-8 encoded and
//! terminated by `\n`:
//!
//! ```text
//! {"jsonrpc":"2.0","id":1,"method":"tools/list"}\n
//! ```
//!
//! `serde_json` escapes control characters inside strings, so a serialized
//! value never contains a raw newline and needs no further escaping.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::McpError;
use crate::jsonrpc::Incoming;

/// Maximum line size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_LINE_SIZE: usize = 100 * 1024 * 1024;

/// Serialize `message` as one line and write it, flushing before returning.
///
/// # Errors
///
/// `TransportClosed` if the reading side has gone away, `Io` for any other
/// write failure.
pub async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<(), McpError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');

    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

/// Read the next non-blank line.
///
/// Returns `Ok(None)` at end-of-file. The trailing `\n` (and `\r`, for
/// servers writing CRLF) is stripped.
///
/// # Errors
///
/// `Framing` if the line is not valid UTF-8 or exceeds `MAX_LINE_SIZE`.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, McpError>
where
    R: AsyncBufRead + Unpin,
{
    read_line_capped(reader, MAX_LINE_SIZE).await
}

/// Bytes of an oversized line kept in the error.
const OVERSIZED_PREVIEW: usize = 256;

async fn read_line_capped<R>(reader: &mut R, max_len: usize) -> Result<Option<String>, McpError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut buf = Vec::new();
        let bytes_read = (&mut *reader)
            .take(max_len as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if buf.len() > max_len {
            let end = buf.len().min(OVERSIZED_PREVIEW);
            let preview = String::from_utf8_lossy(&buf[..end]).into_owned();
            return Err(McpError::Framing {
                reason: format!("line exceeds maximum {} bytes", max_len),
                line: preview,
            });
        }

        let line = String::from_utf8(buf).map_err(|e| McpError::Framing {
            reason: "invalid UTF-8".to_string(),
            line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })?;

        if line.trim().is_empty() {
            continue;
        }

        return Ok(Some(line));
    }
}

/// Parse a line into a classified JSON-RPC message.
pub fn decode(line: &str) -> Result<Incoming, McpError> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| McpError::Framing {
        reason: format!("invalid JSON: {}", e),
        line: line.to_string(),
    })?;

    Incoming::from_value(value).map_err(|reason| McpError::Framing {
        reason,
        line: line.to_string(),
    })
}
