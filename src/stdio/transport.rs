//! Child-process transport: one JSON document per line over stdin/stdout.
//!
//! The transport owns the child process and all three of its standard
//! streams. Nothing else may read or write them.
//!
//! # Process Cleanup Safety
//!
//! The child is spawned with `kill_on_drop`, so a transport dropped without
//! `close()` (for example because the handshake failed) does not leave an
//! orphaned server behind.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::jsonrpc::Incoming;
use crate::stdio::framing;

/// How much of the child's stderr is retained for diagnostics (tail kept).
pub const MAX_STDERR_CAPTURE: usize = 64 * 1024;

/// How long to wait for stderr to reach EOF once stdout has closed.
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Background reader for the child's stderr.
///
/// Stderr is drained continuously so a chatty server never blocks on a full
/// pipe; each line is logged and the tail is kept for error reports.
struct StderrCapture {
    buffer: Arc<Mutex<String>>,
    task: Option<JoinHandle<()>>,
}

impl StderrCapture {
    fn spawn(stderr: ChildStderr, label: String) -> Self {
        let buffer = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let mut segments = BufReader::new(stderr).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(bytes)) => {
                        let line = String::from_utf8_lossy(&bytes);
                        let line = line.trim_end_matches('\r');
                        debug!(server = %label, "stderr: {}", line);
                        if let Ok(mut buf) = sink.lock() {
                            append_capped(&mut buf, line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(server = %label, "Failed to read server stderr: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            buffer,
            task: Some(task),
        }
    }

    /// Wait briefly for the reader to hit EOF, then return what was captured.
    async fn drain(&mut self) -> String {
        if let Some(task) = self.task.take() {
            let _ = timeout(STDERR_DRAIN_GRACE, task).await;
        }
        self.snapshot()
    }

    fn snapshot(&self) -> String {
        self.buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }
}

/// Append a line, dropping the oldest text beyond `MAX_STDERR_CAPTURE`.
fn append_capped(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');

    if buf.len() > MAX_STDERR_CAPTURE {
        let mut cut = buf.len() - MAX_STDERR_CAPTURE;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// Newline-delimited JSON transport over a child's standard streams.
pub struct StdioTransport {
    /// Command line, used in logs
    label: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<StderrCapture>,
}

impl StdioTransport {
    /// Launch the server process described by `config`.
    ///
    /// Must be called from within a tokio runtime (the stderr reader is a
    /// spawned task).
    ///
    /// # Errors
    ///
    /// `Launch` if the executable cannot be found or spawned.
    pub fn start(config: &ServerConfig) -> Result<Self, McpError> {
        let label = config.display_command();
        info!("Starting MCP server: {}", label);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !config.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&config.env);

        let mut child = cmd.spawn().map_err(|source| McpError::Launch {
            command: config.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(config, "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe(config, "stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| missing_pipe(config, "stderr"))?;

        debug!("MCP server started (pid: {:?})", child.id());

        Ok(Self {
            stderr: Some(StderrCapture::spawn(stderr, label.clone())),
            label,
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
        })
    }

    /// OS process id of the server, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_closed(&self) -> bool {
        self.child.is_none()
    }

    /// Write one message as a single line and flush it to the pipe.
    ///
    /// # Errors
    ///
    /// `TransportClosed` if the transport was closed or the child stopped
    /// reading its input. In the latter case the error carries whatever the
    /// child wrote to stderr before it went away.
    pub async fn write_line<T: Serialize>(&mut self, message: &T) -> Result<(), McpError> {
        let stdin = self.stdin.as_mut().ok_or_else(closed)?;

        match framing::write_line(stdin, message).await {
            Err(McpError::TransportClosed { .. }) => {
                warn!("MCP server stdin closed ({})", self.label);
                let stderr = match self.stderr.as_mut() {
                    Some(capture) => capture.drain().await,
                    None => String::new(),
                };
                Err(McpError::TransportClosed { stderr })
            }
            other => other,
        }
    }

    /// Block until the next line arrives and decode it.
    ///
    /// # Errors
    ///
    /// - `NoResponse` at end-of-file, carrying the server's captured stderr
    /// - `Framing` for a non-UTF-8 or unparseable line, carrying the raw line
    /// - `TransportClosed` if the transport was already closed
    pub async fn read_line(&mut self) -> Result<Incoming, McpError> {
        let stdout = self.stdout.as_mut().ok_or_else(closed)?;

        match framing::read_line(stdout).await? {
            Some(line) => {
                trace!(server = %self.label, "<- {}", line);
                framing::decode(&line)
            }
            None => {
                warn!("MCP server stdout closed ({})", self.label);
                let stderr = match self.stderr.as_mut() {
                    Some(capture) => capture.drain().await,
                    None => String::new(),
                };
                Err(McpError::NoResponse { stderr })
            }
        }
    }

    /// Close stdin, wait for the child to exit, then release the other streams.
    ///
    /// There is no forced timeout; wrap the call in `tokio::time::timeout`
    /// and fall back to [`StdioTransport::kill`] if needed. Closing an
    /// already-closed transport is a no-op and returns `Ok(None)`.
    pub async fn close(&mut self) -> Result<Option<ExitStatus>, McpError> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        // EOF on stdin tells the server no more requests are coming
        drop(self.stdin.take());

        let status = child.wait().await.map_err(McpError::Io)?;

        self.stdout.take();
        if let Some(mut capture) = self.stderr.take() {
            capture.drain().await;
        }

        info!("MCP server exited ({}): {}", self.label, status);
        Ok(Some(status))
    }

    /// Terminate the child immediately. Used when a caller deadline expires.
    pub async fn kill(&mut self) -> Result<(), McpError> {
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();

        if let Some(mut child) = self.child.take() {
            warn!("Killing MCP server ({})", self.label);
            child.kill().await.map_err(McpError::Io)?;
        }

        Ok(())
    }
}

fn closed() -> McpError {
    McpError::TransportClosed {
        stderr: String::new(),
    }
}

fn missing_pipe(config: &ServerConfig, stream: &str) -> McpError {
    McpError::Launch {
        command: config.command.clone(),
        source: std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to get {} handle", stream),
        ),
    }
}
