//! MCP client: handshake and request/response correlation over a
//! [`StdioTransport`].
//!
//! The transport is a strictly ordered one-in-one-out pipe, so the N-th line
//! read answers the N-th request written. The client still checks every
//! response id against the id it just sent and refuses to continue on a
//! mismatch rather than misattributing a response.

use std::collections::HashSet;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{Incoming, JsonRpcNotification, JsonRpcRequest, Outcome};
use crate::models::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsResult,
    ToolDescriptor, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::stdio::transport::StdioTransport;

/// State of one logical session with a server.
struct Connection {
    transport: StdioTransport,
    /// Last identifier handed out; incremented before each use, never reset.
    last_id: u64,
    initialized: bool,
    server: Option<InitializeResult>,
    /// Id of a request whose response has not been read yet.
    in_flight: Option<u64>,
    /// First fatal error seen on this connection.
    failure: Option<String>,
}

impl Connection {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Refuse to touch the transport once the stream can't be trusted.
    fn ensure_usable(&self) -> Result<(), McpError> {
        if let Some(reason) = &self.failure {
            return Err(McpError::Broken {
                reason: reason.clone(),
            });
        }
        if let Some(id) = self.in_flight {
            return Err(McpError::Broken {
                reason: format!("request {} was abandoned before its response arrived", id),
            });
        }
        if self.transport.is_closed() {
            return Err(McpError::TransportClosed {
                stderr: String::new(),
            });
        }
        Ok(())
    }

    fn record(&mut self, err: &McpError) {
        if err.is_fatal() && self.failure.is_none() {
            self.failure = Some(err.to_string());
        }
    }

    /// Write one request and read its response.
    async fn exchange(&mut self, request: &JsonRpcRequest) -> Result<Outcome, McpError> {
        self.in_flight = Some(request.id);
        self.transport.write_line(request).await?;

        let response = loop {
            match self.transport.read_line().await? {
                Incoming::Response(resp) => break resp,
                Incoming::Notification { method, .. } => {
                    debug!("Skipping server notification {} while awaiting {}", method, request.id);
                }
            }
        };
        self.in_flight = None;

        if response.id_u64() != Some(request.id) {
            return Err(McpError::ProtocolViolation {
                expected: request.id,
                actual: response.id.to_string(),
            });
        }

        Ok(response.outcome)
    }
}

/// Client for a single MCP server reached over stdio.
///
/// Calls take `&self` and are serialized on a per-connection lock, so a
/// client can be shared between tasks (e.g. behind an `Arc`) without
/// breaking the one-in-one-out ordering. Independent clients share nothing
/// and may run fully in parallel.
///
/// # Connection Lifecycle
///
/// - `start()` - spawn the server, no handshake yet
/// - `connect()` - spawn and perform the handshake
/// - `initialize()` - the handshake; must succeed before any other call
/// - `list_capabilities()` / `invoke()` - correlated calls
/// - `close()` - terminate the server; a call still waiting on the server
///   fails with `Broken` instead of holding `close()` up
///
/// # Example
///
/// ```ignore
/// use mcp_stdio::{McpClient, ServerConfig};
/// use serde_json::json;
///
/// let config = ServerConfig::new("node").with_args(["src/index.js"]);
/// let client = McpClient::connect(config).await?;
///
/// for tool in client.list_capabilities().await? {
///     println!("{}", tool.name);
/// }
/// let result = client.invoke("create_github_issue", json!({"title": "Test"})).await?;
/// client.close().await?;
/// ```
pub struct McpClient {
    config: ServerConfig,
    conn: Mutex<Connection>,
    /// Set by `close()` without taking the call lock.
    closing: watch::Sender<bool>,
}

impl McpClient {
    /// Spawn the server without performing the handshake.
    pub fn start(config: ServerConfig) -> Result<Self, McpError> {
        let transport = StdioTransport::start(&config)?;
        let (closing, _) = watch::channel(false);

        Ok(Self {
            config,
            conn: Mutex::new(Connection {
                transport,
                last_id: 0,
                initialized: false,
                server: None,
                in_flight: None,
                failure: None,
            }),
            closing,
        })
    }

    /// Spawn the server and complete the handshake.
    ///
    /// If the handshake fails the client is dropped, which kills the server.
    pub async fn connect(config: ServerConfig) -> Result<Self, McpError> {
        let client = Self::start(config)?;
        client.initialize().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Send `request` and wait for the matching response, honouring the
    /// configured deadline and `close()`. Fatal failures mark the connection
    /// broken.
    async fn request(
        &self,
        conn: &mut Connection,
        method: &str,
        params: Option<Value>,
    ) -> Result<Outcome, McpError> {
        conn.ensure_usable()?;

        let request = JsonRpcRequest::new(conn.next_id(), method, params);
        debug!("-> {} (id: {})", method, request.id);

        let result = tokio::select! {
            biased;
            _ = close_requested(self.closing.subscribe()) => {
                warn!("{} (id: {}) interrupted by close", method, request.id);
                Err(McpError::Broken {
                    reason: format!("connection closed during request {}", request.id),
                })
            }
            result = self.exchange_with_deadline(conn, &request) => result,
        };

        if let Err(err) = &result {
            conn.record(err);
        }
        result
    }

    async fn exchange_with_deadline(
        &self,
        conn: &mut Connection,
        request: &JsonRpcRequest,
    ) -> Result<Outcome, McpError> {
        let Some(limit) = self.config.request_timeout() else {
            return conn.exchange(request).await;
        };

        match timeout(limit, conn.exchange(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} (id: {}) timed out after {:?}", request.method, request.id, limit);
                if let Err(e) = conn.transport.kill().await {
                    warn!("Failed to kill MCP server: {}", e);
                }
                Err(McpError::Timeout(limit))
            }
        }
    }

    /// Perform the handshake.
    ///
    /// Calling this on an initialized connection fails with
    /// `AlreadyInitialized` without sending anything.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let mut conn = self.conn.lock().await;
        if conn.initialized {
            return Err(McpError::AlreadyInitialized);
        }

        let params = InitializeParams::new(
            self.config.protocol_version.clone(),
            self.config.client_info.clone(),
        );
        let outcome = self
            .request(&mut conn, METHOD_INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;

        let value = match outcome {
            Outcome::Result(value) => value,
            Outcome::Error(err) => return Err(McpError::handshake(err)),
        };

        let result: InitializeResult = serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Unrecognized initialize result, continuing: {}", e);
            InitializeResult::default()
        });

        if let Some(version) = &result.protocol_version {
            if version != &self.config.protocol_version {
                warn!(
                    "Server negotiated protocol {} (requested {})",
                    version, self.config.protocol_version
                );
            }
        }

        if self.config.send_initialized {
            let note = JsonRpcNotification::new(METHOD_INITIALIZED, None);
            if let Err(err) = conn.transport.write_line(&note).await {
                conn.record(&err);
                return Err(err);
            }
        }

        match &result.server_info {
            Some(info) => info!("MCP connection initialized ({} {})", info.name, info.version),
            None => info!("MCP connection initialized"),
        }

        conn.initialized = true;
        conn.server = Some(result.clone());
        Ok(result)
    }

    /// Handshake result, once initialized.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.conn.lock().await.server.clone()
    }

    /// Number of requests sent so far (equal to the last identifier used).
    pub async fn requests_sent(&self) -> u64 {
        self.conn.lock().await.last_id
    }

    /// Discover the server's tools, in the order the server reports them.
    ///
    /// Paginated listings (`nextCursor`) are followed until exhausted.
    pub async fn list_capabilities(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut conn = self.conn.lock().await;
        if !conn.initialized {
            return Err(McpError::NotInitialized);
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let outcome = self.request(&mut conn, METHOD_TOOLS_LIST, params).await?;
            let value = into_result(outcome)?;

            let page: ListToolsResult =
                serde_json::from_value(value.clone()).map_err(|e| McpError::Framing {
                    reason: format!("malformed tools/list result: {}", e),
                    line: value.to_string(),
                })?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    // Any cursor seen before means the listing loops
                    if !seen.insert(next.clone()) {
                        return Err(McpError::Framing {
                            reason: format!("tools/list returned cursor {:?} twice", next),
                            line: value.to_string(),
                        });
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        debug!("Server reported {} tools", tools.len());
        Ok(tools)
    }

    /// Invoke a tool by name.
    ///
    /// Arguments are passed through unvalidated; a bad shape surfaces as a
    /// `Remote` error from the server. The result payload is returned as-is.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let mut conn = self.conn.lock().await;
        if !conn.initialized {
            return Err(McpError::NotInitialized);
        }

        let params = serde_json::to_value(CallToolParams {
            name,
            arguments: &arguments,
        })?;
        let outcome = self.request(&mut conn, METHOD_TOOLS_CALL, Some(params)).await?;
        into_result(outcome)
    }

    /// [`McpClient::invoke`] with the result read as MCP content blocks.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let value = self.invoke(name, arguments).await?;
        CallToolResult::from_value(value.clone()).map_err(|e| McpError::Framing {
            reason: format!("malformed tools/call result: {}", e),
            line: value.to_string(),
        })
    }

    /// Close stdin and wait for the server to exit.
    ///
    /// A call blocked on the server is interrupted with `Broken`, and a
    /// server left mid-request is killed rather than waited on. Closing
    /// twice is a no-op.
    pub async fn close(&self) -> Result<(), McpError> {
        self.closing.send_replace(true);

        let mut conn = self.conn.lock().await;
        if let Some(id) = conn.in_flight {
            debug!("Request {} unanswered at close", id);
            return conn.transport.kill().await;
        }
        conn.transport.close().await?;
        Ok(())
    }
}

/// Resolves once `close()` has been called.
async fn close_requested(mut closing: watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

fn into_result(outcome: Outcome) -> Result<Value, McpError> {
    match outcome {
        Outcome::Result(value) => Ok(value),
        Outcome::Error(err) => Err(McpError::remote(err)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Server that answers each request line with the next canned line.
    fn scripted(lines: &[&str]) -> ServerConfig {
        let mut script = String::new();
        for line in lines {
            script.push_str(&format!("read -r _; printf '%s\\n' '{}'; ", line));
        }
        script.push_str("cat > /dev/null");
        ServerConfig::new("sh")
            .with_args(["-c", script.as_str()])
            .without_initialized_notification()
    }

    #[tokio::test]
    async fn test_calls_before_initialize_are_rejected() {
        // Empty script: any write would be visible as a consumed line
        let client = McpClient::start(scripted(&[])).expect("spawn");

        let err = client.list_capabilities().await.unwrap_err();
        assert!(matches!(err, McpError::NotInitialized));

        let err = client.invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::NotInitialized));

        assert_eq!(client.requests_sent().await, 0);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_initialize_twice_fails_without_resending() {
        let client = McpClient::start(scripted(&[
            r#"{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"stub","version":"0.1"}}}"#,
        ]))
        .expect("spawn");

        let result = timeout(TEST_TIMEOUT, client.initialize())
            .await
            .expect("Test timed out")
            .expect("initialize");
        assert_eq!(result.server_info.expect("server info").name, "stub");

        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::AlreadyInitialized));
        assert_eq!(client.requests_sent().await, 1);

        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_handshake_error() {
        let client = McpClient::start(scripted(&[
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Unsupported protocol version"}}"#,
        ]))
        .expect("spawn");

        let err = timeout(TEST_TIMEOUT, client.initialize())
            .await
            .expect("Test timed out")
            .unwrap_err();

        match err {
            McpError::Handshake { code, message, .. } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "Unsupported protocol version");
            }
            other => panic!("Expected Handshake, got {:?}", other),
        }

        let err = client.list_capabilities().await.unwrap_err();
        assert!(matches!(err, McpError::NotInitialized));
    }

    #[tokio::test]
    async fn test_id_mismatch_is_protocol_violation() {
        let client = McpClient::start(scripted(&[
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#,
        ]))
        .expect("spawn");

        client.initialize().await.expect("initialize");

        let err = timeout(TEST_TIMEOUT, client.list_capabilities())
            .await
            .expect("Test timed out")
            .unwrap_err();
        match err {
            McpError::ProtocolViolation { expected, actual } => {
                assert_eq!(expected, 2);
                assert_eq!(actual, "7");
            }
            other => panic!("Expected ProtocolViolation, got {:?}", other),
        }

        // The connection is discarded, not reused
        let err = client.invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Broken { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_server_notifications_are_skipped() {
        // A log notification arrives ahead of the answer to the second request
        let script = concat!(
            r#"read -r _; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{}}'; "#,
            r#"read -r _; printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'; "#,
            r#"printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"pong"}]}}'; "#,
            "cat > /dev/null"
        );
        let config = ServerConfig::new("sh")
            .with_args(["-c", script])
            .without_initialized_notification();
        let client = McpClient::connect(config).await.expect("connect");

        let result = timeout(TEST_TIMEOUT, client.call_tool("ping", json!({})))
            .await
            .expect("Test timed out")
            .expect("call");
        assert_eq!(result.text(), "pong");

        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_pagination_is_followed_in_order() {
        let client = McpClient::start(scripted(&[
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"b"},{"name":"a"}],"nextCursor":"page2"}}"#,
            r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"c"}]}}"#,
        ]))
        .expect("spawn");
        client.initialize().await.expect("initialize");

        let tools = timeout(TEST_TIMEOUT, client.list_capabilities())
            .await
            .expect("Test timed out")
            .expect("list");
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);

        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_pagination_cycle_is_rejected() {
        // Cursors A -> B -> A would otherwise be followed forever
        let client = McpClient::start(scripted(&[
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"a"}],"nextCursor":"A"}}"#,
            r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"b"}],"nextCursor":"B"}}"#,
            r#"{"jsonrpc":"2.0","id":4,"result":{"tools":[{"name":"a"}],"nextCursor":"A"}}"#,
        ]))
        .expect("spawn");
        client.initialize().await.expect("initialize");

        let err = timeout(TEST_TIMEOUT, client.list_capabilities())
            .await
            .expect("Test timed out")
            .unwrap_err();
        match err {
            McpError::Framing { reason, .. } => assert!(reason.contains("\"A\""), "got {}", reason),
            other => panic!("Expected Framing, got {:?}", other),
        }
        assert_eq!(client.requests_sent().await, 4);

        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_close_interrupts_call_in_flight() {
        // Answers the handshake, then hangs without reading stdin again
        let script = concat!(
            r#"read -r _; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{}}'; "#,
            "read -r _; sleep 30"
        );
        let config = ServerConfig::new("sh")
            .with_args(["-c", script])
            .without_initialized_notification();
        let client = Arc::new(McpClient::connect(config).await.expect("connect"));

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.invoke("slow", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        timeout(TEST_TIMEOUT, client.close())
            .await
            .expect("close must not wait for the stuck call")
            .expect("close");

        let err = timeout(TEST_TIMEOUT, caller)
            .await
            .expect("Test timed out")
            .expect("task panicked")
            .unwrap_err();
        match err {
            McpError::Broken { reason } => assert!(reason.contains("request 2"), "got {}", reason),
            other => panic!("Expected Broken, got {:?}", other),
        }

        let err = client.invoke("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Broken { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_timeout_kills_server_and_breaks_connection() {
        let config = scripted(&[r#"{"jsonrpc":"2.0","id":1,"result":{}}"#]).with_timeout(1);
        let client = McpClient::start(config).expect("spawn");
        client.initialize().await.expect("initialize");

        // The stub never answers a second request
        let err = timeout(TEST_TIMEOUT, client.invoke("slow", json!({})))
            .await
            .expect("Test timed out")
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)), "got {:?}", err);

        let err = client.invoke("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Broken { .. }), "got {:?}", err);

        client.close().await.expect("close after kill");
    }

    #[tokio::test]
    async fn test_abandoned_call_breaks_connection() {
        let client = McpClient::start(scripted(&[r#"{"jsonrpc":"2.0","id":1,"result":{}}"#]))
            .expect("spawn");
        client.initialize().await.expect("initialize");

        // Caller-side deadline: the future is dropped mid-flight
        let abandoned = timeout(Duration::from_millis(200), client.invoke("slow", json!({}))).await;
        assert!(abandoned.is_err());

        let err = client.invoke("slow", json!({})).await.unwrap_err();
        match err {
            McpError::Broken { reason } => assert!(reason.contains("abandoned"), "got {}", reason),
            other => panic!("Expected Broken, got {:?}", other),
        }
    }
}
