//! Launch configuration for tool servers.
//!
//! One client implementation serves every target server; servers differ only
//! by the command they are launched with, their environment and the
//! handshake identity. Configurations can be built in code or loaded from a
//! JSON servers file:
//!
//! ```json
//! {
//!   "servers": {
//!     "github": {
//!       "command": "docker",
//!       "args": ["exec", "-i", "mcp-demo-github-mcp-1", "node", "src/index.js"],
//!       "env": { "LOG_LEVEL": "debug" },
//!       "requestTimeoutSecs": 60
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{ClientInfo, DEFAULT_PROTOCOL_VERSION};

/// Environment variable overriding the servers file location.
pub const CONFIG_ENV_VAR: &str = "MCP_STDIO_CONFIG";

fn default_true() -> bool {
    true
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

/// How to launch and greet a single server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Program to execute
    pub command: String,
    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Whether the child inherits this process's environment
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Identity announced in the handshake
    #[serde(default)]
    pub client_info: ClientInfo,
    /// Protocol version announced in the handshake
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Deadline for a single request; `None` waits indefinitely
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Send `notifications/initialized` after the handshake
    #[serde(default = "default_true")]
    pub send_initialized: bool,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            inherit_env: true,
            client_info: ClientInfo::default(),
            protocol_version: default_protocol_version(),
            request_timeout_secs: None,
            send_initialized: true,
        }
    }

    /// Build from an argument vector (`argv[0]` is the program).
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut iter = argv.into_iter().map(Into::into);
        let command = iter.next().ok_or_else(|| anyhow!("Empty server command"))?;
        Ok(Self::new(command).with_args(iter))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = ClientInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn without_initialized_notification(mut self) -> Self {
        self.send_initialized = false;
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// The full command line, for logs and error messages.
    pub fn display_command(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Named server configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl ServersFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read servers file {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Invalid servers file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let file: ServersFile = serde_json::from_str(contents)?;
        for (name, server) in &file.servers {
            if server.command.trim().is_empty() {
                return Err(anyhow!("Server '{}' has an empty command", name));
            }
        }
        Ok(file)
    }

    pub fn get(&self, name: &str) -> Result<&ServerConfig> {
        self.servers.get(name).ok_or_else(|| {
            let known = self.servers.keys().cloned().collect::<Vec<_>>().join(", ");
            anyhow!("Unknown server '{}' (configured: {})", name, known)
        })
    }
}

/// Resolve the default servers file path.
///
/// Resolution order:
/// 1. `$MCP_STDIO_CONFIG`
/// 2. `<config dir>/mcp-stdio/servers.json`
/// 3. `./servers.json`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("mcp-stdio").join("servers.json");
    }

    PathBuf::from("servers.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_server_config_defaults() {
        let file = ServersFile::parse(r#"{"servers": {"echo": {"command": "echo-server"}}}"#)
            .expect("parse");
        let server = file.get("echo").expect("echo configured");

        assert_eq!(server, &ServerConfig::new("echo-server"));
        assert!(server.inherit_env);
        assert!(server.send_initialized);
        assert_eq!(server.protocol_version, "2024-11-05");
        assert_eq!(server.client_info.name, "mcp-stdio");
        assert_eq!(server.request_timeout(), None);
    }

    #[test]
    fn test_server_config_full() {
        let file = ServersFile::parse(
            r#"{
                "servers": {
                    "github": {
                        "command": "docker",
                        "args": ["exec", "-i", "github-mcp", "node", "src/index.js"],
                        "env": {"LOG_LEVEL": "debug"},
                        "inheritEnv": false,
                        "clientInfo": {"name": "mcp-demo-client", "version": "1.0.0"},
                        "requestTimeoutSecs": 60,
                        "sendInitialized": false
                    }
                }
            }"#,
        )
        .expect("parse");
        let server = file.get("github").expect("github configured");

        assert_eq!(
            server.display_command(),
            "docker exec -i github-mcp node src/index.js"
        );
        assert_eq!(server.env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert!(!server.inherit_env);
        assert!(!server.send_initialized);
        assert_eq!(server.client_info.version, "1.0.0");
        assert_eq!(server.request_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_rejects_empty_command() {
        let err = ServersFile::parse(r#"{"servers": {"bad": {"command": "  "}}}"#).unwrap_err();
        assert!(err.to_string().contains("empty command"), "got: {}", err);
    }

    #[test]
    fn test_unknown_server_lists_known() {
        let file = ServersFile::parse(r#"{"servers": {"slack": {"command": "slack-mcp"}}}"#)
            .expect("parse");
        let err = file.get("crm").unwrap_err().to_string();
        assert!(err.contains("crm") && err.contains("slack"), "got: {}", err);
    }

    #[test]
    fn test_from_argv() {
        let config = ServerConfig::from_argv(["node", "src/index.js"]).expect("argv");
        assert_eq!(config.command, "node");
        assert_eq!(config.args, vec!["src/index.js".to_string()]);

        assert!(ServerConfig::from_argv(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("servers.json");
        std::fs::write(&path, r#"{"servers": {"merge": {"command": "merge-mcp"}}}"#)
            .expect("write");

        let file = ServersFile::load(&path).expect("load");
        assert_eq!(file.servers.len(), 1);

        let missing = ServersFile::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read servers file"));
    }
}
