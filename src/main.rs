//! mcp-stdio - talk to an MCP tool server over stdio from the command line.
//!
//! ```text
//! mcp-stdio --server github tools
//! mcp-stdio call echo '{"text":"hi"}' -- node src/index.js
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_stdio::config::{default_config_path, ServerConfig, ServersFile};
use mcp_stdio::McpClient;

#[derive(Parser)]
#[command(name = "mcp-stdio")]
#[command(about = "Drive an MCP tool server over stdio")]
#[command(version)]
struct Cli {
    /// Servers file (defaults to $MCP_STDIO_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Name of a server from the servers file
    #[arg(long, short, global = true)]
    server: Option<String>,
    /// Per-request deadline in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools a server advertises
    Tools {
        /// Server command line, instead of --server
        #[arg(last = true)]
        exec: Vec<String>,
    },
    /// Invoke a tool
    Call {
        /// Tool name
        name: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
        /// Server command line, instead of --server
        #[arg(last = true)]
        exec: Vec<String>,
    },
    /// List servers in the servers file
    Servers,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only results
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mcp_stdio=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Servers => {
            let path = cli.config.clone().unwrap_or_else(default_config_path);
            let file = ServersFile::load(&path)?;
            for (name, server) in &file.servers {
                println!("{}: {}", name, server.display_command());
            }
        }
        Commands::Tools { exec } => {
            let client = McpClient::connect(resolve_server(&cli, exec)?).await?;
            let tools = client.list_capabilities().await;
            client.close().await?;

            let tools = tools?;
            println!("Found {} tools:", tools.len());
            for tool in tools {
                println!(
                    "  - {}: {}",
                    tool.name,
                    tool.description.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Call {
            name,
            arguments,
            exec,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(arguments).context("Tool arguments must be valid JSON")?;

            let client = McpClient::connect(resolve_server(&cli, exec)?).await?;
            let result = client.invoke(name, arguments).await;
            client.close().await?;

            print_result(result?)?;
        }
    }

    Ok(())
}

fn resolve_server(cli: &Cli, exec: &[String]) -> Result<ServerConfig> {
    let mut config = if !exec.is_empty() {
        ServerConfig::from_argv(exec.iter().cloned())?
    } else {
        let name = cli
            .server
            .as_deref()
            .context("Specify --server NAME or a server command after `--`")?;
        let path = cli.config.clone().unwrap_or_else(default_config_path);
        ServersFile::load(&path)?.get(name)?.clone()
    };

    if let Some(secs) = cli.timeout {
        config.request_timeout_secs = Some(secs);
    }

    Ok(config)
}

/// Print text content when the result has the usual MCP shape, JSON otherwise.
fn print_result(value: serde_json::Value) -> Result<()> {
    match mcp_stdio::CallToolResult::from_value(value.clone()) {
        Ok(result) if !result.content.is_empty() => {
            println!("{}", result.text());
            if result.is_error {
                anyhow::bail!("Tool reported an error");
            }
        }
        _ => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}
