//! Tidepool MCP Server
//!
//! This binary serves the Tidepool sandbox over stdio. Configuration comes
//! from `TIDEPOOL_*` environment variables; command-line flags override the
//! environment. The sandbox starts without embedded interpreters, so the
//! execution tools report a structured engine-unavailable result until an
//! embedder links runtimes, while the workspace file tools are fully live.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rmcp::ServiceExt;
use tidepool::Sandbox;
use tidepool::config::SandboxConfig;
use tidepool_mcp::SandboxServer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tidepool-mcp", version, about = "MCP server for the Tidepool execution sandbox")]
struct Args {
    /// Host directory backing the workspace (created if missing)
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Wall-clock timeout per execution, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Shell loop-iteration cap per execution
    #[arg(long)]
    max_loop_iterations: Option<u64>,

    /// Shell command-count cap per execution
    #[arg(long)]
    max_command_count: Option<u64>,

    /// Retained bytes per captured output stream
    #[arg(long)]
    max_output_bytes: Option<u64>,

    /// Interpreter memory ceiling, in bytes
    #[arg(long)]
    max_memory_bytes: Option<u64>,
}

impl Args {
    /// Environment first, flags second.
    fn into_config(self) -> anyhow::Result<SandboxConfig> {
        let mut config = SandboxConfig::from_env()?;
        if let Some(root) = self.workspace_root {
            config.workspace_root = root;
        }
        if let Some(ms) = self.timeout_ms {
            config.limits.timeout = Duration::from_millis(ms);
        }
        if let Some(cap) = self.max_loop_iterations {
            config.limits.max_loop_iterations = cap;
        }
        if let Some(cap) = self.max_command_count {
            config.limits.max_command_count = cap;
        }
        if let Some(cap) = self.max_output_bytes {
            config.limits.max_output_bytes = cap;
        }
        if let Some(cap) = self.max_memory_bytes {
            config.limits.max_memory_bytes = cap;
        }
        config.limits.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - output to stderr so it doesn't interfere with MCP stdio
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Args::parse().into_config()?;
    tracing::info!(
        workspace_root = %config.workspace_root.display(),
        timeout_ms = config.limits.timeout_ms(),
        "Starting Tidepool MCP server"
    );

    let sandbox = Sandbox::builder().config(config).build().await?;
    let server = SandboxServer::new(sandbox);

    // Serve over stdio
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("Failed to start MCP service: {}", e);
        })?;

    tracing::info!("Tidepool MCP server running");

    // Wait for the service to complete
    service.waiting().await?;

    tracing::info!("Tidepool MCP server shutting down");

    Ok(())
}
