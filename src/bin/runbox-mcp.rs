//! runbox-mcp - MCP server exposing the sandbox over stdio
//!
//! One tool, `run_code_in_sandbox`. The protocol owns stdout, so logs are
//! routed to stderr.

use tracing_subscriber::EnvFilter;

use runbox::backend::registry;
use runbox::mcp::McpServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("RUNBOX_LOG")
        .unwrap_or_else(|_| EnvFilter::new("runbox=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    registry::install_defaults();

    McpServer::new().run().await?;
    Ok(())
}
