use mcp_bridge::bridge::BridgeManager;
use mcp_bridge::error::Result;
use mcp_bridge::server::ServerConfig;
use mcp_bridge::transport::TransportKind;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Bridges a stdio MCP server to SSE clients through the admin API.
///
/// `cat` stands in for a real server: it echoes every frame it is sent.
#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let manager = BridgeManager::new();

    let mut config = ServerConfig::new("echo", TransportKind::Stdio);
    config.command = "cat".to_string();
    config.auto_restart = true;
    config.max_restarts = Some(3);

    let server_id = manager.register_server(config)?;
    manager.start_server(server_id).await?;
    info!(server = %server_id, "Echo server running");

    info!("Attach an SSE client:");
    info!("  curl -N http://localhost:3000/sse/{}", server_id);
    info!("Then POST a frame to the advertised endpoint:");
    info!("  curl -X POST 'http://localhost:3000/sse/messages?sessionId=CONNECTION_ID' \\");
    info!("    -H 'Content-Type: application/json' \\");
    info!("    -d '{{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}}'");
    info!("Press Ctrl+C to exit");

    mcp_bridge::admin::run(manager, "127.0.0.1", 3000).await
}
