/*!
 # MCP Bridge

 A transport-bridging proxy for Model Context Protocol (MCP) servers.

 ## Overview

 Clients and servers both speak JSON-RPC frames but may sit on different
 transports: a child process on its standard streams (stdio), a
 Server-Sent Events stream paired with an HTTP POST endpoint (sse), or a
 linked in-process channel pair (memory). The bridge lets a client on one
 transport talk to a server on another, while supervising the server
 processes underneath: crashed servers restart within a configured bound,
 and an environment update hot-swaps the server beneath its live
 connections without dropping them.

 ## Basic Usage

 ```no_run
 use mcp_bridge::{BridgeManager, Result};
 use mcp_bridge::server::ServerConfig;
 use mcp_bridge::transport::TransportKind;

 #[tokio::main]
 async fn main() -> Result<()> {
     let manager = BridgeManager::new();

     // Declare and start a stdio MCP server
     let mut config = ServerConfig::new("fetch", TransportKind::Stdio);
     config.command = "uvx".to_string();
     config.args = vec!["mcp-server-fetch".to_string()];
     let server_id = manager.register_server(config)?;
     manager.start_server(server_id).await?;

     // Later: push an environment change through a hot-swap
     let mut delta = std::collections::HashMap::new();
     delta.insert("DEBUG".to_string(), "true".to_string());
     manager.update_environment(server_id, &delta).await?;

     Ok(())
 }
 ```

 ## Features

 - **Server supervision**: start, stop, crash-restart with bounded retry
 - **Transport bridging**: stdio ↔ sse and in-process memory loops
 - **Environment hot-swap**: restart a server under its live connections
 - **Admin API**: JSON HTTP surface over every operation
*/

pub mod admin;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub mod transport;

// Re-export key types for better API ergonomics
pub use bridge::{BridgeManager, ConnectHints, EnvUpdateOutcome, Handler};
pub use config::Config;
pub use connection::{ConnectionConfig, ConnectionId, ConnectionStatus};
pub use error::{Error, Result};
pub use server::{ServerConfig, ServerId, ServerStatus};
pub use transport::{Adapter, Frame, TransportKind};
