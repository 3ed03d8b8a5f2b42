use mcp_bridge::bridge::BridgeManager;
use mcp_bridge::config::{validate_config, Config};
use mcp_bridge::error::Result;
use mcp_bridge::server::ServerId;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HOST: &str = "127.0.0.1";

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        error!(error = %e, "Startup failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    // LOG_LEVEL wins; RUST_LOG still works for finer-grained filters.
    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) => EnvFilter::new(level),
        Err(_) => EnvFilter::from_default_env(),
    };
    fmt().with_env_filter(filter).with_target(true).init();
}

async fn run() -> Result<()> {
    let host = std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let manager = BridgeManager::new();

    if let Some(config_path) = std::env::args().nth(1) {
        info!(path = %config_path, "Loading configuration");
        let config = Config::from_file(&config_path)?;
        validate_config(&config)?;
        register_servers(&manager, &config).await?;
    }

    let admin_manager = Arc::clone(&manager);
    let admin = mcp_bridge::admin::run(admin_manager, &host, port);
    info!(host = %host, port, "Bridge ready");

    tokio::select! {
        result = admin => {
            // The admin server only returns early on failure.
            if let Err(e) = result {
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    shutdown(&manager).await;
    info!("Shutdown complete");
    Ok(())
}

async fn register_servers(manager: &Arc<BridgeManager>, config: &Config) -> Result<()> {
    let mut autostart: Vec<ServerId> = Vec::new();
    for server in config.server_configs() {
        let auto_start = server.auto_start;
        let name = server.name.clone();
        let id = manager.register_server(server)?;
        info!(server = %id, name = %name, "Registered server");
        if auto_start {
            autostart.push(id);
        }
    }
    for id in autostart {
        if let Err(e) = manager.start_server(id).await {
            warn!(server = %id, error = %e, "Autostart failed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Best-effort stop of every running server before the process exits.
async fn shutdown(manager: &Arc<BridgeManager>) {
    for instance in manager.list_servers() {
        let id = instance.id();
        if let Err(e) = manager.stop_server(id).await {
            warn!(server = %id, error = %e, "Failed to stop server during shutdown");
        }
    }
}
