//! Semantic validation over structurally valid configuration.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::server::ServerConfig;
use crate::transport::TransportKind;

/// Validates every server declaration in a loaded config.
pub fn validate_config(config: &Config) -> Result<()> {
    for server in config.server_configs() {
        validate_server_config(&server)?;
    }
    Ok(())
}

/// Validates one server declaration.
///
/// Process transports need a command; sse additionally needs listen
/// options. Memory servers have no process to launch.
pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(Error::ConfigInvalid(
            "server name must not be empty".to_string(),
        ));
    }

    match config.transport {
        TransportKind::Stdio | TransportKind::Sse => {
            if config.command.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "server {} needs a command for {} transport",
                    config.name, config.transport
                )));
            }
        }
        TransportKind::Memory => {}
    }

    if config.transport == TransportKind::Sse {
        match &config.sse_options {
            Some(options) if options.port == 0 => {
                return Err(Error::ConfigInvalid(format!(
                    "server {} declares sse transport with port 0",
                    config.name
                )));
            }
            Some(_) => {}
            None => {
                return Err(Error::ConfigInvalid(format!(
                    "server {} declares sse transport without sseOptions",
                    config.name
                )));
            }
        }
    }

    Ok(())
}
