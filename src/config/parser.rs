use crate::error::{Error, Result};
use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration for the bridge host.
///
/// Servers are declared under a name → config map; the key doubles as the
/// server name when the entry leaves it unset.
///
/// # JSON Schema
///
/// ```json
/// {
///   "servers": {
///     "fetch": {
///       "command": "uvx",
///       "args": ["mcp-server-fetch"],
///       "transport": "stdio",
///       "autoStart": true,
///       "env": { "DEBUG": "true" }
///     },
///     "search": {
///       "command": "search-server",
///       "transport": "sse",
///       "sseOptions": { "port": 8931 }
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Declared servers, keyed by name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl Config {
    /// Loads a configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;
        Self::parse_from_str(&content)
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Server configs ready for registration, names filled in from map
    /// keys and sorted by name so registration order is stable.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<ServerConfig> = self
            .servers
            .iter()
            .map(|(name, config)| {
                let mut config = config.clone();
                if config.name.is_empty() {
                    config.name = name.clone();
                }
                config
            })
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    #[test]
    fn test_parse_stdio_server() {
        let config_str = r#"{
            "servers": {
                "filesystem": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
                    "transport": "stdio",
                    "autoRestart": true,
                    "maxRestarts": 3
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();
        assert_eq!(config.servers.len(), 1);

        let configs = config.server_configs();
        assert_eq!(configs[0].name, "filesystem");
        assert_eq!(configs[0].command, "npx");
        assert_eq!(configs[0].transport, TransportKind::Stdio);
        assert!(configs[0].auto_restart);
        assert_eq!(configs[0].max_restarts, Some(3));
    }

    #[test]
    fn test_parse_sse_server_options() {
        let config_str = r#"{
            "servers": {
                "search": {
                    "command": "search-server",
                    "transport": "sse",
                    "sseOptions": { "port": 8931, "host": "0.0.0.0" }
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();
        let configs = config.server_configs();
        let options = configs[0].sse_options.as_ref().unwrap();
        assert_eq!(options.port, 8931);
        assert_eq!(options.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let config_str = r#"{
            "servers": {
                "x": { "command": "x", "transport": "websocket" }
            }
        }"#;
        assert!(Config::parse_from_str(config_str).is_err());
    }
}
