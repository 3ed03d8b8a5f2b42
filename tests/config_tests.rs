use mcp_bridge::config::{validate_config, validate_server_config, Config};
use mcp_bridge::server::{ServerConfig, SseOptions};
use mcp_bridge::transport::TransportKind;

use std::io::Write;

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "servers": {{
                "echo": {{
                    "command": "cat",
                    "transport": "stdio",
                    "autoStart": true
                }},
                "calc": {{
                    "transport": "memory"
                }}
            }}
        }}"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.servers.len(), 2);
    validate_config(&config).unwrap();

    let configs = config.server_configs();
    // Sorted by name for stable registration order.
    assert_eq!(configs[0].name, "calc");
    assert_eq!(configs[0].transport, TransportKind::Memory);
    assert_eq!(configs[1].name, "echo");
    assert!(configs[1].auto_start);
}

#[test]
fn test_missing_file_is_parse_error() {
    let err = Config::from_file("/nonexistent/bridge.json").unwrap_err();
    assert_eq!(err.code(), "ValidationError");
}

#[test]
fn test_invalid_json_is_parse_error() {
    let err = Config::parse_from_str("{not json").unwrap_err();
    assert_eq!(err.code(), "ValidationError");
}

#[test]
fn test_stdio_server_requires_command() {
    let config = ServerConfig::new("echo", TransportKind::Stdio);
    let err = validate_server_config(&config).unwrap_err();
    assert_eq!(err.code(), "ValidationError");
}

#[test]
fn test_memory_server_needs_no_command() {
    let config = ServerConfig::new("calc", TransportKind::Memory);
    validate_server_config(&config).unwrap();
}

#[test]
fn test_sse_server_requires_options() {
    let mut config = ServerConfig::new("search", TransportKind::Sse);
    config.command = "search-server".to_string();
    let err = validate_server_config(&config).unwrap_err();
    assert_eq!(err.code(), "ValidationError");

    config.sse_options = Some(SseOptions {
        port: 8931,
        host: None,
    });
    validate_server_config(&config).unwrap();
}

#[test]
fn test_sse_port_zero_rejected() {
    let mut config = ServerConfig::new("search", TransportKind::Sse);
    config.command = "search-server".to_string();
    config.sse_options = Some(SseOptions { port: 0, host: None });
    assert!(validate_server_config(&config).is_err());
}

#[test]
fn test_empty_name_rejected() {
    let mut config = ServerConfig::new("", TransportKind::Memory);
    assert!(validate_server_config(&config).is_err());
    config.name = "  ".to_string();
    assert!(validate_server_config(&config).is_err());
}

#[test]
fn test_sse_options_stream_url() {
    let options = SseOptions {
        port: 9000,
        host: None,
    };
    assert_eq!(options.stream_url(), "http://127.0.0.1:9000/sse");

    let options = SseOptions {
        port: 9000,
        host: Some("10.0.0.5".to_string()),
    };
    assert_eq!(options.stream_url(), "http://10.0.0.5:9000/sse");
}
