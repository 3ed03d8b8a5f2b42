//! End-to-end bridge scenarios over the memory transport, plus the
//! unsupported-combination and hot-swap contracts.

use mcp_bridge::bridge::{BridgeManager, ConnectHints};
use mcp_bridge::connection::{ConnectionConfig, ConnectionStatus};
use mcp_bridge::server::{ServerConfig, ServerId, ServerStatus};
use mcp_bridge::transport::{Adapter, Frame, MemoryAdapter, TransportKind};

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn frame(id: u64) -> Frame {
    Frame::new(json!({"jsonrpc": "2.0", "id": id, "method": "ping"})).unwrap()
}

fn memory_server(name: &str) -> ServerConfig {
    ServerConfig::new(name, TransportKind::Memory)
}

fn cat_server(name: &str) -> ServerConfig {
    let mut config = ServerConfig::new(name, TransportKind::Stdio);
    config.command = "cat".to_string();
    config
}

/// Connects a memory client, returning the far end the test drives.
async fn connect_memory_client(
    manager: &Arc<BridgeManager>,
    server_id: ServerId,
) -> (mcp_bridge::connection::ConnectionId, MemoryAdapter) {
    let (api_end, bridge_end) = MemoryAdapter::pair("api", "bridge");
    api_end.start().await.unwrap();
    let hints = ConnectHints {
        memory: Some(bridge_end),
        ..ConnectHints::default()
    };
    let id = manager
        .connect(ConnectionConfig::new(server_id, TransportKind::Memory), hints)
        .await
        .unwrap();
    (id, api_end)
}

/// Wires an echo loop on the server's parked backend endpoint.
async fn wire_echo_backend(manager: &Arc<BridgeManager>, server_id: ServerId) {
    let backend = manager
        .servers()
        .take_backend(server_id)
        .unwrap()
        .expect("memory server parks a backend endpoint");
    backend.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    backend.set_frame_handler(Arc::new(move |f| {
        let _ = tx.send(f);
    }));
    let responder = backend.clone();
    tokio::spawn(async move {
        while let Some(f) = rx.recv().await {
            if responder.send(f).await.is_err() {
                break;
            }
        }
    });
}

fn collect(adapter: &MemoryAdapter) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    Adapter::Memory(adapter.clone()).set_frame_handler(Arc::new(move |f| {
        let _ = tx.send(f);
    }));
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed")
}

#[tokio::test]
async fn test_connect_starts_server_and_bridges() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();

    let (connection_id, api_end) = connect_memory_client(&manager, server_id).await;

    // connect() brought the server up on demand.
    assert_eq!(
        manager.get_server(server_id).unwrap().status,
        ServerStatus::Running
    );
    let connection = manager.get_connection(connection_id).unwrap();
    assert_eq!(connection.status, ConnectionStatus::Connected);
    assert!(connection.connect_time.is_some());
    assert!(manager.has_handler(connection_id));

    wire_echo_backend(&manager, server_id).await;
    let mut replies = collect(&api_end);
    api_end.send(frame(1)).await.unwrap();
    assert_eq!(recv(&mut replies).await, frame(1));

    manager.stop_server(server_id).await.unwrap();
}

#[tokio::test]
async fn test_unsupported_combination_leaves_no_residue() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(cat_server("echo")).unwrap();

    // stdio client against a stdio server: nothing to bridge.
    let err = manager
        .connect(
            ConnectionConfig::new(server_id, TransportKind::Stdio),
            ConnectHints::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ConnectionFailed");
    assert_eq!(err.root_cause().code(), "UnsupportedTransport");

    // No lingering ConnectionInstance.
    assert!(manager.list_connections().is_empty());

    manager.stop_server(server_id).await.ok();
}

#[tokio::test]
async fn test_connect_to_unknown_server_fails_cleanly() {
    let manager = BridgeManager::new();
    let ghost = ServerId::parse("00000000-0000-0000-0000-000000000000").unwrap();

    let err = manager
        .connect(
            ConnectionConfig::new(ghost, TransportKind::Memory),
            ConnectHints::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ConnectionFailed");
    assert_eq!(err.root_cause().code(), "NotFound");
    assert!(manager.list_connections().is_empty());
}

#[tokio::test]
async fn test_memory_connect_requires_peer_hint() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();

    let err = manager
        .connect(
            ConnectionConfig::new(server_id, TransportKind::Memory),
            ConnectHints::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ConnectionFailed");
    assert_eq!(err.root_cause().code(), "ValidationError");
    assert!(manager.list_connections().is_empty());
}

#[tokio::test]
async fn test_disconnect_leaves_server_alone() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();

    let (id_a, api_a) = connect_memory_client(&manager, server_id).await;
    let (id_b, api_b) = connect_memory_client(&manager, server_id).await;
    wire_echo_backend(&manager, server_id).await;

    manager.disconnect(id_a).await.unwrap();

    assert_eq!(
        manager.get_connection(id_a).unwrap().status,
        ConnectionStatus::Disconnected
    );
    assert!(!manager.has_handler(id_a));
    assert_eq!(
        manager.get_connection(id_b).unwrap().status,
        ConnectionStatus::Connected
    );
    let server = manager.get_server(server_id).unwrap();
    assert_eq!(server.status, ServerStatus::Running);
    assert_eq!(server.restart_count, 0);

    // A's far end observed the close; B still round-trips.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(Adapter::Memory(api_a.clone()).is_closed());
    let mut replies = collect(&api_b);
    api_b.send(frame(2)).await.unwrap();
    assert_eq!(recv(&mut replies).await, frame(2));

    manager.stop_server(server_id).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();
    let (id, _api) = connect_memory_client(&manager, server_id).await;

    manager.disconnect(id).await.unwrap();
    manager.disconnect(id).await.unwrap();
    assert_eq!(
        manager.get_connection(id).unwrap().status,
        ConnectionStatus::Disconnected
    );
}

#[tokio::test]
async fn test_env_update_on_stopped_server_needs_no_restart() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(cat_server("echo")).unwrap();

    let mut delta = HashMap::new();
    delta.insert("X".to_string(), "1".to_string());
    let outcome = manager.update_environment(server_id, &delta).await.unwrap();

    assert!(!outcome.restarted);
    assert!(outcome.reconnected.is_empty());
    let server = manager.get_server(server_id).unwrap();
    assert_eq!(server.status, ServerStatus::Stopped);
    assert_eq!(server.config.env.get("X").map(String::as_str), Some("1"));
    assert_eq!(server.restart_count, 0);

    // The next start picks the merged environment up.
    manager.start_server(server_id).await.unwrap();
    assert_eq!(
        manager.get_server(server_id).unwrap().status,
        ServerStatus::Running
    );
    manager.stop_server(server_id).await.unwrap();
}

#[tokio::test]
async fn test_env_update_hot_swaps_running_server() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();

    let (old_id, api_end) = connect_memory_client(&manager, server_id).await;
    wire_echo_backend(&manager, server_id).await;

    let mut delta = HashMap::new();
    delta.insert("X".to_string(), "1".to_string());
    let outcome = manager.update_environment(server_id, &delta).await.unwrap();

    // Restarted exactly once, with every client re-attached under a new id.
    assert!(outcome.restarted);
    assert!(outcome.failed.is_empty());
    assert_eq!(outcome.reconnected.len(), 1);
    let new_id = outcome.reconnected[0];
    assert_ne!(new_id, old_id);
    assert_eq!(manager.get_connection(old_id).unwrap_err().code(), "NotFound");
    assert_eq!(
        manager.get_connection(new_id).unwrap().status,
        ConnectionStatus::Connected
    );

    let server = manager.get_server(server_id).unwrap();
    assert_eq!(server.status, ServerStatus::Running);
    assert_eq!(server.config.env.get("X").map(String::as_str), Some("1"));

    // The retained client still reaches the swapped server.
    wire_echo_backend(&manager, server_id).await;
    let mut replies = collect(&api_end);
    api_end.send(frame(3)).await.unwrap();
    assert_eq!(recv(&mut replies).await, frame(3));

    manager.stop_server(server_id).await.unwrap();
}

#[tokio::test]
async fn test_hot_swap_preserves_every_connected_client() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();

    let (_id_a, api_a) = connect_memory_client(&manager, server_id).await;
    let (_id_b, api_b) = connect_memory_client(&manager, server_id).await;
    wire_echo_backend(&manager, server_id).await;

    let mut delta = HashMap::new();
    delta.insert("Y".to_string(), "2".to_string());
    let outcome = manager.update_environment(server_id, &delta).await.unwrap();
    assert_eq!(outcome.reconnected.len(), 2);
    assert!(outcome.failed.is_empty());

    let connected = manager
        .list_connections()
        .iter()
        .filter(|c| c.status == ConnectionStatus::Connected)
        .count();
    assert_eq!(connected, 2);

    wire_echo_backend(&manager, server_id).await;
    let mut replies_a = collect(&api_a);
    let mut replies_b = collect(&api_b);
    api_a.send(frame(10)).await.unwrap();
    // The echo fans out to every attached client.
    assert_eq!(recv(&mut replies_a).await, frame(10));
    assert_eq!(recv(&mut replies_b).await, frame(10));

    manager.stop_server(server_id).await.unwrap();
}

#[tokio::test]
async fn test_delete_running_server_tears_everything_down() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();
    let (connection_id, api_end) = connect_memory_client(&manager, server_id).await;

    manager.remove_server(server_id).await.unwrap();

    assert_eq!(manager.get_server(server_id).unwrap_err().code(), "NotFound");
    assert_eq!(
        manager.get_connection(connection_id).unwrap_err().code(),
        "NotFound"
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(Adapter::Memory(api_end.clone()).is_closed());
}

#[tokio::test]
async fn test_stop_server_disconnects_clients_first() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();
    let (connection_id, _api) = connect_memory_client(&manager, server_id).await;

    manager.stop_server(server_id).await.unwrap();

    assert_eq!(
        manager.get_connection(connection_id).unwrap().status,
        ConnectionStatus::Disconnected
    );
    assert!(!manager.has_handler(connection_id));
    assert_eq!(
        manager.get_server(server_id).unwrap().status,
        ServerStatus::Stopped
    );
}

#[tokio::test]
async fn test_explicit_reconnect_keeps_connection_id() {
    let manager = BridgeManager::new();
    let server_id = manager.register_server(memory_server("calc")).unwrap();
    let (connection_id, api_end) = connect_memory_client(&manager, server_id).await;
    wire_echo_backend(&manager, server_id).await;

    manager.reconnect(connection_id).await.unwrap();

    let connection = manager.get_connection(connection_id).unwrap();
    assert_eq!(connection.status, ConnectionStatus::Connected);
    assert_eq!(connection.reconnect_count, 0, "reset on success");

    // The backend wired before the reconnect is still the live one.
    let mut replies = collect(&api_end);
    api_end.send(frame(4)).await.unwrap();
    assert_eq!(recv(&mut replies).await, frame(4));

    manager.stop_server(server_id).await.unwrap();
}

#[tokio::test]
async fn test_inbound_post_for_unknown_connection_is_not_found() {
    let manager = BridgeManager::new();
    let ghost = mcp_bridge::connection::ConnectionId::parse(
        "00000000-0000-0000-0000-000000000000",
    )
    .unwrap();
    let err = manager
        .handle_inbound_sse_post(ghost, frame(1))
        .unwrap_err();
    assert_eq!(err.code(), "NotFound");
}

#[tokio::test]
async fn test_connect_timeout_produces_connection_failed() {
    let manager = BridgeManager::new();
    let mut config = ServerConfig::new("slow-sse", TransportKind::Sse);
    config.command = "sleep".to_string();
    config.args = vec!["5".to_string()];
    config.sse_options = Some(mcp_bridge::server::SseOptions {
        // Nothing listens here; the dial retries until the budget runs out.
        port: 1,
        host: None,
    });
    let server_id = manager.register_server(config).unwrap();

    let mut connection = ConnectionConfig::new(server_id, TransportKind::Stdio);
    connection.timeout_ms = Some(200);
    let err = manager
        .connect(connection, ConnectHints::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ConnectionFailed");
    assert_eq!(err.root_cause().code(), "Timeout");
    assert!(manager.list_connections().is_empty());
}
