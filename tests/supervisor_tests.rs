//! Lifecycle tests against real child processes. `cat` stands in for a
//! well-behaved stdio server (it exits on stdin EOF); `false` stands in for
//! a server that crashes on arrival.

use mcp_bridge::bridge::BridgeManager;
use mcp_bridge::server::{ServerConfig, ServerStatus};
use mcp_bridge::transport::TransportKind;

use std::time::Duration;

fn cat_server(name: &str) -> ServerConfig {
    let mut config = ServerConfig::new(name, TransportKind::Stdio);
    config.command = "cat".to_string();
    config
}

fn crashing_server(name: &str, max_restarts: u32) -> ServerConfig {
    let mut config = ServerConfig::new(name, TransportKind::Stdio);
    config.command = "false".to_string();
    config.auto_restart = true;
    config.max_restarts = Some(max_restarts);
    config.restart_delay_ms = Some(10);
    config
}

#[tokio::test]
async fn test_start_reaches_running_with_handles() {
    let manager = BridgeManager::new();
    let id = manager.register_server(cat_server("echo")).unwrap();

    manager.start_server(id).await.unwrap();

    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Running);
    assert!(instance.process.is_some());
    assert!(instance.transport.is_some());
    assert!(instance.start_time.is_some());
    assert_eq!(instance.restart_count, 0);

    manager.stop_server(id).await.unwrap();
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let manager = BridgeManager::new();
    let id = manager.register_server(cat_server("echo")).unwrap();

    manager.start_server(id).await.unwrap();
    let first_pid = manager.get_server(id).unwrap().process.unwrap().pid();

    manager.start_server(id).await.unwrap();
    let second_pid = manager.get_server(id).unwrap().process.unwrap().pid();
    assert_eq!(first_pid, second_pid, "second start must not respawn");

    manager.stop_server(id).await.unwrap();
}

#[tokio::test]
async fn test_stop_clears_handles_and_is_idempotent() {
    let manager = BridgeManager::new();
    let id = manager.register_server(cat_server("echo")).unwrap();

    manager.start_server(id).await.unwrap();
    manager.stop_server(id).await.unwrap();

    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Stopped);
    assert!(instance.process.is_none());
    assert!(instance.transport.is_none());
    assert!(instance.start_time.is_none());

    // Stopping a stopped server is a no-op.
    manager.stop_server(id).await.unwrap();
    assert_eq!(
        manager.get_server(id).unwrap().status,
        ServerStatus::Stopped
    );
}

#[tokio::test]
async fn test_spawn_failure_surfaces_as_start_failed() {
    let manager = BridgeManager::new();
    let mut config = cat_server("ghost");
    config.command = "/nonexistent/definitely-not-a-binary".to_string();
    let id = manager.register_server(config).unwrap();

    let err = manager.start_server(id).await.unwrap_err();
    assert_eq!(err.code(), "ServerStartFailed");

    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Error);
    assert!(instance.last_error.is_some());
}

#[tokio::test]
async fn test_crash_restart_is_bounded() {
    let manager = BridgeManager::new();
    let id = manager.register_server(crashing_server("flaky", 3)).unwrap();

    manager.start_server(id).await.unwrap();

    // Initial spawn plus three restart attempts, then the loop must stop.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Stopped);
    assert_eq!(instance.restart_count, 3);
    assert!(instance.process.is_none());
    assert!(instance.transport.is_none());

    // And stay stopped: no further attempts trickle in.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Stopped);
    assert_eq!(instance.restart_count, 3);
}

#[tokio::test]
async fn test_crash_without_auto_restart_stays_stopped() {
    let manager = BridgeManager::new();
    let mut config = crashing_server("oneshot", 3);
    config.auto_restart = false;
    let id = manager.register_server(config).unwrap();

    manager.start_server(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Stopped);
    assert_eq!(instance.restart_count, 0);
    assert!(instance.last_error.is_some());
}

#[tokio::test]
async fn test_operator_stop_absorbs_exit_without_restart() {
    let manager = BridgeManager::new();
    let mut config = cat_server("sticky");
    config.auto_restart = true;
    config.restart_delay_ms = Some(10);
    let id = manager.register_server(config).unwrap();

    manager.start_server(id).await.unwrap();
    manager.stop_server(id).await.unwrap();

    // The exit caused by the stop must not be treated as a crash.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Stopped);
    assert_eq!(instance.restart_count, 0);
}

#[tokio::test]
async fn test_restart_respawns_process() {
    let manager = BridgeManager::new();
    let id = manager.register_server(cat_server("echo")).unwrap();

    manager.start_server(id).await.unwrap();
    let first_pid = manager.get_server(id).unwrap().process.unwrap().pid();

    manager.supervisor().restart(id).await.unwrap();
    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Running);
    let second_pid = instance.process.unwrap().pid();
    assert_ne!(first_pid, second_pid);
    assert_eq!(instance.restart_count, 0);

    manager.stop_server(id).await.unwrap();
}

#[tokio::test]
async fn test_unregister_requires_stop_first() {
    let manager = BridgeManager::new();
    let id = manager.register_server(cat_server("echo")).unwrap();

    manager.start_server(id).await.unwrap();
    let err = manager.servers().unregister(id).unwrap_err();
    assert_eq!(err.code(), "InvalidState");

    manager.stop_server(id).await.unwrap();
    manager.servers().unregister(id).unwrap();
    assert_eq!(manager.get_server(id).unwrap_err().code(), "NotFound");
}

#[tokio::test]
async fn test_memory_server_runs_without_process() {
    let manager = BridgeManager::new();
    let id = manager
        .register_server(ServerConfig::new("calc", TransportKind::Memory))
        .unwrap();

    manager.start_server(id).await.unwrap();
    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Running);
    assert!(instance.process.is_none());
    assert!(instance.transport.is_some());
    assert!(instance.backend.is_some());

    // The parked backend endpoint can be taken exactly once.
    assert!(manager.servers().take_backend(id).unwrap().is_some());
    assert!(manager.servers().take_backend(id).unwrap().is_none());

    manager.stop_server(id).await.unwrap();
    let instance = manager.get_server(id).unwrap();
    assert_eq!(instance.status, ServerStatus::Stopped);
    assert!(instance.transport.is_none());
}
