//! The bridge manager: the orchestration layer over registries, supervisor
//! and handlers.
//!
//! connect/disconnect, the environment hot-swap, the SSE POST intake and
//! the reconnect policy all live here. In steady state frames never touch
//! the manager; it only moves when a lifecycle event does.

use crate::bridge::handler::{supported_combination, BridgeEvent, CloseReason, Handler};
use crate::bridge::{teardown_connection, HandlerMap};
use crate::config::validate_server_config;
use crate::connection::{
    ConnectionConfig, ConnectionId, ConnectionInstance, ConnectionRegistry, ConnectionStatus,
};
use crate::error::{Error, Result};
use crate::server::{
    ServerConfig, ServerConfigUpdate, ServerId, ServerInstance, ServerRegistry, ServerStatus,
    Supervisor,
};
use crate::transport::{Adapter, Frame, MemoryAdapter, SseAdapter, SseSink, StdioAdapter, StdioPipes};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Live attachments a connect() cannot receive through a JSON body.
///
/// An sse client needs the open response sink and the companion POST
/// endpoint; a stdio client needs the pipes of its already-spawned process;
/// a memory client needs one end of a linked channel pair. An environment
/// delta may ride along and is applied (hot-swapping if needed) before the
/// bridge is built.
#[derive(Default)]
pub struct ConnectHints {
    pub endpoint: Option<String>,
    pub response_sink: Option<SseSink>,
    pub env_delta: Option<HashMap<String, String>>,
    pub stdio: Option<StdioPipes>,
    pub memory: Option<MemoryAdapter>,
}

/// What an environment update did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvUpdateOutcome {
    pub server_id: ServerId,
    /// Whether the server was hot-swapped to apply the delta.
    pub restarted: bool,
    /// New ids of the re-established connections.
    pub reconnected: Vec<ConnectionId>,
    /// Connections (by their pre-swap id) that could not be re-established.
    pub failed: Vec<FailedReconnect>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedReconnect {
    pub connection_id: ConnectionId,
    pub error: String,
}

/// Orchestrates registries, supervisor and handlers.
pub struct BridgeManager {
    servers: Arc<ServerRegistry>,
    connections: Arc<ConnectionRegistry>,
    supervisor: Arc<Supervisor>,
    handlers: Arc<HandlerMap>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeManager {
    /// Builds the manager and starts its lifecycle event loop. Must be
    /// called from within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let servers = Arc::new(ServerRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let handlers: Arc<HandlerMap> = Arc::new(Mutex::new(HashMap::new()));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&servers),
            Arc::clone(&connections),
            Arc::clone(&handlers),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            servers,
            connections,
            supervisor,
            handlers,
            events: events_tx,
        });
        tokio::spawn(Arc::clone(&manager).event_loop(events_rx));
        manager
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Whether a live handler exists for the connection.
    pub fn has_handler(&self, id: ConnectionId) -> bool {
        self.handlers
            .lock()
            .map(|map| map.contains_key(&id))
            .unwrap_or(false)
    }

    // ----- servers ---------------------------------------------------------

    /// Validates and registers a server declaration.
    pub fn register_server(&self, config: ServerConfig) -> Result<ServerId> {
        validate_server_config(&config)?;
        self.servers.register(config)
    }

    pub fn get_server(&self, id: ServerId) -> Result<ServerInstance> {
        self.servers.get(id)
    }

    pub fn list_servers(&self) -> Vec<ServerInstance> {
        self.servers.list()
    }

    pub fn update_server(&self, id: ServerId, update: ServerConfigUpdate) -> Result<()> {
        self.servers.update_config(id, update)
    }

    pub async fn start_server(&self, id: ServerId) -> Result<()> {
        self.supervisor.start(id).await
    }

    pub async fn stop_server(&self, id: ServerId) -> Result<()> {
        self.supervisor.stop(id).await
    }

    /// Stops the server if needed, retires its connection records, then
    /// unregisters it.
    pub async fn remove_server(&self, id: ServerId) -> Result<()> {
        if self.servers.status(id)? != ServerStatus::Stopped {
            self.supervisor.stop(id).await?;
        }
        for connection in self.connections.list_for_server(id) {
            let connection_id = connection.id();
            if let Err(e) = self.remove_connection(connection_id).await {
                tracing::warn!(
                    server = %id,
                    connection = %connection_id,
                    error = %e,
                    "Failed to retire connection during server removal"
                );
            }
        }
        self.servers.unregister(id)
    }

    /// Merges an environment delta into the server's config. A server that
    /// is Running is hot-swapped: every Connected client is detached, the
    /// server restarts with the new environment, and the clients are
    /// re-attached under fresh connection ids.
    pub async fn update_environment(
        &self,
        server_id: ServerId,
        delta: &HashMap<String, String>,
    ) -> Result<EnvUpdateOutcome> {
        let restart_required = self.servers.merge_env(server_id, delta)?;
        if !restart_required {
            tracing::info!(server = %server_id, "Environment updated, server not running, no restart");
            return Ok(EnvUpdateOutcome {
                server_id,
                restarted: false,
                reconnected: Vec::new(),
                failed: Vec::new(),
            });
        }
        self.hot_swap(server_id).await
    }

    /// The coordinated teardown/restart/re-attach beneath live connections.
    ///
    /// Ordering per the concurrency contract: every prior connection is
    /// Disconnected before the server leaves Running, and the server is
    /// Running again before any client is re-attached.
    async fn hot_swap(&self, server_id: ServerId) -> Result<EnvUpdateOutcome> {
        let snapshots: Vec<ConnectionInstance> = self
            .connections
            .list_for_server(server_id)
            .into_iter()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .collect();
        tracing::info!(
            server = %server_id,
            connections = snapshots.len(),
            "Hot-swapping server environment"
        );

        // Detach every client, keeping its adapter open, and retire the
        // old connection records; re-attachment mints fresh ids.
        for snapshot in &snapshots {
            let old_id = snapshot.id();
            if let Err(e) =
                teardown_connection(&self.connections, &self.handlers, old_id, false).await
            {
                tracing::warn!(connection = %old_id, error = %e, "Detach failed during hot-swap");
            }
            if let Err(e) = self.connections.remove(old_id) {
                tracing::warn!(connection = %old_id, error = %e, "Failed to retire connection during hot-swap");
            }
        }

        self.supervisor.restart(server_id).await?;

        let mut reconnected = Vec::new();
        let mut failed = Vec::new();
        for snapshot in snapshots {
            let old_id = snapshot.id();
            let client = match snapshot.client {
                Some(client) if !client.is_closed() => client,
                _ => {
                    failed.push(FailedReconnect {
                        connection_id: old_id,
                        error: "client transport no longer open".to_string(),
                    });
                    continue;
                }
            };

            let mut config = snapshot.config.clone();
            config.id = None;
            let new_id = match self.connections.create(config.clone()) {
                Ok(id) => id,
                Err(e) => {
                    failed.push(FailedReconnect {
                        connection_id: old_id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if let Err(e) = self
                .connections
                .update_status(new_id, ConnectionStatus::Connecting, None)
            {
                failed.push(FailedReconnect {
                    connection_id: old_id,
                    error: e.to_string(),
                });
                continue;
            }
            match self.attach(new_id, &config, client).await {
                Ok(()) => reconnected.push(new_id),
                Err(e) => {
                    let _ = self.connections.update_status(
                        new_id,
                        ConnectionStatus::Error,
                        Some(e.to_string()),
                    );
                    failed.push(FailedReconnect {
                        connection_id: old_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            server = %server_id,
            reconnected = reconnected.len(),
            failed = failed.len(),
            "Hot-swap complete"
        );
        Ok(EnvUpdateOutcome {
            server_id,
            restarted: true,
            reconnected,
            failed,
        })
    }

    // ----- connections -----------------------------------------------------

    pub fn get_connection(&self, id: ConnectionId) -> Result<ConnectionInstance> {
        self.connections.get(id)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInstance> {
        self.connections.list()
    }

    /// Establishes a bridge for the given connection config. A failed
    /// connect leaves no residue: the reserved instance and any partially
    /// built adapters are destroyed, and the error names the cause.
    pub async fn connect(
        &self,
        config: ConnectionConfig,
        hints: ConnectHints,
    ) -> Result<ConnectionId> {
        let timeout = config.timeout_ms.map(Duration::from_millis);
        let id = self.connections.create(config)?;

        let establish = self.establish(id, hints);
        let result = match timeout {
            Some(t) => match tokio::time::timeout(t, establish).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "connect did not complete within {}ms",
                    t.as_millis()
                ))),
            },
            None => establish.await,
        };

        match result {
            Ok(()) => {
                tracing::info!(connection = %id, "Connection established");
                Ok(id)
            }
            Err(e) => {
                let _ = self.connections.update_status(
                    id,
                    ConnectionStatus::Error,
                    Some(e.to_string()),
                );
                let handler = self
                    .handlers
                    .lock()
                    .map_err(|_| Error::Internal("handler map lock poisoned".to_string()))?
                    .remove(&id);
                if let Some(handler) = handler {
                    handler.stop(true).await;
                }
                if let Ok(Some(client)) = self.connections.client(id) {
                    client.close().await;
                }
                let _ = self
                    .connections
                    .update_status(id, ConnectionStatus::Disconnected, None);
                let _ = self.connections.remove(id);
                Err(Error::ConnectionFailed {
                    connection: id.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn establish(&self, id: ConnectionId, mut hints: ConnectHints) -> Result<()> {
        let config = self.connections.get(id)?.config;

        if let Some(delta) = hints.env_delta.take() {
            let restart_required = self.servers.merge_env(config.server_id, &delta)?;
            if restart_required {
                self.hot_swap(config.server_id).await?;
            }
        }

        let server = self.servers.get(config.server_id)?;
        if !supported_combination(config.transport, server.config.transport) {
            return Err(Error::UnsupportedTransport(format!(
                "{} client against {} server",
                config.transport, server.config.transport
            )));
        }

        self.supervisor.start(config.server_id).await?;
        self.connections
            .update_status(id, ConnectionStatus::Connecting, None)?;

        let client = self.build_client(id, &config, hints)?;
        self.attach(id, &config, client).await
    }

    fn build_client(
        &self,
        id: ConnectionId,
        config: &ConnectionConfig,
        mut hints: ConnectHints,
    ) -> Result<Adapter> {
        let name = format!("connection-{}", id);
        match config.transport {
            crate::transport::TransportKind::Sse => {
                let sink = hints.response_sink.take().ok_or_else(|| {
                    Error::Validation(
                        "sse client requires a live response sink; attach via GET /sse/{serverId}"
                            .to_string(),
                    )
                })?;
                let endpoint = hints
                    .endpoint
                    .take()
                    .unwrap_or_else(|| "/sse/messages".to_string());
                Ok(Adapter::Sse(SseAdapter::serve(
                    name,
                    sink,
                    id.to_string(),
                    endpoint,
                )))
            }
            crate::transport::TransportKind::Stdio => {
                let pipes = hints.stdio.take().ok_or_else(|| {
                    Error::Validation(
                        "stdio client requires the pipes of an already-spawned process".to_string(),
                    )
                })?;
                Ok(Adapter::Stdio(StdioAdapter::from_pipes(name, pipes)))
            }
            crate::transport::TransportKind::Memory => {
                let endpoint = hints.memory.take().ok_or_else(|| {
                    Error::Validation(
                        "memory client requires one end of a linked channel pair".to_string(),
                    )
                })?;
                Ok(Adapter::Memory(endpoint))
            }
        }
    }

    /// Binds a fresh server-side tap, builds and starts the handler, and
    /// flips the connection to Connected. Cleans up the handler on failure;
    /// the caller owns client-adapter cleanup.
    async fn attach(
        &self,
        id: ConnectionId,
        config: &ConnectionConfig,
        client: Adapter,
    ) -> Result<()> {
        let server = self.servers.get(config.server_id)?;
        let root = server.transport.ok_or_else(|| {
            Error::Transport(format!("server {} has no live transport", config.server_id))
        })?;
        let tap = root.bind(format!("connection-{}-tap", id))?;

        self.connections.update_client(id, Some(client.clone()))?;
        let handler = Arc::new(Handler::new(id, client, tap)?);
        if let Err(e) = handler.start(self.events.clone()).await {
            handler.stop(false).await;
            return Err(e);
        }

        self.handlers
            .lock()
            .map_err(|_| Error::Internal("handler map lock poisoned".to_string()))?
            .insert(id, handler);
        self.connections
            .update_status(id, ConnectionStatus::Connected, None)?;
        self.connections.reset_reconnect_count(id)?;
        Ok(())
    }

    /// Takes the bridge down and closes the client adapter. Idempotent
    /// while Disconnected or Disconnecting.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<()> {
        teardown_connection(&self.connections, &self.handlers, id, true).await
    }

    /// Disconnects (if needed) and removes the connection record.
    pub async fn remove_connection(&self, id: ConnectionId) -> Result<()> {
        self.disconnect(id).await?;
        self.connections.remove(id)
    }

    /// Re-drives an existing connection under its own id: detach whatever
    /// handler is live, keep the client adapter, ensure the server runs,
    /// and rebuild the bridge.
    pub async fn reconnect(&self, id: ConnectionId) -> Result<()> {
        let instance = self.connections.get(id)?;
        let client = instance
            .client
            .clone()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| Error::ConnectionFailed {
                connection: id.to_string(),
                source: Box::new(Error::InvalidState {
                    id: id.to_string(),
                    message: "no open client transport to reconnect".to_string(),
                }),
            })?;

        teardown_connection(&self.connections, &self.handlers, id, false).await?;
        self.connections.increment_reconnect_count(id)?;

        let result: Result<()> = async {
            self.supervisor.start(instance.config.server_id).await?;
            self.connections
                .update_status(id, ConnectionStatus::Connecting, None)?;
            self.attach(id, &instance.config, client).await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(connection = %id, "Connection re-established");
                Ok(())
            }
            Err(e) => {
                let _ = self.connections.update_status(
                    id,
                    ConnectionStatus::Error,
                    Some(e.to_string()),
                );
                Err(Error::ConnectionFailed {
                    connection: id.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Routes a frame that arrived on the companion POST endpoint of an
    /// SSE-served client into that connection's bridge.
    pub fn handle_inbound_sse_post(&self, id: ConnectionId, frame: Frame) -> Result<()> {
        let client = self
            .connections
            .client(id)?
            .ok_or_else(|| Error::InvalidState {
                id: id.to_string(),
                message: "connection has no live client transport".to_string(),
            })?;
        client.deliver_inbound(frame)
    }

    // ----- lifecycle events ------------------------------------------------

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::ConnectionClosed { id, reason } => {
                    self.on_connection_closed(id, reason).await;
                }
            }
        }
    }

    async fn on_connection_closed(self: &Arc<Self>, id: ConnectionId, reason: CloseReason) {
        let instance = match self.connections.get(id) {
            Ok(instance) => instance,
            Err(_) => return,
        };
        // Operator-driven paths and duplicate close reports land here too;
        // only a connection still believed Connected needs handling.
        if instance.status != ConnectionStatus::Connected {
            return;
        }
        tracing::info!(connection = %id, reason = ?reason, "Connection closed");

        let wants_reconnect = reason == CloseReason::Server
            && instance.config.reconnect
            && instance
                .config
                .max_reconnects
                .map_or(true, |max| instance.reconnect_count < max)
            && instance.client.as_ref().map_or(false, |c| !c.is_closed());

        if let Err(e) =
            teardown_connection(&self.connections, &self.handlers, id, !wants_reconnect).await
        {
            tracing::warn!(connection = %id, error = %e, "Teardown after close failed");
        }
        if !wants_reconnect {
            return;
        }

        let generation = self.connections.generation(id).unwrap_or(0);
        let delay = instance.config.reconnect_delay();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !manager.connections.contains(id) {
                return;
            }
            // An operator disconnect or removal moved the generation on;
            // this attempt belongs to a life that is over.
            match manager.connections.generation(id) {
                Ok(current) if current == generation => {}
                _ => return,
            }
            match manager.reconnect(id).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "Automatic reconnect failed");
                }
            }
        });
    }
}
