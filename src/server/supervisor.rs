//! Server supervision: bring an instance to Running or Stopped.
//!
//! The supervisor is the only component that mutates a server's status
//! machine. Process exits are observed by a watcher task and serialized
//! against operator stops through the instance's generation counter: an
//! operator stop bumps the generation, so an exit notification (or a
//! pending crash-restart sleep) from an earlier life of the instance finds
//! the counter moved and drops itself.

use crate::bridge::{teardown_connection, HandlerMap};
use crate::connection::{ConnectionRegistry, ConnectionStatus};
use crate::error::{Error, Result};
use crate::server::process::{ProcessExit, ProcessHandle, SpawnedProcess};
use crate::server::registry::{ServerConfig, ServerId, ServerRegistry, ServerStatus};
use crate::transport::{Adapter, MemoryAdapter, SseAdapter, StdioAdapter, TransportKind};

use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures_lite::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Bounded wait for a self-initiated exit before force-killing.
const STOP_GRACE: Duration = Duration::from_secs(5);

struct BuiltTransport {
    adapter: Adapter,
    process: Option<ProcessHandle>,
    backend: Option<Adapter>,
}

/// Brings servers between Stopped and Running.
pub struct Supervisor {
    servers: Arc<ServerRegistry>,
    connections: Arc<ConnectionRegistry>,
    handlers: Arc<HandlerMap>,
}

impl Supervisor {
    pub(crate) fn new(
        servers: Arc<ServerRegistry>,
        connections: Arc<ConnectionRegistry>,
        handlers: Arc<HandlerMap>,
    ) -> Self {
        Self {
            servers,
            connections,
            handlers,
        }
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    /// Operator-initiated start. Idempotent while Running or Starting.
    pub async fn start(self: &Arc<Self>, id: ServerId) -> Result<()> {
        self.start_inner(id, true).await
    }

    async fn start_inner(self: &Arc<Self>, id: ServerId, operator: bool) -> Result<()> {
        let instance = self.servers.get(id)?;
        if matches!(
            instance.status,
            ServerStatus::Running | ServerStatus::Starting
        ) {
            return Ok(());
        }

        self.servers.update_status(id, ServerStatus::Starting, None)?;
        let generation = self.servers.generation(id)?;
        tracing::info!(server = %id, name = %instance.config.name, "Starting server");

        let built = match self.build_transport(&instance.config).await {
            Ok(built) => built,
            Err(e) => {
                self.servers
                    .update_status(id, ServerStatus::Error, Some(e.to_string()))?;
                return Err(Error::ServerStartFailed {
                    server: id.to_string(),
                    source: Box::new(e),
                });
            }
        };

        if let Err(e) = built.adapter.start().await {
            if let Some(process) = &built.process {
                let _ = process.terminate(Duration::from_millis(200)).await;
            }
            self.servers
                .update_status(id, ServerStatus::Error, Some(e.to_string()))?;
            return Err(Error::ServerStartFailed {
                server: id.to_string(),
                source: Box::new(e),
            });
        }

        let process = built.process.clone();
        self.servers.update_process(id, built.process)?;
        self.servers.update_transport(id, Some(built.adapter))?;
        self.servers.set_backend(id, built.backend)?;
        self.servers.update_status(id, ServerStatus::Running, None)?;
        if operator {
            // Crash-driven re-entry keeps its count; it bounds the loop.
            self.servers.reset_restart_count(id)?;
        }
        // Installed only once the instance is Running, so an instant crash
        // cannot have its exit notification race the transition itself; the
        // watch channel retains an exit that already happened.
        if let Some(process) = process {
            self.spawn_exit_watcher(id, process, generation);
        }
        tracing::info!(server = %id, name = %instance.config.name, "Server running");
        Ok(())
    }

    /// Operator-initiated stop. Idempotent while Stopped or Stopping.
    /// Disconnects the server's connections first, closes the adapter
    /// (stdin EOF is the graceful signal for stdio children), then waits a
    /// bounded grace period before force-killing the process.
    pub async fn stop(&self, id: ServerId) -> Result<()> {
        let instance = self.servers.get(id)?;
        if matches!(
            instance.status,
            ServerStatus::Stopped | ServerStatus::Stopping
        ) {
            return Ok(());
        }

        self.servers.bump_generation(id)?;
        self.servers.update_status(id, ServerStatus::Stopping, None)?;
        tracing::info!(server = %id, name = %instance.config.name, "Stopping server");

        for connection in self.connections.list_for_server(id) {
            if connection.status == ConnectionStatus::Disconnected {
                continue;
            }
            let connection_id = connection.id();
            if let Err(e) =
                teardown_connection(&self.connections, &self.handlers, connection_id, true).await
            {
                tracing::warn!(
                    server = %id,
                    connection = %connection_id,
                    error = %e,
                    "Failed to disconnect connection during server stop"
                );
            }
        }

        if let Some(adapter) = instance.transport.clone() {
            adapter.close().await;
        }

        let mut stop_error = None;
        if let Some(process) = instance.process.clone() {
            match process.terminate(STOP_GRACE).await {
                Ok(exit) => {
                    tracing::debug!(server = %id, success = exit.success, "Server process terminated");
                }
                Err(e) => stop_error = Some(e),
            }
        }

        self.servers.update_process(id, None)?;
        self.servers.update_transport(id, None)?;
        self.servers.set_backend(id, None)?;
        self.servers.update_status(id, ServerStatus::Stopped, None)?;

        match stop_error {
            Some(e) => Err(Error::ServerStopFailed {
                server: id.to_string(),
                source: Box::new(e),
            }),
            None => Ok(()),
        }
    }

    /// Stop followed by an operator start; the hot-swap primitive.
    pub async fn restart(self: &Arc<Self>, id: ServerId) -> Result<()> {
        self.stop(id).await?;
        self.start(id).await
    }

    async fn build_transport(&self, config: &ServerConfig) -> Result<BuiltTransport> {
        match config.transport {
            TransportKind::Stdio => {
                let spawned = ProcessHandle::spawn(&config.name, config, true)?;
                let SpawnedProcess {
                    handle,
                    pipes,
                    stderr,
                    ..
                } = spawned;
                let pipes = pipes
                    .ok_or_else(|| Error::Process("spawned process lost its pipes".to_string()))?;
                spawn_pipe_logger(config.name.clone(), "stderr", stderr);
                Ok(BuiltTransport {
                    adapter: Adapter::Stdio(StdioAdapter::from_pipes(config.name.clone(), pipes)),
                    process: Some(handle),
                    backend: None,
                })
            }
            TransportKind::Sse => {
                let options = config.sse_options.as_ref().ok_or_else(|| {
                    Error::ConfigInvalid(format!(
                        "server {} declares sse transport without sseOptions",
                        config.name
                    ))
                })?;
                let spawned = ProcessHandle::spawn(&config.name, config, false)?;
                spawn_pipe_logger(config.name.clone(), "stderr", spawned.stderr);
                if let Some(stdout) = spawned.stdout_log {
                    spawn_pipe_logger(config.name.clone(), "stdout", stdout);
                }
                let adapter = SseAdapter::dial(config.name.clone(), &options.stream_url())?;
                Ok(BuiltTransport {
                    adapter: Adapter::Sse(adapter),
                    process: Some(spawned.handle),
                    backend: None,
                })
            }
            TransportKind::Memory => {
                let (server_end, backend_end) = MemoryAdapter::pair(
                    format!("{}-server", config.name),
                    format!("{}-backend", config.name),
                );
                Ok(BuiltTransport {
                    adapter: Adapter::Memory(server_end),
                    process: None,
                    backend: Some(Adapter::Memory(backend_end)),
                })
            }
        }
    }

    fn spawn_exit_watcher(self: &Arc<Self>, id: ServerId, process: ProcessHandle, generation: u64) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let exit = process.wait().await;
            supervisor.on_process_exit(id, exit, generation).await;
        });
    }

    /// Applies a "process exited" notification. An exit from a superseded
    /// generation, or one arriving while the operator holds the instance in
    /// Stopping, is absorbed.
    async fn on_process_exit(self: &Arc<Self>, id: ServerId, exit: ProcessExit, generation: u64) {
        if !self.servers.contains(id) {
            return;
        }
        match self.servers.generation(id) {
            Ok(current) if current == generation => {}
            _ => return,
        }
        match self.servers.status(id) {
            Ok(ServerStatus::Running) => {}
            // Stopping absorbs the exit; the stop path finishes the
            // transition. Anything else belongs to a life already over.
            _ => return,
        }

        tracing::warn!(server = %id, success = exit.success, code = ?exit.code, "Server process exited unexpectedly");

        if let Ok(instance) = self.servers.get(id) {
            if let Some(adapter) = instance.transport {
                adapter.close().await;
            }
        }
        let error = if exit.success {
            None
        } else {
            Some(match exit.code {
                Some(code) => format!("process exited with status {}", code),
                None => "process terminated by signal".to_string(),
            })
        };
        let _ = self.servers.update_process(id, None);
        let _ = self.servers.update_transport(id, None);
        let _ = self.servers.set_backend(id, None);
        let _ = self.servers.update_status(id, ServerStatus::Stopped, error);

        if !self.servers.should_restart(id).unwrap_or(false) {
            return;
        }
        let count = match self.servers.increment_restart_count(id) {
            Ok(count) => count,
            Err(_) => return,
        };
        let delay = self
            .servers
            .restart_delay(id)
            .unwrap_or(crate::server::registry::DEFAULT_RESTART_DELAY);
        tracing::info!(server = %id, attempt = count, delay_ms = delay.as_millis() as u64, "Scheduling restart");

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The instance may have been unregistered, stopped, or already
            // restarted while we slept.
            if !supervisor.servers.contains(id) {
                return;
            }
            match supervisor.servers.generation(id) {
                Ok(current) if current == generation => {}
                _ => return,
            }
            match supervisor.servers.status(id) {
                Ok(ServerStatus::Stopped) => {}
                _ => return,
            }
            if let Err(e) = supervisor.start_inner(id, false).await {
                tracing::warn!(server = %id, error = %e, "Restart attempt failed");
            }
        });
    }
}

/// Drains a captured child pipe into the log, one line at a time.
fn spawn_pipe_logger<R>(server: String, stream: &'static str, pipe: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if line.is_empty() => {}
                Ok(line) => tracing::warn!(server = %server, stream, "{}", line),
                Err(_) => break,
            }
        }
    });
}
