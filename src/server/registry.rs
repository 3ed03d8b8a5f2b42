//! Server catalog: declared servers, their config and runtime state.
//!
//! All operations are synchronous and atomic with respect to each other;
//! the registry is the single authority for a server's status machine, and
//! only the supervisor mutates it.

use crate::error::{Error, Result};
use crate::server::process::ProcessHandle;
use crate::transport::{Adapter, TransportKind};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Restart delay applied when a config leaves it unset.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Unique identifier for a declared server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(Uuid);

impl ServerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::Validation(format!("invalid server id: {}", s)))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SSE listen options of a server whose native transport is sse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseOptions {
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
}

impl SseOptions {
    /// URL of the server's event stream.
    pub fn stream_url(&self) -> String {
        let host = self.host.as_deref().unwrap_or("127.0.0.1");
        format!("http://{}:{}/sse", host, self.port)
    }
}

/// Configuration for a single bridged server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Identity; minted at registration when absent.
    #[serde(default)]
    pub id: Option<ServerId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Command to execute; unused by memory servers.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Environment set on the spawned process, merged over the inherited one.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Native transport of the server; immutable after registration.
    pub transport: TransportKind,
    #[serde(default)]
    pub sse_options: Option<SseOptions>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub restart_delay_ms: Option<u64>,
    /// Start the server as soon as it is registered from a config file.
    #[serde(default)]
    pub auto_start: bool,
}

impl ServerConfig {
    /// Minimal declaration; fill in launch parameters as needed.
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: None,
            command: String::new(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            transport,
            sse_options: None,
            auto_restart: false,
            max_restarts: None,
            restart_delay_ms: None,
            auto_start: false,
        }
    }
}

/// Status of a declared server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A declared server plus its runtime state.
#[derive(Clone, Debug)]
pub struct ServerInstance {
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub process: Option<ProcessHandle>,
    pub transport: Option<Adapter>,
    /// Far end of a memory server's channel pair, parked for the embedding
    /// code to take.
    pub backend: Option<Adapter>,
    pub last_error: Option<String>,
    pub start_time: Option<SystemTime>,
    pub restart_count: u32,
    /// Bumped on every operator stop/unregister; pending crash restarts
    /// compare it and drop themselves when it moved.
    pub generation: u64,
}

impl ServerInstance {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Stopped,
            process: None,
            transport: None,
            backend: None,
            last_error: None,
            start_time: None,
            restart_count: 0,
            generation: 0,
        }
    }

    pub fn id(&self) -> ServerId {
        self.config.id.expect("registered instance has an id")
    }

    /// List projection: identity and liveness only.
    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            id: self.id(),
            name: self.config.name.clone(),
            transport: self.config.transport,
            status: self.status,
            start_time: self.start_time.map(epoch_millis),
            error: self.last_error.clone(),
        }
    }

    /// Full projection, omitting the process and transport handles.
    pub fn details(&self) -> ServerDetails {
        ServerDetails {
            id: self.id(),
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            cwd: self.config.cwd.clone(),
            env: self.config.env.clone(),
            transport: self.config.transport,
            sse_options: self.config.sse_options.clone(),
            auto_restart: self.config.auto_restart,
            max_restarts: self.config.max_restarts,
            restart_delay_ms: self.config.restart_delay_ms,
            status: self.status,
            start_time: self.start_time.map(epoch_millis),
            error: self.last_error.clone(),
            restart_count: self.restart_count,
            has_process: self.process.is_some(),
            has_transport: self.transport.is_some(),
        }
    }
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wire projection for server listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: ServerId,
    pub name: String,
    pub transport: TransportKind,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wire projection for a single server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetails {
    pub id: ServerId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_options: Option<SseOptions>,
    pub auto_restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_delay_ms: Option<u64>,
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub restart_count: u32,
    pub has_process: bool,
    pub has_transport: bool,
}

struct RegistryState {
    servers: HashMap<ServerId, ServerInstance>,
    /// Registration order, for stable listings.
    order: Vec<ServerId>,
}

/// In-memory catalog of declared servers, keyed by id.
pub struct ServerRegistry {
    state: Mutex<RegistryState>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                servers: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    fn locked(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("server registry lock poisoned".to_string()))
    }

    fn with_instance<T>(
        &self,
        id: ServerId,
        f: impl FnOnce(&mut ServerInstance) -> T,
    ) -> Result<T> {
        let mut state = self.locked()?;
        let instance = state
            .servers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;
        Ok(f(instance))
    }

    /// Registers a server, minting an id when the config carries none.
    pub fn register(&self, mut config: ServerConfig) -> Result<ServerId> {
        let mut state = self.locked()?;
        let id = config.id.unwrap_or_else(ServerId::new);
        if state.servers.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("server {}", id)));
        }
        config.id = Some(id);
        state.servers.insert(id, ServerInstance::new(config));
        state.order.push(id);
        Ok(id)
    }

    /// Removes a server. Only Stopped instances can be removed.
    pub fn unregister(&self, id: ServerId) -> Result<()> {
        let mut state = self.locked()?;
        let instance = state
            .servers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;
        if instance.status != ServerStatus::Stopped {
            return Err(Error::InvalidState {
                id: id.to_string(),
                message: format!("cannot unregister while {}", instance.status),
            });
        }
        instance.generation += 1;
        state.servers.remove(&id);
        state.order.retain(|x| *x != id);
        Ok(())
    }

    pub fn get(&self, id: ServerId) -> Result<ServerInstance> {
        self.with_instance(id, |i| i.clone())
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.locked()
            .map(|s| s.servers.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<ServerInstance> {
        match self.locked() {
            Ok(state) => state
                .order
                .iter()
                .filter_map(|id| state.servers.get(id).cloned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn status(&self, id: ServerId) -> Result<ServerStatus> {
        self.with_instance(id, |i| i.status)
    }

    /// Sets the status and, when given, the last error. Entering Running
    /// stamps the start time; entering Stopped clears it.
    pub fn update_status(
        &self,
        id: ServerId,
        status: ServerStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.with_instance(id, |i| {
            i.status = status;
            if let Some(error) = error {
                i.last_error = Some(error);
            }
            match status {
                ServerStatus::Running => {
                    i.start_time = Some(SystemTime::now());
                    i.last_error = None;
                }
                ServerStatus::Stopped => i.start_time = None,
                _ => {}
            }
        })
    }

    pub fn update_process(&self, id: ServerId, process: Option<ProcessHandle>) -> Result<()> {
        self.with_instance(id, |i| i.process = process)
    }

    pub fn update_transport(&self, id: ServerId, transport: Option<Adapter>) -> Result<()> {
        self.with_instance(id, |i| i.transport = transport)
    }

    pub fn set_backend(&self, id: ServerId, backend: Option<Adapter>) -> Result<()> {
        self.with_instance(id, |i| i.backend = backend)
    }

    /// Takes the parked far end of a memory server's channel pair.
    pub fn take_backend(&self, id: ServerId) -> Result<Option<Adapter>> {
        self.with_instance(id, |i| i.backend.take())
    }

    pub fn increment_restart_count(&self, id: ServerId) -> Result<u32> {
        self.with_instance(id, |i| {
            i.restart_count += 1;
            i.restart_count
        })
    }

    pub fn reset_restart_count(&self, id: ServerId) -> Result<()> {
        self.with_instance(id, |i| i.restart_count = 0)
    }

    pub fn restart_count(&self, id: ServerId) -> Result<u32> {
        self.with_instance(id, |i| i.restart_count)
    }

    /// Merges an environment delta into the config (delta wins on
    /// collision). Returns true when the server is Running, i.e. a restart
    /// is required before the change takes effect. Rejected outside
    /// {Stopped, Running} to avoid racing a start or stop in flight.
    pub fn merge_env(&self, id: ServerId, delta: &HashMap<String, String>) -> Result<bool> {
        let mut state = self.locked()?;
        let instance = state
            .servers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;
        match instance.status {
            ServerStatus::Stopped | ServerStatus::Running => {}
            other => {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    message: format!("cannot update environment while {}", other),
                });
            }
        }
        for (key, value) in delta {
            instance.config.env.insert(key.clone(), value.clone());
        }
        Ok(instance.status == ServerStatus::Running)
    }

    /// Applies a partial config update. Only Stopped instances can change.
    /// The declared transport is immutable after registration.
    pub fn update_config(&self, id: ServerId, update: ServerConfigUpdate) -> Result<()> {
        let mut state = self.locked()?;
        let instance = state
            .servers
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;
        if instance.status != ServerStatus::Stopped {
            return Err(Error::InvalidState {
                id: id.to_string(),
                message: format!("cannot update config while {}", instance.status),
            });
        }
        update.apply(&mut instance.config);
        Ok(())
    }

    /// Whether a crash should schedule another start attempt.
    pub fn should_restart(&self, id: ServerId) -> Result<bool> {
        self.with_instance(id, |i| {
            i.config.auto_restart
                && i.config
                    .max_restarts
                    .map_or(true, |max| i.restart_count < max)
        })
    }

    pub fn restart_delay(&self, id: ServerId) -> Result<Duration> {
        self.with_instance(id, |i| {
            i.config
                .restart_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RESTART_DELAY)
        })
    }

    pub fn bump_generation(&self, id: ServerId) -> Result<u64> {
        self.with_instance(id, |i| {
            i.generation += 1;
            i.generation
        })
    }

    pub fn generation(&self, id: ServerId) -> Result<u64> {
        self.with_instance(id, |i| i.generation)
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Partial update applied by PUT on a stopped server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfigUpdate {
    pub name: Option<String>,
    pub version: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub sse_options: Option<SseOptions>,
    pub auto_restart: Option<bool>,
    pub max_restarts: Option<u32>,
    pub restart_delay_ms: Option<u64>,
}

impl ServerConfigUpdate {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(version) = self.version {
            config.version = Some(version);
        }
        if let Some(command) = self.command {
            config.command = command;
        }
        if let Some(args) = self.args {
            config.args = args;
        }
        if let Some(cwd) = self.cwd {
            config.cwd = Some(cwd);
        }
        if let Some(env) = self.env {
            config.env = env;
        }
        if let Some(sse_options) = self.sse_options {
            config.sse_options = Some(sse_options);
        }
        if let Some(auto_restart) = self.auto_restart {
            config.auto_restart = auto_restart;
        }
        if let Some(max_restarts) = self.max_restarts {
            config.max_restarts = Some(max_restarts);
        }
        if let Some(restart_delay_ms) = self.restart_delay_ms {
            config.restart_delay_ms = Some(restart_delay_ms);
        }
    }
}
