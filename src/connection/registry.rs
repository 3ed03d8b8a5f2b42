//! Connection catalog: client connections, their config and runtime state.

use crate::error::{Error, Result};
use crate::server::ServerId;
use crate::transport::{Adapter, TransportKind};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Reconnect delay applied when a config leaves it unset.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Unique identifier for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::Validation(format!("invalid connection id: {}", s)))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for a single client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Identity; minted at creation when absent.
    #[serde(default)]
    pub id: Option<ConnectionId>,
    /// Server this connection bridges to.
    pub server_id: ServerId,
    /// Client-side transport.
    pub transport: TransportKind,
    /// Overall budget for establishing the bridge.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Re-establish the bridge after a server-side drop.
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default)]
    pub max_reconnects: Option<u32>,
    #[serde(default)]
    pub reconnect_delay_ms: Option<u64>,
}

impl ConnectionConfig {
    /// Minimal config for in-process callers.
    pub fn new(server_id: ServerId, transport: TransportKind) -> Self {
        Self {
            id: None,
            server_id,
            transport,
            timeout_ms: None,
            reconnect: false,
            max_reconnects: None,
            reconnect_delay_ms: None,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECONNECT_DELAY)
    }
}

/// Status of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A client connection plus its runtime state.
#[derive(Clone, Debug)]
pub struct ConnectionInstance {
    pub config: ConnectionConfig,
    pub status: ConnectionStatus,
    /// The client-side adapter, present while a bridge is up (and retained
    /// through a hot-swap so the far side stays attached).
    pub client: Option<Adapter>,
    pub last_error: Option<String>,
    pub connect_time: Option<SystemTime>,
    pub reconnect_count: u32,
    /// Bumped on operator disconnect/removal; pending reconnects compare it
    /// and drop themselves when it moved.
    pub generation: u64,
}

impl ConnectionInstance {
    fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            client: None,
            last_error: None,
            connect_time: None,
            reconnect_count: 0,
            generation: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.config.id.expect("created instance has an id")
    }

    /// Wire projection, omitting the transport handle.
    pub fn details(&self) -> ConnectionDetails {
        ConnectionDetails {
            id: self.id(),
            server_id: self.config.server_id,
            transport: self.config.transport,
            status: self.status,
            connect_time: self.connect_time.map(|t| {
                t.duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            }),
            error: self.last_error.clone(),
            reconnect_count: self.reconnect_count,
        }
    }
}

/// Wire projection of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub id: ConnectionId,
    pub server_id: ServerId,
    pub transport: TransportKind,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reconnect_count: u32,
}

struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionInstance>,
    order: Vec<ConnectionId>,
}

/// In-memory catalog of client connections, keyed by id.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                connections: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    fn locked(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("connection registry lock poisoned".to_string()))
    }

    fn with_instance<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionInstance) -> T,
    ) -> Result<T> {
        let mut state = self.locked()?;
        let instance = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", id)))?;
        Ok(f(instance))
    }

    /// Reserves a connection in Disconnected, minting an id when absent.
    pub fn create(&self, mut config: ConnectionConfig) -> Result<ConnectionId> {
        let mut state = self.locked()?;
        let id = config.id.unwrap_or_else(ConnectionId::new);
        if state.connections.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("connection {}", id)));
        }
        config.id = Some(id);
        state.connections.insert(id, ConnectionInstance::new(config));
        state.order.push(id);
        Ok(id)
    }

    /// Removes a connection. Only Disconnected instances can be removed.
    pub fn remove(&self, id: ConnectionId) -> Result<()> {
        let mut state = self.locked()?;
        let instance = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", id)))?;
        if instance.status != ConnectionStatus::Disconnected {
            return Err(Error::InvalidState {
                id: id.to_string(),
                message: format!("cannot remove while {}", instance.status),
            });
        }
        instance.generation += 1;
        state.connections.remove(&id);
        state.order.retain(|x| *x != id);
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Result<ConnectionInstance> {
        self.with_instance(id, |i| i.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.locked()
            .map(|s| s.connections.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<ConnectionInstance> {
        match self.locked() {
            Ok(state) => state
                .order
                .iter()
                .filter_map(|id| state.connections.get(id).cloned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Connections targeting the given server, in creation order.
    pub fn list_for_server(&self, server_id: ServerId) -> Vec<ConnectionInstance> {
        self.list()
            .into_iter()
            .filter(|c| c.config.server_id == server_id)
            .collect()
    }

    pub fn status(&self, id: ConnectionId) -> Result<ConnectionStatus> {
        self.with_instance(id, |i| i.status)
    }

    /// Sets the status and, when given, the last error. Entering Connected
    /// stamps the connect time; entering Disconnected clears it.
    pub fn update_status(
        &self,
        id: ConnectionId,
        status: ConnectionStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.with_instance(id, |i| {
            i.status = status;
            if let Some(error) = error {
                i.last_error = Some(error);
            }
            match status {
                ConnectionStatus::Connected => {
                    i.connect_time = Some(SystemTime::now());
                    i.last_error = None;
                }
                ConnectionStatus::Disconnected => i.connect_time = None,
                _ => {}
            }
        })
    }

    pub fn update_client(&self, id: ConnectionId, client: Option<Adapter>) -> Result<()> {
        self.with_instance(id, |i| i.client = client)
    }

    pub fn client(&self, id: ConnectionId) -> Result<Option<Adapter>> {
        self.with_instance(id, |i| i.client.clone())
    }

    pub fn increment_reconnect_count(&self, id: ConnectionId) -> Result<u32> {
        self.with_instance(id, |i| {
            i.reconnect_count += 1;
            i.reconnect_count
        })
    }

    pub fn reset_reconnect_count(&self, id: ConnectionId) -> Result<()> {
        self.with_instance(id, |i| i.reconnect_count = 0)
    }

    pub fn bump_generation(&self, id: ConnectionId) -> Result<u64> {
        self.with_instance(id, |i| {
            i.generation += 1;
            i.generation
        })
    }

    pub fn generation(&self, id: ConnectionId) -> Result<u64> {
        self.with_instance(id, |i| i.generation)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
