//! Bridge orchestration: handlers, the manager, and the shared teardown
//! path the supervisor also drives when it stops a server.

pub mod handler;
pub mod manager;

pub use handler::{supported_combination, BridgeEvent, CloseReason, Handler};
pub use manager::{BridgeManager, ConnectHints, EnvUpdateOutcome};

use crate::connection::{ConnectionId, ConnectionRegistry, ConnectionStatus};
use crate::error::Result;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Live handlers keyed by connection id. A connection is Connected exactly
/// while an entry exists here.
pub(crate) type HandlerMap = Mutex<HashMap<ConnectionId, Arc<Handler>>>;

/// Takes a connection down: Disconnecting, stop the handler, Disconnected.
///
/// With `close_client` unset the client adapter survives (the hot-swap and
/// reconnect paths rebuild the server side under it); the registry keeps the
/// handle in that case so a later reconnect can pick it up.
pub(crate) async fn teardown_connection(
    connections: &ConnectionRegistry,
    handlers: &HandlerMap,
    id: ConnectionId,
    close_client: bool,
) -> Result<()> {
    let status = connections.status(id)?;
    if matches!(
        status,
        ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting
    ) {
        return Ok(());
    }

    connections.bump_generation(id)?;
    connections.update_status(id, ConnectionStatus::Disconnecting, None)?;

    let handler = handlers
        .lock()
        .map_err(|_| crate::error::Error::Internal("handler map lock poisoned".to_string()))?
        .remove(&id);
    match handler {
        Some(handler) => handler.stop(close_client).await,
        None => {
            if close_client {
                if let Ok(Some(client)) = connections.client(id) {
                    client.close().await;
                }
            }
        }
    }

    if close_client {
        connections.update_client(id, None)?;
    }
    connections.update_status(id, ConnectionStatus::Disconnected, None)?;
    Ok(())
}
