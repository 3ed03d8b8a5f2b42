//! HTTP request handlers for the admin surface.
//!
//! A thin request-validation veneer: each handler parses and validates its
//! input, invokes the corresponding bridge-manager operation, and projects
//! the result. No bridge semantics live here.

use crate::admin::types::{CreatedResponse, EnvUpdateResponse, SessionQuery};
use crate::bridge::{BridgeManager, ConnectHints};
use crate::connection::{ConnectionConfig, ConnectionId};
use crate::error::{Error, Result};
use crate::server::{ServerConfig, ServerConfigUpdate, ServerId};
use crate::transport::{Frame, SseSink, TransportKind};

use actix_web::web::{Bytes, Data, Json, Path, Query};
use actix_web::{HttpResponse, Responder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Outbound chunks buffered per attached SSE client.
const SSE_SINK_CAPACITY: usize = 64;
const SSE_HEARTBEAT: Duration = Duration::from_secs(30);

type Manager = Data<Arc<BridgeManager>>;

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

// ----- servers --------------------------------------------------------------

pub async fn list_servers(manager: Manager) -> impl Responder {
    let servers: Vec<_> = manager
        .list_servers()
        .iter()
        .map(|instance| instance.summary())
        .collect();
    HttpResponse::Ok().json(servers)
}

pub async fn create_server(manager: Manager, body: Json<ServerConfig>) -> Result<impl Responder> {
    let config = body.into_inner();
    if config.id.is_some() {
        return Err(Error::Validation(
            "server id is assigned by the bridge, not the caller".to_string(),
        ));
    }
    let id = manager.register_server(config)?;
    tracing::info!(server = %id, "Registered server");
    Ok(HttpResponse::Created().json(CreatedResponse { id: id.to_string() }))
}

pub async fn get_server(manager: Manager, path: Path<String>) -> Result<impl Responder> {
    let id = ServerId::parse(&path)?;
    let instance = manager.get_server(id)?;
    Ok(HttpResponse::Ok().json(instance.details()))
}

pub async fn update_server(
    manager: Manager,
    path: Path<String>,
    body: Json<ServerConfigUpdate>,
) -> Result<impl Responder> {
    let id = ServerId::parse(&path)?;
    manager.update_server(id, body.into_inner())?;
    let instance = manager.get_server(id)?;
    Ok(HttpResponse::Ok().json(instance.details()))
}

pub async fn delete_server(manager: Manager, path: Path<String>) -> Result<impl Responder> {
    let id = ServerId::parse(&path)?;
    manager.remove_server(id).await?;
    tracing::info!(server = %id, "Removed server");
    Ok(HttpResponse::NoContent().finish())
}

pub async fn start_server(manager: Manager, path: Path<String>) -> Result<impl Responder> {
    let id = ServerId::parse(&path)?;
    manager.start_server(id).await?;
    let instance = manager.get_server(id)?;
    Ok(HttpResponse::Ok().json(instance.details()))
}

pub async fn stop_server(manager: Manager, path: Path<String>) -> Result<impl Responder> {
    let id = ServerId::parse(&path)?;
    manager.stop_server(id).await?;
    let instance = manager.get_server(id)?;
    Ok(HttpResponse::Ok().json(instance.details()))
}

pub async fn update_environment(
    manager: Manager,
    path: Path<String>,
    body: Json<Value>,
) -> Result<impl Responder> {
    let id = ServerId::parse(&path)?;
    let delta = parse_env_delta(body.into_inner())?;
    let outcome = manager.update_environment(id, &delta).await?;
    let instance = manager.get_server(id)?;
    Ok(HttpResponse::Ok().json(EnvUpdateResponse {
        env: instance.config.env.clone(),
        status: instance.status,
        restarted: outcome.restarted,
        reconnected: outcome
            .reconnected
            .iter()
            .map(|id| id.to_string())
            .collect(),
        failed: outcome
            .failed
            .iter()
            .map(|f| json!({ "connectionId": f.connection_id.to_string(), "error": f.error }))
            .collect(),
    }))
}

/// The environment body is a flat object of string values; anything else
/// is a validation error.
fn parse_env_delta(body: Value) -> Result<HashMap<String, String>> {
    let object = match body {
        Value::Object(object) => object,
        other => {
            return Err(Error::Validation(format!(
                "environment must be a JSON object, got {}",
                other
            )));
        }
    };
    let mut delta = HashMap::new();
    for (key, value) in object {
        match value {
            Value::String(value) => {
                delta.insert(key, value);
            }
            other => {
                return Err(Error::Validation(format!(
                    "environment value for {} must be a string, got {}",
                    key, other
                )));
            }
        }
    }
    Ok(delta)
}

// ----- connections ----------------------------------------------------------

pub async fn list_connections(manager: Manager) -> impl Responder {
    let connections: Vec<_> = manager
        .list_connections()
        .iter()
        .map(|instance| instance.details())
        .collect();
    HttpResponse::Ok().json(connections)
}

pub async fn create_connection(
    manager: Manager,
    body: Json<ConnectionConfig>,
) -> Result<impl Responder> {
    let id = manager
        .connect(body.into_inner(), ConnectHints::default())
        .await?;
    Ok(HttpResponse::Created().json(CreatedResponse { id: id.to_string() }))
}

pub async fn get_connection(manager: Manager, path: Path<String>) -> Result<impl Responder> {
    let id = ConnectionId::parse(&path)?;
    let instance = manager.get_connection(id)?;
    Ok(HttpResponse::Ok().json(instance.details()))
}

pub async fn delete_connection(manager: Manager, path: Path<String>) -> Result<impl Responder> {
    let id = ConnectionId::parse(&path)?;
    manager.remove_connection(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn disconnect_connection(
    manager: Manager,
    path: Path<String>,
) -> Result<impl Responder> {
    let id = ConnectionId::parse(&path)?;
    manager.disconnect(id).await?;
    let instance = manager.get_connection(id)?;
    Ok(HttpResponse::Ok().json(instance.details()))
}

pub async fn reconnect_connection(manager: Manager, path: Path<String>) -> Result<impl Responder> {
    let id = ConnectionId::parse(&path)?;
    manager.reconnect(id).await?;
    let instance = manager.get_connection(id)?;
    Ok(HttpResponse::Ok().json(instance.details()))
}

// ----- SSE attach -----------------------------------------------------------

/// Attaches a web client to a server over SSE.
///
/// Creates the response sink, connects an sse client through the bridge
/// manager, and streams the adapter's outbound events. The first event
/// advertises the companion POST endpoint carrying the session id.
pub async fn sse_attach(manager: Manager, path: Path<String>) -> Result<HttpResponse> {
    let server_id = ServerId::parse(&path)?;

    let (sink, mut chunks) = SseSink::channel(SSE_SINK_CAPACITY);
    let config = ConnectionConfig::new(server_id, TransportKind::Sse);
    let hints = ConnectHints {
        response_sink: Some(sink),
        endpoint: Some("/sse/messages".to_string()),
        ..ConnectHints::default()
    };
    let connection_id = manager.connect(config, hints).await?;
    tracing::info!(server = %server_id, connection = %connection_id, "SSE client attached");

    let stream = async_stream::stream! {
        let mut heartbeat = interval(SSE_HEARTBEAT);
        heartbeat.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => yield Ok::<_, actix_web::Error>(Bytes::from(chunk)),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    yield Ok::<_, actix_web::Error>(Bytes::from_static(b":\n\n"));
                }
            }
        }
    };

    Ok(HttpResponse::Ok()
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream))
}

/// Companion POST endpoint: frames from the attached web client.
pub async fn sse_messages(
    manager: Manager,
    query: Query<SessionQuery>,
    body: Bytes,
) -> Result<impl Responder> {
    let connection_id = ConnectionId::parse(&query.session_id)?;
    let frame = Frame::from_slice(&body)
        .map_err(|e| Error::Validation(format!("invalid frame: {}", e)))?;
    manager.handle_inbound_sse_post(connection_id, frame)?;
    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "sessionId": query.session_id,
    })))
}
