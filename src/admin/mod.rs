//! Admin surface: the JSON HTTP API over the bridge manager.
//!
//! Server and connection CRUD, lifecycle operations, the environment
//! hot-swap, and the live SSE attach endpoints. Built on Actix Web with
//! permissive CORS, as befits a local control plane.

pub mod actix_error;
pub mod handlers;
pub mod types;

use crate::bridge::BridgeManager;
use crate::error::{Error, Result};

use actix_cors::Cors;
use actix_web::web::{self, Data};
use actix_web::{middleware, App, HttpServer};
use std::sync::Arc;

/// Mounts every admin route on the given service config.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health))
        .route("/api/servers", web::get().to(handlers::list_servers))
        .route("/api/servers", web::post().to(handlers::create_server))
        .route("/api/servers/{id}", web::get().to(handlers::get_server))
        .route("/api/servers/{id}", web::put().to(handlers::update_server))
        .route("/api/servers/{id}", web::delete().to(handlers::delete_server))
        .route(
            "/api/servers/{id}/start",
            web::post().to(handlers::start_server),
        )
        .route(
            "/api/servers/{id}/stop",
            web::post().to(handlers::stop_server),
        )
        .route(
            "/api/servers/{id}/environment",
            web::post().to(handlers::update_environment),
        )
        .route(
            "/api/connections",
            web::get().to(handlers::list_connections),
        )
        .route(
            "/api/connections",
            web::post().to(handlers::create_connection),
        )
        .route(
            "/api/connections/{id}",
            web::get().to(handlers::get_connection),
        )
        .route(
            "/api/connections/{id}",
            web::delete().to(handlers::delete_connection),
        )
        .route(
            "/api/connections/{id}/disconnect",
            web::post().to(handlers::disconnect_connection),
        )
        .route(
            "/api/connections/{id}/reconnect",
            web::post().to(handlers::reconnect_connection),
        )
        .route("/sse/{server_id}", web::get().to(handlers::sse_attach))
        .route("/sse/messages", web::post().to(handlers::sse_messages));
}

/// JSON extractor config that reports schema violations in the API's own
/// error envelope instead of Actix's default body.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let message = err.to_string();
        actix_web::error::InternalError::from_response(
            err,
            actix_web::HttpResponse::BadRequest()
                .content_type("application/json")
                .json(actix_error::envelope("ValidationError", &message)),
        )
        .into()
    })
}

/// Serves the admin API until the server is stopped.
pub async fn run(manager: Arc<BridgeManager>, host: &str, port: u16) -> Result<()> {
    let manager = Data::new(manager);
    tracing::info!(host, port, "Starting admin API");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(manager.clone())
            .app_data(json_config())
            .configure(configure)
    })
    .bind((host, port))
    .map_err(|e| Error::Internal(format!("failed to bind {}:{}: {}", host, port, e)))?
    .run()
    .await
    .map_err(|e| Error::Internal(format!("admin server failed: {}", e)))
}
