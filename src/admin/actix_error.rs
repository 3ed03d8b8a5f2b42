//! Actix Web error adapters for bridge errors.
//!
//! Translates domain error kinds to HTTP statuses and the
//! `{error:{code,message}}` envelope the admin API speaks.

use crate::error::Error;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

/// Builds the wire error envelope.
pub fn envelope(code: &str, message: &str) -> serde_json::Value {
    json!({
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn category(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_)
        | Error::ConfigParse(_)
        | Error::ConfigInvalid(_)
        | Error::UnsupportedTransport(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) | Error::InvalidState { .. } => StatusCode::CONFLICT,
        // Wrapping kinds take the category of what actually went wrong.
        Error::ServerStartFailed { source, .. }
        | Error::ServerStopFailed { source, .. }
        | Error::ConnectionFailed { source, .. } => category(source),
        Error::Io(_)
        | Error::Process(_)
        | Error::Transport(_)
        | Error::Timeout(_)
        | Error::Serialization(_)
        | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        category(self)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("application/json")
            .json(envelope(self.code(), &self.to_string()))
    }
}
