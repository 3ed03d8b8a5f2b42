//! Request and response shapes specific to the admin surface.

use crate::server::ServerStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Response to a create operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

/// Response to an environment update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvUpdateResponse {
    /// The server's environment after the merge.
    pub env: HashMap<String, String>,
    pub status: ServerStatus,
    pub restarted: bool,
    pub reconnected: Vec<String>,
    pub failed: Vec<serde_json::Value>,
}

/// Query pairing an inbound SSE POST with its connection.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}
