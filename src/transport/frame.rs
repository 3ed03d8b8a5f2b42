//! Frame handling for bridged JSON-RPC traffic.
//!
//! The bridge is schema-agnostic: a frame is one opaque JSON-RPC 2.0 object
//! moved verbatim between a client and a server. This module only knows how
//! to carry frames and how to encode them for the newline-delimited stdio
//! wire; it never inspects method names or routes on ids.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One opaque JSON-RPC frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(Value);

impl Frame {
    /// Wraps a JSON value as a frame. The value must be an object; the wire
    /// formats carry JSON-RPC objects only.
    pub fn new(value: Value) -> Result<Self> {
        if value.is_object() {
            Ok(Self(value))
        } else {
            Err(Error::Transport(format!(
                "frame must be a JSON object, got: {}",
                value
            )))
        }
    }

    /// Parses a frame from raw bytes (an HTTP body or an SSE data payload).
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("invalid frame JSON: {}", e)))?;
        Self::new(value)
    }

    /// Parses a frame from one line of newline-delimited JSON.
    pub fn from_line(line: &str) -> Result<Self> {
        Self::from_slice(line.as_bytes())
    }

    /// Encodes the frame as one newline-terminated JSON line for stdio.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(&self.0)
            .map_err(|e| Error::Serialization(format!("failed to serialize frame: {}", e)))?;
        line.push('\n');
        Ok(line)
    }

    /// Borrows the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the frame, yielding the underlying JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
