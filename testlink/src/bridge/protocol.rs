//! JSON payload types carried inside frames.
//!
//! - **INFO**: `EngineInfo`, exchanged once by each side during the handshake
//! - **MESSAGE**: opaque JSON, surfaced to the runner's sink as `ExecutionMessage`

use serde::{Deserialize, Serialize};

use super::wire::PROTOCOL_CAPABILITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineRole {
    Runner,
    Execution,
}

/// Handshake announcement.
///
/// Only `capability` is required on the wire. Fields this side does not know
/// about are kept in `extra` so they can be inspected after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<EngineRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub capability: u32,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EngineInfo {
    pub fn new(role: EngineRole, id: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            id: Some(id.into()),
            capability: PROTOCOL_CAPABILITY,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_capability(mut self, capability: u32) -> Self {
        self.capability = capability;
        self
    }
}

/// A decoded MESSAGE frame, handed to the runner's message sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub operation_id: String,
    pub message: serde_json::Value,
}

impl ExecutionMessage {
    /// The message's `type` field, when it is an object that has one.
    pub fn message_type(&self) -> Option<&str> {
        self.message.get("type").and_then(serde_json::Value::as_str)
    }
}
