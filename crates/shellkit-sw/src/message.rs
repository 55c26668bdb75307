//! Page → worker messages.

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerError;

/// Command sent by a page to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Activate the waiting version now instead of after every page closes.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl ClientMessage {
    /// Parse a raw JSON payload.
    pub fn from_json(raw: &str) -> Result<Self, ServiceWorkerError> {
        serde_json::from_str(raw).map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::SkipWaiting => r#"{"type":"SKIP_WAITING"}"#.to_string(),
        }
    }
}
