use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

pub mod failure;
pub mod headers;
pub mod topology;

pub use failure::{
    FailedMessageRecord, FailureStage, FailureStatistics, FailureStatus, FailureType,
    NewFailure, TransitionError, DEFAULT_MAX_RETRY_COUNT,
};
pub use headers::{DeathReason, DeathRecord, FieldValue, Headers};
pub use topology::{Route, Topology};

// ============================================================================
// Core Message Types
// ============================================================================

/// The message that flows from callers through the broker to consumers.
///
/// Serialized as `{"id", "content", "timestamp"}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a generated identifier.
    pub fn new(content: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), content)
    }

    pub fn with_id(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One send attempt made by the publisher. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub message_id: String,
    /// 0-based attempt number
    pub attempt: u32,
    /// Backoff waited before this attempt
    pub backoff: std::time::Duration,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("State transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let message = Message::with_id("m1", "hello");
        let json: serde_json::Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();

        assert_eq!(json["id"], "m1");
        assert_eq!(json["content"], "hello");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_message_generates_unique_ids() {
        let a = Message::new("a");
        let b = Message::new("a");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = Message::from_json(b"not json").unwrap_err();
        assert!(matches!(err, RelayError::Serialization(_)));
    }
}
