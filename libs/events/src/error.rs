//! Error types for notification decoding.

use thiserror::Error;

/// Errors that can occur when decoding notifications.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The notification type is unknown.
    #[error("unknown notification type: {0}")]
    UnknownEventType(String),

    /// The notification object is missing a required field.
    #[error("notification object missing {0}")]
    MissingField(&'static str),

    /// The notification payload is invalid.
    #[error("invalid notification payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
