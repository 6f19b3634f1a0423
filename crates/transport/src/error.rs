//! Error types for the realtime transport.

use thiserror::Error;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised at the transport boundary
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },

    #[error("Request {request_id} timed out")]
    RequestTimeout { request_id: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Create a connection error
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection { reason: reason.into() }
    }

    /// Create a publish error for a channel
    pub fn publish(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publish {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Whether the error means the link itself is unusable
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::InvalidCredentials | Self::NotConnected | Self::Closed
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            message: format!("JSON serialization error: {}", err),
        }
    }
}
