//! Error types for the conversation core.

use supportdesk_transport::TransportError;
use thiserror::Error;

/// Result type alias for chat operations
pub type ChatResult<T> = Result<T, ChatError>;

/// Main error type for the conversation core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    #[error("Publish failed: {reason}")]
    Publish { reason: String },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Pagination error: {reason}")]
    Pagination { reason: String },

    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ChatError {
    /// Create a connection error
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection { reason: reason.into() }
    }

    /// Create a publish error
    pub fn publish(reason: impl Into<String>) -> Self {
        Self::Publish { reason: reason.into() }
    }

    /// Create a malformed message error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage { reason: reason.into() }
    }

    /// Create a pagination error
    pub fn pagination(reason: impl Into<String>) -> Self {
        Self::Pagination { reason: reason.into() }
    }

    /// Create a not found error for conversations
    pub fn conversation_not_found(id: impl Into<String>) -> Self {
        Self::ConversationNotFound { id: id.into() }
    }

    /// Create a not found error for messages
    pub fn message_not_found(id: impl Into<String>) -> Self {
        Self::MessageNotFound { id: id.into() }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Publish { .. } => Self::Publish {
                reason: err.to_string(),
            },
            other => Self::Connection {
                reason: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedMessage {
            reason: err.to_string(),
        }
    }
}
