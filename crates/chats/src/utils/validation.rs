//! Validation utilities.

use crate::types::{ChatError, ChatResult};

/// Validation utilities
pub struct Validator;

impl Validator {
    /// Validate a conversation id received from the caller
    pub fn conversation_id(id: &str) -> ChatResult<()> {
        if id.trim().is_empty() {
            return Err(ChatError::validation("Conversation id cannot be empty"));
        }

        if id.len() > 255 {
            return Err(ChatError::validation(
                "Conversation id too long (max 255 characters)",
            ));
        }

        // Ids become part of channel names.
        if id.contains(':') || id.chars().any(char::is_whitespace) {
            return Err(ChatError::validation(
                "Conversation id cannot contain ':' or whitespace",
            ));
        }

        Ok(())
    }

    /// Validate message content
    pub fn message_content(content: &str, has_attachments: bool) -> ChatResult<()> {
        if content.trim().is_empty() && !has_attachments {
            return Err(ChatError::validation("Message content cannot be empty"));
        }

        if content.len() > 100_000 {
            return Err(ChatError::validation(
                "Message content too long (max 100,000 characters)",
            ));
        }

        Ok(())
    }
}
