//! Shared types for the conversation core.

pub mod errors;
pub mod events;

pub use errors::{ChatError, ChatResult};
pub use events::*;

pub type ConversationId = String;
pub type MessageId = String;
pub type ParticipantId = String;

/// Channel carrying message, receipt and typing events of a conversation
pub fn conversation_channel(workspace_id: &str, conversation_id: &str) -> String {
    format!("{workspace_id}:conversation:{conversation_id}")
}

/// Channel carrying presence snapshots of a conversation
pub fn presence_channel(workspace_id: &str, conversation_id: &str) -> String {
    format!("{workspace_id}:presence:{conversation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_namespaced_by_workspace() {
        assert_eq!(conversation_channel("acme", "c1"), "acme:conversation:c1");
        assert_eq!(presence_channel("acme", "c1"), "acme:presence:c1");
    }
}
