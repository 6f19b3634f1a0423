//! Unread accounting derived from the message store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::repositories::MessageStore;
use crate::types::ChatResult;

/// Per-conversation and global unread counts for the current user.
///
/// Loaded conversations are always counted from the store. Conversations
/// without a loaded page report the last count the backend gave for them.
#[derive(Clone)]
pub struct UnreadAggregator {
    store: MessageStore,
    current_user_id: String,
    last_known: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl UnreadAggregator {
    pub fn new(store: MessageStore, current_user_id: impl Into<String>) -> Self {
        Self {
            store,
            current_user_id: current_user_id.into(),
            last_known: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn known(&self) -> MutexGuard<'_, BTreeMap<String, usize>> {
        self.last_known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember a conversation and the backend's unread count for it
    pub fn track(&self, conversation_id: &str, server_count: Option<usize>) {
        let mut known = self.known();
        let entry = known.entry(conversation_id.to_string()).or_insert(0);
        if let Some(count) = server_count {
            *entry = count;
        }
    }

    pub fn forget(&self, conversation_id: &str) {
        self.known().remove(conversation_id);
    }

    pub fn unread_count(&self, conversation_id: &str) -> usize {
        let user = self.current_user_id.as_str();
        self.store
            .count_where(conversation_id, |message| {
                message.sender.id != user && !message.is_read_by(user)
            })
            .unwrap_or_else(|| self.known().get(conversation_id).copied().unwrap_or(0))
    }

    /// Sum over every conversation the client knows about
    pub fn total_unread(&self) -> usize {
        let conversations: Vec<String> = self.known().keys().cloned().collect();
        conversations
            .iter()
            .map(|conversation_id| self.unread_count(conversation_id))
            .sum()
    }

    /// Mark everything up to the newest loaded message as read.
    ///
    /// Returns the id the read mark was placed on, if anything was loaded.
    pub fn mark_conversation_as_read(&self, conversation_id: &str) -> ChatResult<Option<String>> {
        self.known().insert(conversation_id.to_string(), 0);
        let Some(latest) = self.store.latest_message_id(conversation_id) else {
            return Ok(None);
        };
        let marked = self
            .store
            .mark_read(conversation_id, &latest, &self.current_user_id)?;
        debug!(conversation_id, %latest, marked, "conversation marked as read");
        Ok(Some(latest))
    }

    pub fn current_user_id(&self) -> &str {
        &self.current_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Message, MessageDraft, MessageStatus, Sender, SenderKind};
    use crate::repositories::HistoryBatch;
    use chrono::{TimeZone, Utc};

    fn incoming(id: &str, millis: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            content: "need help".to_string(),
            sender: Sender::new("user-7", SenderKind::User),
            timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
            status: MessageStatus::Sent,
            attachments: Vec::new(),
            read_by: Vec::new(),
            local_echo: false,
            client_generated_id: None,
            failure_reason: None,
        }
    }

    fn loaded_store(messages: Vec<Message>) -> MessageStore {
        let store = MessageStore::default();
        store.merge_page(
            "c1",
            HistoryBatch {
                messages,
                has_more: false,
                total_count: None,
            },
        );
        store
    }

    #[test]
    fn test_counts_messages_from_others_not_yet_read() {
        let store = loaded_store(vec![incoming("m1", 1), incoming("m2", 2)]);
        store.append_optimistic(
            "c1",
            MessageDraft::new("on it", Sender::new("agent-1", SenderKind::Agent)),
        );
        let unread = UnreadAggregator::new(store, "agent-1");
        unread.track("c1", None);

        assert_eq!(unread.unread_count("c1"), 2);
        assert_eq!(unread.total_unread(), 2);
    }

    #[test]
    fn test_unloaded_conversations_keep_server_count() {
        let unread = UnreadAggregator::new(MessageStore::default(), "agent-1");
        unread.track("c9", Some(4));
        unread.track("c9", None);

        assert_eq!(unread.unread_count("c9"), 4);
        assert_eq!(unread.total_unread(), 4);
    }

    #[test]
    fn test_mark_conversation_as_read_resets_count() {
        let store = loaded_store(vec![incoming("m1", 1), incoming("m2", 2)]);
        let unread = UnreadAggregator::new(store.clone(), "agent-1");
        unread.track("c1", Some(7));

        assert_eq!(
            unread.mark_conversation_as_read("c1").unwrap().as_deref(),
            Some("m2")
        );
        assert_eq!(unread.unread_count("c1"), 0);
        assert!(store.messages("c1").iter().all(|m| m.is_read_by("agent-1")));

        store.reconcile("c1", incoming("m3", 3)).unwrap();
        assert_eq!(unread.unread_count("c1"), 1);
    }
}
