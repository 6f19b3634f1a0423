use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A conversation as known to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    /// Unread messages for the current user, derived on read
    #[serde(default)]
    pub unread_count: usize,
    #[serde(rename = "type", default)]
    pub kind: ConversationKind,
}

/// Channel the customer reached the team through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    #[default]
    Direct,
    Group,
    Widget,
}

impl From<&str> for ConversationKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "group" => ConversationKind::Group,
            "widget" => ConversationKind::Widget,
            _ => ConversationKind::Direct,
        }
    }
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            last_message_timestamp: None,
            unread_count: 0,
            kind: ConversationKind::Direct,
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_unread(mut self, unread_count: usize) -> Self {
        self.unread_count = unread_count;
        self
    }

    /// Move the last activity forward, never backwards
    pub fn touch(&mut self, timestamp: DateTime<Utc>) {
        if self.last_message_timestamp.map_or(true, |last| timestamp > last) {
            self.last_message_timestamp = Some(timestamp);
        }
    }
}

/// How far back the log of a conversation has been loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationCursor {
    pub has_more: bool,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub oldest_loaded_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

impl Default for PaginationCursor {
    // Nothing loaded yet, so there may be history to fetch.
    fn default() -> Self {
        Self {
            has_more: true,
            oldest_loaded_timestamp: None,
            total_count: None,
        }
    }
}

impl PaginationCursor {
    /// Upper bound for the next older page.
    ///
    /// History pages are bounded by `timestamp < before`. Asking from one
    /// millisecond past the oldest loaded message fetches the rest of that
    /// millisecond again, so messages sharing it with the page edge are not
    /// skipped. Merging drops the ones already loaded.
    pub fn next_page_before(&self) -> Option<DateTime<Utc>> {
        self.oldest_loaded_timestamp
            .map(|oldest| oldest + Duration::milliseconds(1))
    }
}

/// Lifecycle of a conversation inside the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Opening,
    Active,
    /// Closed by the user while the subscription stays warm
    Backgrounded,
    Closing,
    Closed,
}

impl SessionPhase {
    /// Whether live events are being received for the conversation
    pub fn is_subscribed(&self) -> bool {
        matches!(
            self,
            SessionPhase::Opening | SessionPhase::Active | SessionPhase::Backgrounded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Opening => "opening",
            SessionPhase::Active => "active",
            SessionPhase::Backgrounded => "backgrounded",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_touch_only_moves_forward() {
        let mut conversation = Conversation::new("c1");
        let later = Utc.timestamp_millis_opt(2_000).unwrap();
        let earlier = Utc.timestamp_millis_opt(1_000).unwrap();

        conversation.touch(later);
        conversation.touch(earlier);
        assert_eq!(conversation.last_message_timestamp, Some(later));
    }

    #[test]
    fn test_conversation_wire_shape() {
        let conversation: Conversation = serde_json::from_value(serde_json::json!({
            "id": "c7",
            "title": "Billing question",
            "lastMessageTimestamp": 1_700_000_000_000i64,
            "unreadCount": 3,
            "type": "widget"
        }))
        .unwrap();
        assert_eq!(conversation.kind, ConversationKind::Widget);
        assert_eq!(conversation.unread_count, 3);
        assert!(conversation.last_message_timestamp.is_some());
    }

    #[test]
    fn test_fresh_cursor_expects_history() {
        let cursor = PaginationCursor::default();
        assert!(cursor.has_more);
        assert!(cursor.oldest_loaded_timestamp.is_none());
        assert!(cursor.next_page_before().is_none());
    }

    #[test]
    fn test_next_page_includes_the_oldest_millisecond() {
        let oldest = chrono::TimeZone::timestamp_millis_opt(&Utc, 5_000).unwrap();
        let cursor = PaginationCursor {
            has_more: true,
            oldest_loaded_timestamp: Some(oldest),
            total_count: None,
        };
        assert_eq!(cursor.next_page_before().unwrap().timestamp_millis(), 5_001);
    }

    #[test]
    fn test_phase_subscription() {
        assert!(SessionPhase::Backgrounded.is_subscribed());
        assert!(!SessionPhase::Closed.is_subscribed());
        assert_eq!(SessionPhase::Opening.to_string(), "opening");
    }
}
