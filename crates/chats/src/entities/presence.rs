use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Presence of one participant on a conversation's presence channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub participant_id: String,
    pub display_name: String,
    pub status: PresenceStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_active: DateTime<Utc>,
    /// Stale after this instant unless a newer snapshot refreshes it
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Offline,
    Away,
}

impl From<&str> for PresenceStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "offline" => PresenceStatus::Offline,
            "away" => PresenceStatus::Away,
            _ => PresenceStatus::Online,
        }
    }
}

/// Self-expiring "is typing" marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub participant_id: String,
    pub conversation_id: String,
    pub is_typing: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// The entry as it should be read at `now`
    pub fn observed_at(&self, now: DateTime<Utc>) -> PresenceEntry {
        let mut entry = self.clone();
        if entry.is_stale_at(now) {
            entry.status = PresenceStatus::Offline;
        }
        entry
    }
}

impl TypingIndicator {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.is_typing && now < self.expires_at
    }
}
