//! Ephemeral presence and typing state.
//!
//! Presence arrives as full snapshots per channel and replaces whatever was
//! tracked before. Typing arrives as individual signals that expire on
//! their own. The two are kept apart on purpose: folding snapshots into
//! deltas would lose removals.
//!
//! Every read takes `now` into account, so expired state never leaks out
//! even when no sweep has run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use supportdesk_config::PresenceConfig;
use supportdesk_transport::PresenceMember;
use tracing::{debug, warn};

use crate::entities::{PresenceEntry, PresenceStatus, TypingIndicator};
use crate::types::PresenceData;
use crate::utils::span;

#[derive(Default)]
struct TrackerState {
    presence: HashMap<String, Vec<PresenceEntry>>,
    typing: HashMap<String, HashMap<String, TypingIndicator>>,
}

/// Result of a sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Conversations whose typing set lost an entry
    pub typing_changed: Vec<String>,
    /// Presence channels with entries that went stale since the last sweep
    pub presence_changed: Vec<String>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    state: Arc<Mutex<TrackerState>>,
    presence_ttl: Duration,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(presence_ttl: Duration, typing_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            presence_ttl,
            typing_timeout,
        }
    }

    pub fn from_config(config: &PresenceConfig) -> Self {
        Self::new(config.presence_ttl(), config.typing_timeout())
    }

    pub fn typing_timeout(&self) -> Duration {
        self.typing_timeout
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the tracked set for `channel` wholesale
    pub fn on_presence_update(&self, channel: &str, entries: Vec<PresenceEntry>) {
        debug!(%channel, members = entries.len(), "presence snapshot applied");
        self.lock().presence.insert(channel.to_string(), entries);
    }

    /// Apply a raw snapshot from the transport
    pub fn on_presence_members(&self, channel: &str, members: &[PresenceMember]) {
        self.on_presence_members_at(channel, members, Utc::now());
    }

    pub fn on_presence_members_at(
        &self,
        channel: &str,
        members: &[PresenceMember],
        now: DateTime<Utc>,
    ) {
        let expires_at = now + span(self.presence_ttl);
        let entries = members
            .iter()
            .map(|member| {
                let data = if member.data.is_null() {
                    PresenceData::default()
                } else {
                    serde_json::from_value::<PresenceData>(member.data.clone()).unwrap_or_else(
                        |error| {
                            warn!(%channel, client_id = %member.client_id, %error, "unreadable presence data");
                            PresenceData::default()
                        },
                    )
                };
                let last_active = data
                    .last_active
                    .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                    .unwrap_or(now);
                PresenceEntry {
                    participant_id: member.client_id.clone(),
                    display_name: data.name.unwrap_or_else(|| member.client_id.clone()),
                    status: data.status,
                    last_active,
                    expires_at,
                }
            })
            .collect();
        self.on_presence_update(channel, entries);
    }

    /// Presence for `channel`, with stale entries reported offline
    pub fn presence(&self, channel: &str) -> Vec<PresenceEntry> {
        self.presence_at(channel, Utc::now())
    }

    pub fn presence_at(&self, channel: &str, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        self.lock()
            .presence
            .get(channel)
            .map(|entries| entries.iter().map(|entry| entry.observed_at(now)).collect())
            .unwrap_or_default()
    }

    pub fn online_participants(&self, channel: &str) -> Vec<String> {
        self.online_participants_at(channel, Utc::now())
    }

    pub fn online_participants_at(&self, channel: &str, now: DateTime<Utc>) -> Vec<String> {
        self.presence_at(channel, now)
            .into_iter()
            .filter(|entry| entry.status == PresenceStatus::Online)
            .map(|entry| entry.participant_id)
            .collect()
    }

    /// Set or refresh a typing entry. Returns true when the participant was
    /// not already shown as typing.
    pub fn signal_typing(&self, conversation_id: &str, participant_id: &str) -> bool {
        self.signal_typing_at(conversation_id, participant_id, Utc::now())
    }

    pub fn signal_typing_at(
        &self,
        conversation_id: &str,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let expires_at = now + span(self.typing_timeout);
        let mut state = self.lock();
        let typing = state.typing.entry(conversation_id.to_string()).or_default();
        let was_active = typing
            .get(participant_id)
            .map_or(false, |indicator| indicator.is_active_at(now));
        typing.insert(
            participant_id.to_string(),
            TypingIndicator {
                participant_id: participant_id.to_string(),
                conversation_id: conversation_id.to_string(),
                is_typing: true,
                expires_at,
            },
        );
        !was_active
    }

    /// Clear a typing entry. Returns true when one was active.
    pub fn stop_typing(&self, conversation_id: &str, participant_id: &str) -> bool {
        self.stop_typing_at(conversation_id, participant_id, Utc::now())
    }

    pub fn stop_typing_at(
        &self,
        conversation_id: &str,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.lock()
            .typing
            .get_mut(conversation_id)
            .and_then(|typing| typing.remove(participant_id))
            .map_or(false, |indicator| indicator.is_active_at(now))
    }

    /// Participants currently typing, expired entries excluded and purged
    pub fn typing_participants(&self, conversation_id: &str) -> Vec<String> {
        self.typing_participants_at(conversation_id, Utc::now())
    }

    pub fn typing_participants_at(&self, conversation_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.lock();
        let Some(typing) = state.typing.get_mut(conversation_id) else {
            return Vec::new();
        };
        typing.retain(|_, indicator| indicator.is_active_at(now));
        let mut participants: Vec<String> = typing.keys().cloned().collect();
        participants.sort();
        participants
    }

    /// When the next typing entry of a conversation lapses
    pub fn next_typing_expiry(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .typing
            .get(conversation_id)
            .and_then(|typing| typing.values().map(|indicator| indicator.expires_at).min())
    }

    /// Purge expired typing entries and report stale presence
    pub fn sweep_at(&self, now: DateTime<Utc>, since: DateTime<Utc>) -> SweepReport {
        let mut state = self.lock();
        let mut report = SweepReport::default();

        for (conversation_id, typing) in state.typing.iter_mut() {
            let before = typing.len();
            typing.retain(|_, indicator| indicator.is_active_at(now));
            if typing.len() != before {
                report.typing_changed.push(conversation_id.clone());
            }
        }
        state.typing.retain(|_, typing| !typing.is_empty());

        for (channel, entries) in &state.presence {
            let lapsed = entries
                .iter()
                .any(|entry| entry.expires_at > since && entry.expires_at <= now);
            if lapsed {
                report.presence_changed.push(channel.clone());
            }
        }

        report.typing_changed.sort();
        report.presence_changed.sort();
        report
    }

    /// Drop all state tied to a conversation
    pub fn forget(&self, conversation_id: &str, presence_channel: &str) {
        let mut state = self.lock();
        state.typing.remove(conversation_id);
        state.presence.remove(presence_channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Duration::from_secs(30), Duration::from_secs(2))
    }

    #[test]
    fn test_typing_expires_without_stop_signal() {
        let tracker = tracker();
        assert!(tracker.signal_typing_at("c1", "u1", at(0)));

        assert_eq!(tracker.typing_participants_at("c1", at(1_999)), vec!["u1"]);
        assert!(tracker.typing_participants_at("c1", at(2_001)).is_empty());
    }

    #[test]
    fn test_repeated_signals_extend_without_duplicates() {
        let tracker = tracker();
        tracker.signal_typing_at("c1", "u1", at(0));
        assert!(!tracker.signal_typing_at("c1", "u1", at(1_500)));

        assert_eq!(tracker.typing_participants_at("c1", at(3_000)), vec!["u1"]);
        assert!(tracker.typing_participants_at("c1", at(3_501)).is_empty());
    }

    #[test]
    fn test_stop_typing_clears_immediately() {
        let tracker = tracker();
        tracker.signal_typing_at("c1", "u1", at(0));
        tracker.signal_typing_at("c1", "u2", at(0));

        assert!(tracker.stop_typing_at("c1", "u1", at(10)));
        assert!(!tracker.stop_typing_at("c1", "u1", at(20)));
        assert_eq!(tracker.typing_participants_at("c1", at(30)), vec!["u2"]);
    }

    #[test]
    fn test_snapshot_replaces_previous_members() {
        let tracker = tracker();
        let channel = "acme:presence:c1";
        tracker.on_presence_members_at(
            channel,
            &[
                PresenceMember {
                    client_id: "agent-1".to_string(),
                    data: json!({"name": "Ana", "status": "online"}),
                },
                PresenceMember {
                    client_id: "agent-2".to_string(),
                    data: json!({"name": "Bo", "status": "away"}),
                },
            ],
            at(0),
        );
        assert_eq!(tracker.online_participants_at(channel, at(1)), vec!["agent-1"]);

        tracker.on_presence_members_at(
            channel,
            &[PresenceMember {
                client_id: "agent-2".to_string(),
                data: json!({"name": "Bo"}),
            }],
            at(5),
        );
        let entries = tracker.presence_at(channel, at(6));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name, "Bo");
        assert_eq!(entries[0].status, PresenceStatus::Online);
    }

    #[test]
    fn test_stale_presence_reads_offline() {
        let tracker = tracker();
        let channel = "acme:presence:c1";
        tracker.on_presence_members_at(
            channel,
            &[PresenceMember {
                client_id: "agent-1".to_string(),
                data: json!({"lastActive": 0}),
            }],
            at(0),
        );

        assert_eq!(tracker.presence_at(channel, at(29_999))[0].status, PresenceStatus::Online);
        assert_eq!(tracker.presence_at(channel, at(30_000))[0].status, PresenceStatus::Offline);
        assert!(tracker.online_participants_at(channel, at(30_000)).is_empty());
    }

    #[test]
    fn test_unreadable_presence_data_falls_back_to_defaults() {
        let tracker = tracker();
        tracker.on_presence_members_at(
            "p",
            &[PresenceMember {
                client_id: "agent-9".to_string(),
                data: json!({"status": 42}),
            }],
            at(0),
        );
        let entries = tracker.presence_at("p", at(1));
        assert_eq!(entries[0].display_name, "agent-9");
    }

    #[test]
    fn test_sweep_reports_changes() {
        let tracker = tracker();
        tracker.signal_typing_at("c1", "u1", at(0));
        tracker.signal_typing_at("c2", "u2", at(5_000));
        tracker.on_presence_members_at(
            "acme:presence:c1",
            &[PresenceMember {
                client_id: "agent-1".to_string(),
                data: json!(null),
            }],
            at(0),
        );

        let report = tracker.sweep_at(at(3_000), at(0));
        assert_eq!(report.typing_changed, vec!["c1"]);
        assert!(report.presence_changed.is_empty());
        assert_eq!(tracker.next_typing_expiry("c2"), Some(at(7_000)));

        let report = tracker.sweep_at(at(31_000), at(3_000));
        assert_eq!(report.typing_changed, vec!["c2"]);
        assert_eq!(report.presence_changed, vec!["acme:presence:c1"]);
    }
}
