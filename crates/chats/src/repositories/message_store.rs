//! Canonical per-conversation message log.
//!
//! Entries are kept sorted by `(timestamp, seq)`. Live inserts take an
//! increasing sequence number and backfilled pages take a block of numbers
//! below everything already loaded, so ties on timestamp keep arrival order
//! and older pages land in front without moving what is already shown.
//!
//! Every operation is synchronous: callers can read their own writes
//! immediately.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::entities::{Message, MessageDraft, MessageStatus, PaginationCursor, LOCAL_ID_PREFIX};
use crate::repositories::history::{HistoryBatch, HistoryProvider};
use crate::types::{ChatError, ChatResult};

/// What `reconcile` did with a server message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted,
    ReplacedOptimistic,
    Duplicate,
}

/// Outcome of loading an older page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedPage {
    /// Messages that were not already in the log
    pub added: usize,
    pub has_more: bool,
}

struct Entry {
    message: Message,
    seq: i64,
}

impl Entry {
    fn key(&self) -> (i64, i64) {
        (self.message.timestamp.timestamp_millis(), self.seq)
    }
}

enum EchoMatch {
    Pending { index: usize, heuristic: bool },
    AlreadyConfirmed(String),
    Unmatched,
}

#[derive(Default)]
struct ConversationLog {
    entries: Vec<Entry>,
    ids: HashSet<String>,
    /// clientGeneratedId -> id of the entry currently holding it
    by_client_id: HashMap<String, String>,
    /// server id from a publish ack -> local id still waiting for its echo
    acked: HashMap<String, String>,
    cursor: PaginationCursor,
    next_seq: i64,
    front_seq: i64,
    loaded: bool,
}

impl ConversationLog {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.message.id == id)
    }

    fn take_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|entry| entry.message.timestamp)
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let key = entry.key();
        let at = self.entries.partition_point(|existing| existing.key() <= key);
        self.ids.insert(entry.message.id.clone());
        if let Some(client_id) = &entry.message.client_generated_id {
            self.by_client_id
                .insert(client_id.clone(), entry.message.id.clone());
        }
        self.entries.insert(at, entry);
    }

    fn remove_at(&mut self, index: usize) -> Message {
        let entry = self.entries.remove(index);
        let id = &entry.message.id;
        self.ids.remove(id);
        self.acked.retain(|_, local| local.as_str() != id.as_str());
        if let Some(client_id) = &entry.message.client_generated_id {
            if self.by_client_id.get(client_id) == Some(id) {
                self.by_client_id.remove(client_id);
            }
        }
        entry.message
    }

    fn find_optimistic(&self, message: &Message, window_ms: i64) -> EchoMatch {
        if let Some(index) = self
            .acked
            .get(&message.id)
            .and_then(|local| self.position(local))
        {
            return EchoMatch::Pending {
                index,
                heuristic: false,
            };
        }

        if let Some(client_id) = &message.client_generated_id {
            let Some(current) = self.by_client_id.get(client_id) else {
                return EchoMatch::Unmatched;
            };
            return match self.position(current) {
                Some(index) if self.entries[index].message.local_echo => EchoMatch::Pending {
                    index,
                    heuristic: false,
                },
                Some(_) => EchoMatch::AlreadyConfirmed(current.clone()),
                None => EchoMatch::Unmatched,
            };
        }

        // Last resort for echoes that lost their client id. Entries already
        // bound to another server id by their ack are not candidates.
        self.entries
            .iter()
            .position(|entry| {
                let local = &entry.message;
                local.local_echo
                    && !self.acked.values().any(|pending| *pending == local.id)
                    && local.sender.id == message.sender.id
                    && local.content == message.content
                    && (local.timestamp - message.timestamp).num_milliseconds().abs() <= window_ms
            })
            .map_or(EchoMatch::Unmatched, |index| EchoMatch::Pending {
                index,
                heuristic: true,
            })
    }

    /// Swap the optimistic entry at `index` for its canonical form.
    /// Stays in place unless the canonical timestamp would break ordering.
    fn replace_local(&mut self, index: usize, mut canonical: Message) -> String {
        let (local_id, seq, client_id, readers) = {
            let previous = &self.entries[index];
            (
                previous.message.id.clone(),
                previous.seq,
                previous.message.client_generated_id.clone(),
                previous.message.read_by.clone(),
            )
        };

        canonical.local_echo = false;
        canonical.failure_reason = None;
        if canonical.status.is_pending() || canonical.status == MessageStatus::Failed {
            canonical.status = MessageStatus::Sent;
        }
        if canonical.client_generated_id.is_none() {
            canonical.client_generated_id = client_id;
        }
        for reader in readers {
            canonical.add_reader(&reader);
        }

        self.ids.remove(&local_id);
        self.acked.retain(|_, pending| *pending != local_id);

        let key = (canonical.timestamp.timestamp_millis(), seq);
        let fits = (index == 0 || self.entries[index - 1].key() <= key)
            && (index + 1 >= self.entries.len() || key <= self.entries[index + 1].key());
        if fits {
            self.ids.insert(canonical.id.clone());
            if let Some(client_id) = &canonical.client_generated_id {
                self.by_client_id
                    .insert(client_id.clone(), canonical.id.clone());
            }
            self.entries[index] = Entry {
                message: canonical,
                seq,
            };
        } else {
            self.entries.remove(index);
            let seq = self.take_seq();
            self.insert_sorted(Entry {
                message: canonical,
                seq,
            });
        }
        local_id
    }
}

#[derive(Default)]
struct StoreState {
    logs: HashMap<String, ConversationLog>,
    /// local id -> conversation, for optimistic entries only
    locations: HashMap<String, String>,
}

/// Single source of truth for message state
#[derive(Clone)]
pub struct MessageStore {
    state: Arc<Mutex<StoreState>>,
    echo_window_ms: i64,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl MessageStore {
    /// `echo_match_window` bounds the heuristic match of echoes without a client id
    pub fn new(echo_match_window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            echo_window_ms: i64::try_from(echo_match_window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a queued local echo at the end of the log and return its id
    pub fn append_optimistic(&self, conversation_id: &str, draft: MessageDraft) -> String {
        let local_id = format!("{LOCAL_ID_PREFIX}{}", cuid2::create_id());
        let mut guard = self.lock();
        let state = &mut *guard;
        let log = state.logs.entry(conversation_id.to_string()).or_default();

        let mut timestamp = draft.timestamp.unwrap_or_else(Utc::now);
        if let Some(newest) = log.newest_timestamp() {
            timestamp = timestamp.max(newest);
        }

        let message = Message {
            id: local_id.clone(),
            conversation_id: conversation_id.to_string(),
            content: draft.content,
            sender: draft.sender,
            timestamp,
            status: MessageStatus::Queued,
            attachments: draft.attachments,
            read_by: Vec::new(),
            local_echo: true,
            client_generated_id: Some(local_id.clone()),
            failure_reason: None,
        };
        let seq = log.take_seq();
        log.insert_sorted(Entry { message, seq });
        state
            .locations
            .insert(local_id.clone(), conversation_id.to_string());

        debug!(conversation_id, %local_id, "optimistic message appended");
        local_id
    }

    /// Apply a server-confirmed message. Idempotent per server id.
    pub fn reconcile(
        &self,
        conversation_id: &str,
        mut message: Message,
    ) -> ChatResult<ReconcileOutcome> {
        if message.id.trim().is_empty() {
            return Err(ChatError::malformed("server message without id"));
        }
        if message.conversation_id.is_empty() {
            message.conversation_id = conversation_id.to_string();
        } else if message.conversation_id != conversation_id {
            return Err(ChatError::malformed(format!(
                "message {} belongs to conversation {}",
                message.id, message.conversation_id
            )));
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        let log = state.logs.entry(conversation_id.to_string()).or_default();
        if log.ids.contains(&message.id) {
            return Ok(ReconcileOutcome::Duplicate);
        }

        match log.find_optimistic(&message, self.echo_window_ms) {
            EchoMatch::Pending { index, heuristic } => {
                let server_id = message.id.clone();
                let local_id = log.replace_local(index, message);
                state.locations.remove(&local_id);
                if heuristic {
                    debug!(conversation_id, %local_id, %server_id, "echo matched heuristically by sender, content and time");
                } else {
                    debug!(conversation_id, %local_id, %server_id, "optimistic message confirmed");
                }
                Ok(ReconcileOutcome::ReplacedOptimistic)
            }
            EchoMatch::AlreadyConfirmed(existing) => {
                warn!(
                    conversation_id,
                    server_id = %message.id,
                    %existing,
                    "second confirmation for the same client id ignored"
                );
                Ok(ReconcileOutcome::Duplicate)
            }
            EchoMatch::Unmatched => {
                message.local_echo = false;
                let seq = log.take_seq();
                log.insert_sorted(Entry { message, seq });
                Ok(ReconcileOutcome::Inserted)
            }
        }
    }

    /// Queued -> sending. Returns false when the entry was not queued.
    pub fn mark_sending(&self, local_id: &str) -> ChatResult<bool> {
        self.with_local(local_id, |message| {
            if message.status == MessageStatus::Queued {
                message.status = MessageStatus::Sending;
                true
            } else {
                false
            }
        })
    }

    /// Record the backend's acceptance of a publish.
    ///
    /// The entry stays a local echo until the echo itself arrives. Returns
    /// false when the echo already replaced it.
    pub fn mark_acknowledged(&self, local_id: &str, server_id: Option<&str>) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(conversation_id) = state.locations.get(local_id).cloned() else {
            return false;
        };
        let Some(log) = state.logs.get_mut(&conversation_id) else {
            return false;
        };
        let Some(index) = log.position(local_id) else {
            return false;
        };

        if let Some(server_id) = server_id {
            if let Some(canonical) = log.position(server_id) {
                // The echo arrived first and was not recognised as ours.
                let local = log.remove_at(index);
                let canonical = if canonical > index { canonical - 1 } else { canonical };
                for reader in &local.read_by {
                    log.entries[canonical].message.add_reader(reader);
                }
                state.locations.remove(local_id);
                debug!(%conversation_id, %local_id, %server_id, "dropped optimistic duplicate of confirmed message");
                return true;
            }
            log.acked.insert(server_id.to_string(), local_id.to_string());
        }

        // A late ack still proves delivery, even after the send timed out.
        let message = &mut log.entries[index].message;
        if message.status.is_pending() || message.status == MessageStatus::Failed {
            message.status = MessageStatus::Sent;
            message.failure_reason = None;
        }
        true
    }

    /// Queued/sending -> failed. The entry stays visible for retry or discard.
    pub fn mark_failed(&self, local_id: &str, reason: &str) -> ChatResult<bool> {
        self.with_local(local_id, |message| {
            if !message.status.is_pending() {
                return false;
            }
            message.status = MessageStatus::Failed;
            message.failure_reason = Some(reason.to_string());
            true
        })
    }

    /// Failed -> sending with the same client id, returning the entry to republish
    pub fn prepare_retry(&self, local_id: &str) -> ChatResult<Message> {
        self.with_local(local_id, |message| {
            if message.status != MessageStatus::Failed {
                return Err(ChatError::validation(format!(
                    "message {} is {} and cannot be retried",
                    message.id,
                    message.status.as_str()
                )));
            }
            message.status = MessageStatus::Sending;
            message.failure_reason = None;
            Ok(message.clone())
        })?
    }

    /// Remove a failed optimistic entry
    pub fn discard(&self, local_id: &str) -> ChatResult<Message> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let conversation_id = state
            .locations
            .get(local_id)
            .cloned()
            .ok_or_else(|| ChatError::message_not_found(local_id))?;
        let log = state
            .logs
            .get_mut(&conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(&conversation_id))?;
        let index = log
            .position(local_id)
            .ok_or_else(|| ChatError::message_not_found(local_id))?;
        if log.entries[index].message.status != MessageStatus::Failed {
            return Err(ChatError::validation("only failed messages can be discarded"));
        }

        let message = log.remove_at(index);
        state.locations.remove(local_id);
        Ok(message)
    }

    /// Fail every unacknowledged optimistic entry of a conversation
    pub fn fail_pending(&self, conversation_id: &str, reason: &str) -> Vec<String> {
        let mut guard = self.lock();
        let Some(log) = guard.logs.get_mut(conversation_id) else {
            return Vec::new();
        };
        log.entries
            .iter_mut()
            .map(|entry| &mut entry.message)
            .filter(|message| message.local_echo && message.status.is_pending())
            .map(|message| {
                message.status = MessageStatus::Failed;
                message.failure_reason = Some(reason.to_string());
                message.id.clone()
            })
            .collect()
    }

    /// Merge a backfill page in front of the loaded log
    pub fn merge_page(&self, conversation_id: &str, batch: HistoryBatch) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let log = state.logs.entry(conversation_id.to_string()).or_default();

        let oldest_in_page = batch.messages.iter().map(|message| message.timestamp).min();
        let mut fresh: Vec<Message> = Vec::with_capacity(batch.messages.len());
        let mut confirmed = 0;
        for mut message in batch.messages {
            if message.id.trim().is_empty() {
                warn!(conversation_id, "dropping history entry without id");
                continue;
            }
            if message.conversation_id.is_empty() {
                message.conversation_id = conversation_id.to_string();
            }
            if log.ids.contains(&message.id) || fresh.iter().any(|seen| seen.id == message.id) {
                continue;
            }
            match log.find_optimistic(&message, self.echo_window_ms) {
                EchoMatch::Pending {
                    index,
                    heuristic: false,
                } => {
                    let local_id = log.replace_local(index, message);
                    state.locations.remove(&local_id);
                    confirmed += 1;
                }
                EchoMatch::AlreadyConfirmed(_) => {}
                _ => {
                    message.local_echo = false;
                    fresh.push(message);
                }
            }
        }

        fresh.sort_by_key(|message| message.timestamp);
        let added = fresh.len();
        let mut seq = log.front_seq - added as i64;
        log.front_seq = seq;
        for message in fresh {
            log.insert_sorted(Entry { message, seq });
            seq += 1;
        }

        if let Some(oldest) = oldest_in_page {
            log.cursor.oldest_loaded_timestamp = Some(
                log.cursor
                    .oldest_loaded_timestamp
                    .map_or(oldest, |current| current.min(oldest)),
            );
        }
        log.cursor.has_more = batch.has_more;
        if batch.total_count.is_some() {
            log.cursor.total_count = batch.total_count;
        }
        log.loaded = true;

        debug!(conversation_id, added, confirmed, has_more = batch.has_more, "history page merged");
        added + confirmed
    }

    /// Fetch the page before `before` and merge it
    pub async fn load_older_page(
        &self,
        provider: &dyn HistoryProvider,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> ChatResult<LoadedPage> {
        let batch = provider.fetch_page(conversation_id, before, limit).await?;
        let has_more = batch.has_more;
        let added = self.merge_page(conversation_id, batch);
        Ok(LoadedPage { added, has_more })
    }

    /// Add `reader_id` to every message up to and including `upto_message_id`
    pub fn mark_read(
        &self,
        conversation_id: &str,
        upto_message_id: &str,
        reader_id: &str,
    ) -> ChatResult<usize> {
        let mut guard = self.lock();
        let log = guard
            .logs
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;
        let index = log
            .position(upto_message_id)
            .ok_or_else(|| ChatError::message_not_found(upto_message_id))?;

        Ok(log.entries[..=index]
            .iter_mut()
            .map(|entry| entry.message.add_reader(reader_id))
            .filter(|added| *added)
            .count())
    }

    /// Count the log from now on even though no page was merged
    pub fn mark_loaded(&self, conversation_id: &str) {
        let mut guard = self.lock();
        let log = guard.logs.entry(conversation_id.to_string()).or_default();
        if !log.loaded {
            log.loaded = true;
            debug!(conversation_id, "log counted without a history page");
        }
    }

    /// Drop everything cached for a conversation
    pub fn clear(&self, conversation_id: &str) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(log) = state.logs.remove(conversation_id) else {
            return 0;
        };
        state
            .locations
            .retain(|_, conversation| conversation != conversation_id);
        log.entries.len()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .logs
            .get(conversation_id)
            .map(|log| log.entries.iter().map(|entry| entry.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn message(&self, conversation_id: &str, id: &str) -> Option<Message> {
        let guard = self.lock();
        let log = guard.logs.get(conversation_id)?;
        log.position(id).map(|index| log.entries[index].message.clone())
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.lock()
            .logs
            .get(conversation_id)
            .map_or(0, |log| log.entries.len())
    }

    pub fn is_empty(&self, conversation_id: &str) -> bool {
        self.len(conversation_id) == 0
    }

    /// Conversation holding an optimistic entry
    pub fn conversation_of(&self, local_id: &str) -> Option<String> {
        self.lock().locations.get(local_id).cloned()
    }

    /// Newest server-confirmed message id
    pub fn latest_message_id(&self, conversation_id: &str) -> Option<String> {
        self.lock().logs.get(conversation_id).and_then(|log| {
            log.entries
                .iter()
                .rev()
                .find(|entry| !entry.message.local_echo)
                .map(|entry| entry.message.id.clone())
        })
    }

    pub fn cursor(&self, conversation_id: &str) -> Option<PaginationCursor> {
        self.lock()
            .logs
            .get(conversation_id)
            .map(|log| log.cursor.clone())
    }

    /// Whether a history page has been merged for the conversation
    pub fn is_loaded(&self, conversation_id: &str) -> bool {
        self.lock()
            .logs
            .get(conversation_id)
            .map_or(false, |log| log.loaded)
    }

    /// Server messages sharing the oldest loaded millisecond.
    ///
    /// An older page requested from `next_page_before` returns these again,
    /// so widening the page by this many keeps every page productive.
    pub fn loaded_at_oldest(&self, conversation_id: &str) -> usize {
        let guard = self.lock();
        let Some(log) = guard.logs.get(conversation_id) else {
            return 0;
        };
        let Some(oldest) = log.cursor.oldest_loaded_timestamp else {
            return 0;
        };
        log.entries
            .iter()
            .take_while(|entry| entry.message.timestamp <= oldest)
            .filter(|entry| !entry.message.local_echo && entry.message.timestamp == oldest)
            .count()
    }

    /// Count messages matching `predicate`, `None` until the log is loaded
    pub fn count_where(
        &self,
        conversation_id: &str,
        predicate: impl Fn(&Message) -> bool,
    ) -> Option<usize> {
        let guard = self.lock();
        let log = guard.logs.get(conversation_id).filter(|log| log.loaded)?;
        Some(
            log.entries
                .iter()
                .filter(|entry| predicate(&entry.message))
                .count(),
        )
    }

    fn with_local<R>(&self, local_id: &str, apply: impl FnOnce(&mut Message) -> R) -> ChatResult<R> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let conversation_id = state
            .locations
            .get(local_id)
            .ok_or_else(|| ChatError::message_not_found(local_id))?;
        let log = state
            .logs
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id.as_str()))?;
        let index = log
            .position(local_id)
            .ok_or_else(|| ChatError::message_not_found(local_id))?;
        Ok(apply(&mut log.entries[index].message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Sender, SenderKind};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn agent() -> Sender {
        Sender::new("agent-1", SenderKind::Agent)
    }

    fn customer() -> Sender {
        Sender::new("user-7", SenderKind::User)
    }

    fn server(id: &str, millis: i64, content: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            content: content.to_string(),
            sender: customer(),
            timestamp: at(millis),
            status: MessageStatus::Sent,
            attachments: Vec::new(),
            read_by: Vec::new(),
            local_echo: false,
            client_generated_id: None,
            failure_reason: None,
        }
    }

    fn page(messages: Vec<Message>, has_more: bool) -> HistoryBatch {
        HistoryBatch {
            messages,
            has_more,
            total_count: None,
        }
    }

    fn ids(store: &MessageStore) -> Vec<String> {
        store.messages("c1").into_iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_scenario_page_then_optimistic_then_echo() {
        let store = MessageStore::default();
        let history: Vec<Message> = (0..20)
            .map(|i| server(&format!("h{i}"), 1_000 + i * 10, "earlier"))
            .collect();
        store.merge_page("c1", page(history, true));

        let local_id = store.append_optimistic("c1", MessageDraft::new("ping", agent()));
        let messages = store.messages("c1");
        assert_eq!(messages.len(), 21);
        let last = messages.last().unwrap();
        assert_eq!(last.status, MessageStatus::Queued);
        assert!(last.local_echo);

        let mut echo = server("m99", Utc::now().timestamp_millis(), "ping");
        echo.sender = agent();
        echo.client_generated_id = Some(local_id.clone());
        assert_eq!(
            store.reconcile("c1", echo).unwrap(),
            ReconcileOutcome::ReplacedOptimistic
        );

        let messages = store.messages("c1");
        assert_eq!(messages.len(), 21);
        let last = messages.last().unwrap();
        assert_eq!(last.id, "m99");
        assert_eq!(last.status, MessageStatus::Sent);
        assert!(!last.local_echo);
        assert!(store.conversation_of(&local_id).is_none());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let store = MessageStore::default();
        let message = server("m1", 1_000, "hello");

        assert_eq!(
            store.reconcile("c1", message.clone()).unwrap(),
            ReconcileOutcome::Inserted
        );
        let before = store.messages("c1");
        assert_eq!(
            store.reconcile("c1", message).unwrap(),
            ReconcileOutcome::Duplicate
        );
        assert_eq!(store.messages("c1"), before);
    }

    #[test]
    fn test_ordering_by_timestamp_with_arrival_tie_break() {
        let store = MessageStore::default();
        store.reconcile("c1", server("b", 2_000, "b")).unwrap();
        store.reconcile("c1", server("a", 1_000, "a")).unwrap();
        store.reconcile("c1", server("tie-1", 2_000, "first")).unwrap();
        store.reconcile("c1", server("tie-2", 2_000, "second")).unwrap();

        assert_eq!(ids(&store), vec!["a", "b", "tie-1", "tie-2"]);
        let timestamps: Vec<_> = store.messages("c1").iter().map(|m| m.timestamp).collect();
        assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_backfill_skips_known_messages_without_moving_them() {
        let store = MessageStore::default();
        store.merge_page(
            "c1",
            page(vec![server("m3", 3_000, "c"), server("m4", 4_000, "d")], true),
        );
        let added = store.merge_page(
            "c1",
            page(
                vec![
                    server("m1", 1_000, "a"),
                    server("m2", 3_000, "b"),
                    server("m3", 3_000, "c"),
                ],
                false,
            ),
        );

        assert_eq!(added, 2);
        // m2 shares m3's timestamp but came from an older page, so it goes first.
        assert_eq!(ids(&store), vec!["m1", "m2", "m3", "m4"]);
        let cursor = store.cursor("c1").unwrap();
        assert!(!cursor.has_more);
        assert_eq!(cursor.oldest_loaded_timestamp, Some(at(1_000)));
    }

    #[test]
    fn test_heuristic_echo_without_client_id() {
        let store = MessageStore::new(Duration::from_secs(10));
        let local_id = store.append_optimistic(
            "c1",
            MessageDraft::new("where is my order?", agent()).at(at(50_000)),
        );

        let mut echo = server("m5", 53_000, "where is my order?");
        echo.sender = agent();
        assert_eq!(
            store.reconcile("c1", echo).unwrap(),
            ReconcileOutcome::ReplacedOptimistic
        );
        let messages = store.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].client_generated_id.as_deref(), Some(local_id.as_str()));
    }

    #[test]
    fn test_heuristic_echo_respects_window_and_sender() {
        let store = MessageStore::new(Duration::from_secs(1));
        store.append_optimistic("c1", MessageDraft::new("hi", agent()).at(at(10_000)));

        let mut late = server("m1", 20_000, "hi");
        late.sender = agent();
        assert_eq!(store.reconcile("c1", late).unwrap(), ReconcileOutcome::Inserted);

        let other = server("m2", 10_000, "hi");
        assert_eq!(store.reconcile("c1", other).unwrap(), ReconcileOutcome::Inserted);
        assert_eq!(store.len("c1"), 3);
    }

    #[test]
    fn test_ack_id_matches_echo_missing_client_id() {
        let store = MessageStore::default();
        let local_id = store.append_optimistic("c1", MessageDraft::new("thanks", agent()));
        store.mark_sending(&local_id).unwrap();
        assert!(store.mark_acknowledged(&local_id, Some("m7")));
        assert_eq!(store.messages("c1")[0].status, MessageStatus::Sent);

        let mut echo = server("m7", Utc::now().timestamp_millis() + 60_000, "thanks (edited)");
        echo.sender = agent();
        assert_eq!(
            store.reconcile("c1", echo).unwrap(),
            ReconcileOutcome::ReplacedOptimistic
        );
        assert_eq!(ids(&store), vec!["m7"]);
    }

    #[test]
    fn test_late_ack_collapses_unrecognised_echo() {
        let store = MessageStore::new(Duration::ZERO);
        let local_id =
            store.append_optimistic("c1", MessageDraft::new("hi", agent()).at(at(1_000)));
        let mut echo = server("m1", 9_000, "hi");
        echo.sender = agent();
        store.reconcile("c1", echo).unwrap();
        assert_eq!(store.len("c1"), 2);

        assert!(store.mark_acknowledged(&local_id, Some("m1")));
        assert_eq!(ids(&store), vec!["m1"]);
        assert!(!store.mark_acknowledged(&local_id, Some("m1")));
    }

    #[test]
    fn test_failed_messages_stay_visible_and_can_be_retried() {
        let store = MessageStore::default();
        let local_id = store.append_optimistic("c1", MessageDraft::new("hello", agent()));
        store.mark_sending(&local_id).unwrap();
        assert!(store.mark_failed(&local_id, "network down").unwrap());

        let failed = store.messages("c1").pop().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("network down"));
        assert!(failed.is_retryable());

        let retried = store.prepare_retry(&local_id).unwrap();
        assert_eq!(retried.status, MessageStatus::Sending);
        assert_eq!(retried.client_generated_id.as_deref(), Some(local_id.as_str()));
        assert!(store.prepare_retry(&local_id).is_err());
    }

    #[test]
    fn test_discard_only_removes_failed_entries() {
        let store = MessageStore::default();
        let local_id = store.append_optimistic("c1", MessageDraft::new("oops", agent()));
        assert!(matches!(
            store.discard(&local_id),
            Err(ChatError::Validation { .. })
        ));

        store.mark_failed(&local_id, "rejected").unwrap();
        store.discard(&local_id).unwrap();
        assert!(store.is_empty("c1"));
        assert!(matches!(
            store.discard(&local_id),
            Err(ChatError::MessageNotFound { .. })
        ));
    }

    #[test]
    fn test_mark_failed_ignores_acknowledged_messages() {
        let store = MessageStore::default();
        let local_id = store.append_optimistic("c1", MessageDraft::new("hi", agent()));
        store.mark_acknowledged(&local_id, None);
        assert!(!store.mark_failed(&local_id, "timeout").unwrap());
    }

    #[test]
    fn test_fail_pending_flushes_unacknowledged() {
        let store = MessageStore::default();
        let queued = store.append_optimistic("c1", MessageDraft::new("one", agent()));
        let acked = store.append_optimistic("c1", MessageDraft::new("two", agent()));
        store.mark_acknowledged(&acked, None);

        assert_eq!(store.fail_pending("c1", "session closed"), vec![queued]);
    }

    #[test]
    fn test_mark_read_is_monotonic_and_bounded() {
        let store = MessageStore::default();
        for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
            store
                .reconcile("c1", server(id, 1_000 + i as i64, "x"))
                .unwrap();
        }

        assert_eq!(store.mark_read("c1", "m2", "agent-1").unwrap(), 2);
        assert_eq!(store.mark_read("c1", "m1", "agent-1").unwrap(), 0);
        let messages = store.messages("c1");
        assert!(messages[0].is_read_by("agent-1"));
        assert!(messages[1].is_read_by("agent-1"));
        assert!(!messages[2].is_read_by("agent-1"));
        assert!(matches!(
            store.mark_read("c1", "missing", "agent-1"),
            Err(ChatError::MessageNotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_server_messages_are_rejected() {
        let store = MessageStore::default();
        assert!(matches!(
            store.reconcile("c1", server("", 1, "x")),
            Err(ChatError::MalformedMessage { .. })
        ));
        let mut foreign = server("m1", 1, "x");
        foreign.conversation_id = "c2".to_string();
        assert!(store.reconcile("c1", foreign).is_err());
        assert!(store
            .reconcile("c1", server("m2", 2, "still works"))
            .is_ok());
    }

    #[test]
    fn test_counts_wait_for_first_page() {
        let store = MessageStore::default();
        store.reconcile("c1", server("m1", 1, "x")).unwrap();
        assert_eq!(store.count_where("c1", |_| true), None);

        store.merge_page("c1", page(Vec::new(), false));
        assert_eq!(store.count_where("c1", |_| true), Some(1));
    }

    #[test]
    fn test_mark_loaded_counts_live_messages() {
        let store = MessageStore::default();
        store.reconcile("c1", server("m1", 1, "x")).unwrap();
        store.mark_loaded("c1");
        assert!(store.is_loaded("c1"));
        assert_eq!(store.count_where("c1", |_| true), Some(1));
        assert!(store.cursor("c1").unwrap().has_more);
    }

    #[test]
    fn test_mark_read_counts_only_new_readers() {
        let store = MessageStore::default();
        store.merge_page(
            "c1",
            page(vec![server("m1", 1, "a"), server("m2", 2, "b")], false),
        );
        assert_eq!(store.mark_read("c1", "m1", "agent-1").unwrap(), 1);
        assert_eq!(store.mark_read("c1", "m2", "agent-1").unwrap(), 1);
        assert_eq!(store.mark_read("c1", "m2", "agent-1").unwrap(), 0);
    }

    #[test]
    fn test_heuristic_skips_entries_bound_by_their_ack() {
        let store = MessageStore::new(Duration::from_secs(10));
        let first = store.append_optimistic("c1", MessageDraft::new("ok", agent()).at(at(1_000)));
        let second = store.append_optimistic("c1", MessageDraft::new("ok", agent()).at(at(1_500)));
        store.mark_sending(&first).unwrap();
        assert!(store.mark_acknowledged(&first, Some("m1")));

        let mut echo = server("m2", 1_600, "ok");
        echo.sender = agent();
        assert_eq!(
            store.reconcile("c1", echo).unwrap(),
            ReconcileOutcome::ReplacedOptimistic
        );
        let messages = store.messages("c1");
        assert_eq!(messages[0].id, first);
        assert!(messages[0].local_echo);
        assert_eq!(messages[1].id, "m2");
        assert_eq!(messages[1].client_generated_id.as_deref(), Some(second.as_str()));
    }

    struct FixedHistory(Vec<Message>);

    #[async_trait]
    impl HistoryProvider for FixedHistory {
        async fn fetch_page(
            &self,
            _conversation_id: &str,
            before: Option<DateTime<Utc>>,
            limit: usize,
        ) -> ChatResult<HistoryBatch> {
            let eligible: Vec<Message> = self
                .0
                .iter()
                .filter(|m| before.map_or(true, |before| m.timestamp < before))
                .cloned()
                .collect();
            let start = eligible.len().saturating_sub(limit);
            Ok(HistoryBatch {
                messages: eligible[start..].to_vec(),
                has_more: start > 0,
                total_count: Some(self.0.len() as u64),
            })
        }
    }

    #[tokio::test]
    async fn test_load_older_page_walks_backwards() {
        let provider = FixedHistory((0..5).map(|i| server(&format!("m{i}"), i * 100, "x")).collect());
        let store = MessageStore::default();

        let first = store.load_older_page(&provider, "c1", None, 2).await.unwrap();
        assert_eq!(first, LoadedPage { added: 2, has_more: true });

        let before = store.cursor("c1").unwrap().oldest_loaded_timestamp;
        let second = store.load_older_page(&provider, "c1", before, 2).await.unwrap();
        assert_eq!(second.added, 2);
        assert_eq!(ids(&store), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(store.cursor("c1").unwrap().total_count, Some(5));
    }

    #[tokio::test]
    async fn test_backfill_keeps_ties_across_the_page_edge() {
        let provider = FixedHistory(vec![
            server("m1", 100, "x"),
            server("m2", 200, "x"),
            server("m3", 200, "x"),
            server("m4", 200, "x"),
            server("m5", 300, "x"),
        ]);
        let store = MessageStore::default();

        store.load_older_page(&provider, "c1", None, 2).await.unwrap();
        assert_eq!(ids(&store), vec!["m4", "m5"]);

        let mut pages = 1;
        while store.cursor("c1").unwrap().has_more {
            let before = store.cursor("c1").unwrap().next_page_before();
            let limit = 2 + store.loaded_at_oldest("c1");
            let page = store.load_older_page(&provider, "c1", before, limit).await.unwrap();
            assert!(page.added > 0, "page {pages} added nothing");
            pages += 1;
        }
        assert_eq!(pages, 3);
        assert_eq!(store.len("c1"), 5);
        let mut loaded = ids(&store);
        loaded.sort();
        assert_eq!(loaded, vec!["m1", "m2", "m3", "m4", "m5"]);
    }
}
