//! Conversation session manager.
//!
//! Drives one state machine per conversation on top of a single injected
//! [`Transport`]:
//!
//! ```text
//! idle -> opening -> active -> backgrounded
//!                      \-> closing -> closed
//! ```
//!
//! Live events and history pages are serialised per conversation. While a
//! page is being fetched (the initial page during `opening`, or a backfill)
//! live events are queued and replayed in arrival order once the page has
//! been merged. Each conversation carries a generation number so pumps and
//! fetches that outlive a close or reopen are ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use supportdesk_config::AppConfig;
use supportdesk_transport::{
    Ack, ConnectionState, Credentials, InboundMessage, PresenceMember, Subscription, Transport,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::entities::{
    Attachment, Conversation, Message, MessageDraft, PaginationCursor, PresenceEntry,
    PresenceStatus, Sender, SessionPhase,
};
use crate::repositories::{
    HistoryBatch, HistoryProvider, MessageStore, ReconcileOutcome, TransportHistory,
};
use crate::services::presence_tracker::PresenceTracker;
use crate::services::unread::UnreadAggregator;
use crate::types::{
    conversation_channel, presence_channel, ChatError, ChatResult, EventStream, MessageEvent,
    PresenceData, ReadReceiptEvent, SessionEvent, TypingEvent, WireEvent,
};
use crate::utils::Validator;

/// Tunables of the session manager
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub workspace_id: String,
    pub page_size: usize,
    pub send_timeout: Duration,
    pub echo_match_window: Duration,
    pub event_buffer: usize,
    pub presence_ttl: Duration,
    pub typing_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workspace_id: config.transport.workspace_id.clone(),
            page_size: config.session.page_size.max(1),
            send_timeout: config.session.send_timeout(),
            echo_match_window: config.session.echo_match_window(),
            event_buffer: config.session.event_buffer,
            presence_ttl: config.presence.presence_ttl(),
            typing_timeout: config.presence.typing_timeout(),
            heartbeat_interval: Duration::from_millis(config.presence.heartbeat_interval_ms),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Initial,
    Older,
    Recent,
}

struct ConversationSession {
    conversation: Conversation,
    phase: SessionPhase,
    generation: u64,
    fetch_token: u64,
    in_flight: Option<u64>,
    /// Live events wait in `pending` while set
    buffering: bool,
    pending: VecDeque<InboundMessage>,
    tasks: Vec<JoinHandle<()>>,
    typing_timer: Option<JoinHandle<()>>,
}

impl ConversationSession {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            phase: SessionPhase::Idle,
            generation: 0,
            fetch_token: 0,
            in_flight: None,
            buffering: false,
            pending: VecDeque::new(),
            tasks: Vec::new(),
            typing_timer: None,
        }
    }

    fn begin_fetch(&mut self) -> u64 {
        self.fetch_token += 1;
        self.in_flight = Some(self.fetch_token);
        self.buffering = true;
        self.fetch_token
    }

    /// Stop pumps and timers. Dropping the pumps drops their subscriptions.
    fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
        }
        self.pending.clear();
        self.buffering = false;
        self.in_flight = None;
    }
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryProvider>,
    settings: SessionSettings,
    identity: Sender,
    store: MessageStore,
    presence: PresenceTracker,
    unread: UnreadAggregator,
    events: broadcast::Sender<SessionEvent>,
    sessions: Mutex<HashMap<String, ConversationSession>>,
    credentials: Mutex<Option<Credentials>>,
    send_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Entry point for the UI layer
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Manager reading history over the same transport
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings, identity: Sender) -> Self {
        let history = Arc::new(TransportHistory::new(
            transport.clone(),
            settings.workspace_id.clone(),
        ));
        Self::with_history(transport, history, settings, identity)
    }

    pub fn with_history(
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryProvider>,
        settings: SessionSettings,
        identity: Sender,
    ) -> Self {
        let store = MessageStore::new(settings.echo_match_window);
        let presence = PresenceTracker::new(settings.presence_ttl, settings.typing_timeout);
        let unread = UnreadAggregator::new(store.clone(), identity.id.clone());
        let (events, _) = broadcast::channel(settings.event_buffer.max(16));

        Self {
            inner: Arc::new(ManagerInner {
                transport,
                history,
                settings,
                identity,
                store,
                presence,
                unread,
                events,
                sessions: Mutex::new(HashMap::new()),
                credentials: Mutex::new(None),
                send_timers: Mutex::new(HashMap::new()),
                maintenance: Mutex::new(None),
            }),
        }
    }

    /// Connect the transport and start background upkeep
    pub async fn connect(&self, credentials: Credentials) -> ChatResult<()> {
        *lock(&self.inner.credentials) = Some(credentials.clone());
        self.inner.start_maintenance();
        self.inner.transport.connect(&credentials).await?;
        info!(workspace_id = %credentials.workspace_id, user = %self.inner.identity.id, "session connected");
        Ok(())
    }

    pub async fn open_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        Validator::conversation_id(conversation_id)?;
        let inner = &self.inner;

        let (generation, token) = {
            let mut sessions = lock(&inner.sessions);
            let session = sessions
                .entry(conversation_id.to_string())
                .or_insert_with(|| ConversationSession::new(Conversation::new(conversation_id)));
            match session.phase {
                SessionPhase::Active | SessionPhase::Opening => return Ok(()),
                SessionPhase::Backgrounded => {
                    session.phase = SessionPhase::Active;
                    inner.emit_phase(conversation_id, SessionPhase::Active);
                    return Ok(());
                }
                SessionPhase::Idle | SessionPhase::Closing | SessionPhase::Closed => {}
            }
            session.teardown();
            session.generation += 1;
            session.phase = SessionPhase::Opening;
            let token = session.begin_fetch();
            (session.generation, token)
        };
        inner.unread.track(conversation_id, None);
        inner.emit_phase(conversation_id, SessionPhase::Opening);
        info!(conversation_id, generation, "opening conversation");

        if let Err(error) = inner.subscribe_conversation(conversation_id, generation).await {
            inner.abandon_open(conversation_id, generation);
            return Err(error);
        }

        let result = inner
            .history
            .fetch_page(conversation_id, None, inner.settings.page_size)
            .await;
        inner
            .finish_fetch(conversation_id, generation, token, FetchKind::Initial, result)
            .map(|_| ())
    }

    /// Background an active conversation, or cancel one still opening
    pub fn close_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        let inner = &self.inner;
        let mut sessions = lock(&inner.sessions);
        let session = sessions
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;

        match session.phase {
            SessionPhase::Opening => {
                session.teardown();
                session.generation += 1;
                session.phase = SessionPhase::Idle;
                info!(conversation_id, "open cancelled");
                inner.emit_phase(conversation_id, SessionPhase::Idle);
            }
            SessionPhase::Active => {
                if session.in_flight.take().is_some() {
                    debug!(conversation_id, "in-flight page cancelled");
                }
                inner.drain(conversation_id, session);
                session.phase = SessionPhase::Backgrounded;
                inner.emit_phase(conversation_id, SessionPhase::Backgrounded);
            }
            _ => {}
        }
        Ok(())
    }

    /// Fetch and merge the page before the oldest loaded message.
    ///
    /// Returns how many messages were added.
    pub async fn load_older_messages(&self, conversation_id: &str) -> ChatResult<usize> {
        let inner = &self.inner;
        let (generation, token, before, limit) = {
            let mut sessions = lock(&inner.sessions);
            let session = sessions
                .get_mut(conversation_id)
                .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;
            if session.phase != SessionPhase::Active {
                return Err(ChatError::validation(format!(
                    "conversation {conversation_id} is {}",
                    session.phase
                )));
            }
            if session.in_flight.is_some() {
                return Err(ChatError::pagination("a page is already loading"));
            }
            let cursor = inner.store.cursor(conversation_id).unwrap_or_default();
            if !cursor.has_more {
                return Ok(0);
            }
            let token = session.begin_fetch();
            let limit = inner.settings.page_size + inner.store.loaded_at_oldest(conversation_id);
            (session.generation, token, cursor.next_page_before(), limit)
        };

        let result = inner
            .history
            .fetch_page(conversation_id, before, limit)
            .await;
        inner.finish_fetch(conversation_id, generation, token, FetchKind::Older, result)
    }

    /// Re-read the newest page to pick up anything missed while offline
    pub async fn resync_conversation(&self, conversation_id: &str) -> ChatResult<usize> {
        self.inner.clone().resync(conversation_id.to_string()).await
    }

    /// Show the message immediately, then publish it.
    ///
    /// Returns the local id. A failed publish leaves the message visible as
    /// `failed` rather than returning an error.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> ChatResult<String> {
        Validator::message_content(content, !attachments.is_empty())?;
        let inner = &self.inner;
        inner.ensure_writable(conversation_id)?;

        let draft = MessageDraft::new(content, inner.identity.clone()).with_attachments(attachments);
        let local_id = inner.store.append_optimistic(conversation_id, draft);
        inner.emit_messages(conversation_id);

        inner.publish_pending(conversation_id, &local_id).await;
        Ok(local_id)
    }

    /// Republish a failed message with its original client id
    pub async fn retry_message(&self, local_id: &str) -> ChatResult<()> {
        let inner = &self.inner;
        let conversation_id = inner
            .store
            .conversation_of(local_id)
            .ok_or_else(|| ChatError::message_not_found(local_id))?;
        inner.store.prepare_retry(local_id)?;
        info!(%conversation_id, local_id, "retrying message");
        inner.publish_pending(&conversation_id, local_id).await;
        Ok(())
    }

    pub fn discard_message(&self, local_id: &str) -> ChatResult<()> {
        let inner = &self.inner;
        let conversation_id = inner
            .store
            .conversation_of(local_id)
            .ok_or_else(|| ChatError::message_not_found(local_id))?;
        inner.store.discard(local_id)?;
        inner.emit_messages(&conversation_id);
        Ok(())
    }

    /// Mark everything loaded as read and tell the other participants
    pub async fn mark_as_read(&self, conversation_id: &str) -> ChatResult<()> {
        let inner = &self.inner;
        inner.ensure_known(conversation_id)?;
        let marked = inner.unread.mark_conversation_as_read(conversation_id)?;
        inner.emit_messages(conversation_id);
        inner.emit_unread(conversation_id);

        if let Some(message_id) = marked {
            let receipt = WireEvent::ReadReceipt(ReadReceiptEvent {
                conversation_id: conversation_id.to_string(),
                message_id,
                reader_id: inner.identity.id.clone(),
            });
            if let Err(error) = inner.publish_event(conversation_id, &receipt).await {
                warn!(conversation_id, %error, "read receipt not delivered");
            }
        }
        Ok(())
    }

    /// Publish our own typing state. Delivery is best effort.
    pub async fn notify_typing(&self, conversation_id: &str, is_typing: bool) -> ChatResult<()> {
        let inner = &self.inner;
        inner.ensure_known(conversation_id)?;
        let event = WireEvent::Typing(TypingEvent {
            conversation_id: conversation_id.to_string(),
            participant_id: inner.identity.id.clone(),
            is_typing,
        });
        if let Err(error) = inner.publish_event(conversation_id, &event).await {
            debug!(conversation_id, %error, "typing signal not delivered");
        }
        Ok(())
    }

    /// Seed a conversation from the inbox list with the backend's unread count
    pub fn register_conversation(&self, conversation: Conversation) -> ChatResult<()> {
        Validator::conversation_id(&conversation.id)?;
        let inner = &self.inner;
        let id = conversation.id.clone();
        let server_unread = conversation.unread_count;
        {
            let mut sessions = lock(&inner.sessions);
            match sessions.get_mut(&id) {
                Some(session) => {
                    session.conversation.title = conversation.title;
                    session.conversation.kind = conversation.kind;
                    if let Some(timestamp) = conversation.last_message_timestamp {
                        session.conversation.touch(timestamp);
                    }
                }
                None => {
                    sessions.insert(id.clone(), ConversationSession::new(conversation));
                }
            }
        }
        inner.unread.track(&id, Some(server_unread));
        inner.emit_unread(&id);
        Ok(())
    }

    /// Unsubscribe and drop every trace of a conversation
    pub fn archive_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        let inner = &self.inner;
        let mut session = lock(&inner.sessions)
            .remove(conversation_id)
            .ok_or_else(|| ChatError::conversation_not_found(conversation_id))?;
        session.teardown();

        let dropped = inner.store.clear(conversation_id);
        inner.presence.forget(
            conversation_id,
            &presence_channel(&inner.settings.workspace_id, conversation_id),
        );
        inner.unread.forget(conversation_id);
        info!(conversation_id, dropped, "conversation archived");

        inner.emit_phase(conversation_id, SessionPhase::Closed);
        inner.emit(SessionEvent::UnreadCountChanged {
            conversation_id: conversation_id.to_string(),
            unread: 0,
            total: inner.unread.total_unread(),
        });
        Ok(())
    }

    /// Close every conversation and disconnect the transport.
    ///
    /// Optimistic messages that were never acknowledged end up `failed`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut sessions = lock(&inner.sessions);
            for (conversation_id, session) in sessions.iter_mut() {
                if session.phase == SessionPhase::Closed {
                    continue;
                }
                session.phase = SessionPhase::Closing;
                inner.emit_phase(conversation_id, SessionPhase::Closing);
                session.teardown();

                let failed = inner
                    .store
                    .fail_pending(conversation_id, "session closed before acknowledgement");
                if !failed.is_empty() {
                    warn!(%conversation_id, count = failed.len(), "unacknowledged messages failed at shutdown");
                    inner.emit_messages(conversation_id);
                }

                session.phase = SessionPhase::Closed;
                inner.emit_phase(conversation_id, SessionPhase::Closed);
            }
        }

        if let Some(maintenance) = lock(&inner.maintenance).take() {
            maintenance.abort();
        }
        for (_, timer) in lock(&inner.send_timers).drain() {
            timer.abort();
        }
        inner.transport.disconnect().await;
        info!("session manager shut down");
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.inner.store.messages(conversation_id)
    }

    pub fn typing_participants(&self, conversation_id: &str) -> Vec<String> {
        self.inner.presence.typing_participants(conversation_id)
    }

    pub fn presence(&self, conversation_id: &str) -> Vec<PresenceEntry> {
        self.inner.presence.presence(&presence_channel(
            &self.inner.settings.workspace_id,
            conversation_id,
        ))
    }

    pub fn phase(&self, conversation_id: &str) -> Option<SessionPhase> {
        lock(&self.inner.sessions)
            .get(conversation_id)
            .map(|session| session.phase)
    }

    pub fn cursor(&self, conversation_id: &str) -> Option<PaginationCursor> {
        self.inner.store.cursor(conversation_id)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let mut conversation = lock(&self.inner.sessions)
            .get(conversation_id)
            .map(|session| session.conversation.clone())?;
        conversation.unread_count = self.inner.unread.unread_count(conversation_id);
        Some(conversation)
    }

    /// Known conversations, most recently active first
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = lock(&self.inner.sessions)
            .values()
            .map(|session| session.conversation.clone())
            .collect();
        for conversation in &mut conversations {
            conversation.unread_count = self.inner.unread.unread_count(&conversation.id);
        }
        conversations.sort_by(|a, b| {
            b.last_message_timestamp
                .cmp(&a.last_message_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        conversations
    }

    pub fn unread_count(&self, conversation_id: &str) -> usize {
        self.inner.unread.unread_count(conversation_id)
    }

    pub fn total_unread(&self) -> usize {
        self.inner.unread.total_unread()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn identity(&self) -> &Sender {
        &self.inner.identity
    }

    /// Every session event
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    pub fn on_messages_changed(&self, conversation_id: &str) -> EventStream {
        let id = conversation_id.to_string();
        EventStream::filtered(self.inner.events.subscribe(), move |event| {
            matches!(event, SessionEvent::MessagesChanged { conversation_id } if *conversation_id == id)
        })
    }

    pub fn on_typing_changed(&self, conversation_id: &str) -> EventStream {
        let id = conversation_id.to_string();
        EventStream::filtered(self.inner.events.subscribe(), move |event| {
            matches!(event, SessionEvent::TypingChanged { conversation_id, .. } if *conversation_id == id)
        })
    }

    pub fn on_presence_changed(&self, conversation_id: &str) -> EventStream {
        let id = conversation_id.to_string();
        EventStream::filtered(self.inner.events.subscribe(), move |event| {
            matches!(event, SessionEvent::PresenceChanged { conversation_id } if *conversation_id == id)
        })
    }

    pub fn on_unread_count_changed(&self) -> EventStream {
        EventStream::filtered(self.inner.events.subscribe(), |event| {
            matches!(event, SessionEvent::UnreadCountChanged { .. })
        })
    }

    pub fn on_conversation_state_changed(&self) -> EventStream {
        EventStream::filtered(self.inner.events.subscribe(), |event| {
            matches!(event, SessionEvent::ConversationStateChanged { .. })
        })
    }

    /// Connection state is owned by the transport; observers only read it
    pub fn on_connection_state_changed(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.watch_state()
    }
}

impl ManagerInner {
    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_phase(&self, conversation_id: &str, phase: SessionPhase) {
        debug!(conversation_id, %phase, "conversation state changed");
        self.emit(SessionEvent::ConversationStateChanged {
            conversation_id: conversation_id.to_string(),
            phase,
        });
    }

    fn emit_messages(&self, conversation_id: &str) {
        self.emit(SessionEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
    }

    fn emit_typing(&self, conversation_id: &str) {
        self.emit(SessionEvent::TypingChanged {
            conversation_id: conversation_id.to_string(),
            participants: self.presence.typing_participants(conversation_id),
        });
    }

    fn emit_unread(&self, conversation_id: &str) {
        self.emit(SessionEvent::UnreadCountChanged {
            conversation_id: conversation_id.to_string(),
            unread: self.unread.unread_count(conversation_id),
            total: self.unread.total_unread(),
        });
    }

    fn channel(&self, conversation_id: &str) -> String {
        conversation_channel(&self.settings.workspace_id, conversation_id)
    }

    fn ensure_known(&self, conversation_id: &str) -> ChatResult<()> {
        if lock(&self.sessions).contains_key(conversation_id) {
            Ok(())
        } else {
            Err(ChatError::conversation_not_found(conversation_id))
        }
    }

    fn ensure_writable(&self, conversation_id: &str) -> ChatResult<()> {
        match lock(&self.sessions).get(conversation_id).map(|session| session.phase) {
            None => Err(ChatError::conversation_not_found(conversation_id)),
            Some(SessionPhase::Closing | SessionPhase::Closed) => Err(ChatError::validation(
                format!("conversation {conversation_id} is closed"),
            )),
            Some(_) => Ok(()),
        }
    }

    async fn ensure_connected(&self) -> ChatResult<()> {
        let state = self.transport.state();
        if state.is_connected() || state.is_recovering() {
            return Ok(());
        }
        let credentials = lock(&self.credentials).clone();
        match credentials {
            Some(credentials) => Ok(self.transport.connect(&credentials).await?),
            None => Err(ChatError::connection(format!(
                "transport is {state} and no credentials were supplied"
            ))),
        }
    }

    fn presence_data(&self) -> Value {
        serde_json::to_value(PresenceData {
            name: Some(self.identity.display_name().to_string()),
            status: PresenceStatus::Online,
            last_active: Some(Utc::now().timestamp_millis()),
        })
        .unwrap_or_default()
    }

    async fn subscribe_conversation(
        self: &Arc<Self>,
        conversation_id: &str,
        generation: u64,
    ) -> ChatResult<()> {
        self.ensure_connected().await?;

        let messages = self
            .transport
            .subscribe_channel(&self.channel(conversation_id))
            .await?;
        let presence_channel = presence_channel(&self.settings.workspace_id, conversation_id);
        let presence = match self.transport.subscribe_presence(&presence_channel).await {
            Ok(subscription) => Some(subscription),
            Err(error) => {
                warn!(conversation_id, %error, "presence subscription failed");
                None
            }
        };

        {
            let mut sessions = lock(&self.sessions);
            let Some(session) = sessions
                .get_mut(conversation_id)
                .filter(|session| session.generation == generation && session.phase == SessionPhase::Opening)
            else {
                return Err(ChatError::cancelled(format!("open {conversation_id}")));
            };
            let weak = Arc::downgrade(self);
            session.tasks.push(tokio::spawn(pump_messages(
                weak.clone(),
                conversation_id.to_string(),
                generation,
                messages,
            )));
            if let Some(presence) = presence {
                session.tasks.push(tokio::spawn(pump_presence(
                    weak,
                    conversation_id.to_string(),
                    presence,
                )));
            }
        }

        match self.transport.get_presence(&presence_channel).await {
            Ok(members) => {
                self.presence.on_presence_members(&presence_channel, &members);
                self.emit(SessionEvent::PresenceChanged {
                    conversation_id: conversation_id.to_string(),
                });
            }
            Err(error) => debug!(conversation_id, %error, "presence snapshot unavailable"),
        }
        if let Err(error) = self
            .transport
            .enter_presence(&presence_channel, self.presence_data())
            .await
        {
            debug!(conversation_id, %error, "presence announcement failed");
        }
        Ok(())
    }

    fn abandon_open(&self, conversation_id: &str, generation: u64) {
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get_mut(conversation_id) {
            if session.generation == generation && session.phase == SessionPhase::Opening {
                session.teardown();
                session.phase = SessionPhase::Idle;
                self.emit_phase(conversation_id, SessionPhase::Idle);
            }
        }
    }

    fn finish_fetch(
        self: &Arc<Self>,
        conversation_id: &str,
        generation: u64,
        token: u64,
        kind: FetchKind,
        result: ChatResult<HistoryBatch>,
    ) -> ChatResult<usize> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(conversation_id)
            .filter(|session| session.generation == generation && session.in_flight == Some(token));
        let Some(session) = session else {
            debug!(conversation_id, ?kind, "discarding page of a cancelled request");
            return Err(ChatError::cancelled(format!(
                "{kind:?} page for {conversation_id}"
            )));
        };
        session.in_flight = None;

        let outcome = match result {
            Ok(batch) => {
                let added = match kind {
                    FetchKind::Recent if self.store.is_loaded(conversation_id) => {
                        self.absorb_recent(conversation_id, batch)
                    }
                    _ => self.store.merge_page(conversation_id, batch),
                };
                if let Some(newest) = self
                    .store
                    .messages(conversation_id)
                    .iter()
                    .rev()
                    .find(|message| !message.local_echo)
                {
                    session.conversation.touch(newest.timestamp);
                }
                Ok(added)
            }
            Err(error) => {
                warn!(conversation_id, ?kind, %error, "history page failed");
                Err(match error {
                    ChatError::Pagination { .. } => error,
                    other => ChatError::pagination(other.to_string()),
                })
            }
        };

        if kind == FetchKind::Initial {
            self.store.mark_loaded(conversation_id);
            session.phase = SessionPhase::Active;
            self.emit_phase(conversation_id, SessionPhase::Active);
        }
        let replayed = self.drain(conversation_id, session);
        debug!(conversation_id, ?kind, replayed, "page applied");

        self.emit_messages(conversation_id);
        self.emit_unread(conversation_id);
        outcome
    }

    fn absorb_recent(&self, conversation_id: &str, batch: HistoryBatch) -> usize {
        batch
            .messages
            .into_iter()
            .filter_map(|message| match self.store.reconcile(conversation_id, message) {
                Ok(ReconcileOutcome::Duplicate) => None,
                Ok(outcome) => Some(outcome),
                Err(error) => {
                    warn!(conversation_id, %error, "dropping malformed history entry");
                    None
                }
            })
            .count()
    }

    async fn resync(self: Arc<Self>, conversation_id: String) -> ChatResult<usize> {
        let (generation, token) = {
            let mut sessions = lock(&self.sessions);
            let session = sessions
                .get_mut(&conversation_id)
                .ok_or_else(|| ChatError::conversation_not_found(&conversation_id))?;
            if !matches!(session.phase, SessionPhase::Active | SessionPhase::Backgrounded)
                || session.in_flight.is_some()
            {
                return Ok(0);
            }
            (session.generation, session.begin_fetch())
        };

        let result = self
            .history
            .fetch_page(&conversation_id, None, self.settings.page_size)
            .await;
        self.finish_fetch(&conversation_id, generation, token, FetchKind::Recent, result)
    }

    fn resync_all(self: &Arc<Self>) {
        let conversations: Vec<String> = lock(&self.sessions)
            .iter()
            .filter(|(_, session)| {
                matches!(session.phase, SessionPhase::Active | SessionPhase::Backgrounded)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for conversation_id in conversations {
            let inner = self.clone();
            tokio::spawn(async move {
                match inner.resync(conversation_id.clone()).await {
                    Ok(added) if added > 0 => {
                        info!(%conversation_id, added, "caught up after reconnect")
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%conversation_id, %error, "resync after reconnect failed"),
                }
            });
        }
    }

    /// Replay queued live events in arrival order
    fn drain(self: &Arc<Self>, conversation_id: &str, session: &mut ConversationSession) -> usize {
        session.buffering = false;
        let mut replayed = 0;
        while let Some(inbound) = session.pending.pop_front() {
            self.apply_event(conversation_id, session, inbound);
            replayed += 1;
        }
        replayed
    }

    fn ingest(self: &Arc<Self>, conversation_id: &str, generation: u64, inbound: InboundMessage) {
        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.get_mut(conversation_id) else {
            return;
        };
        if session.generation != generation {
            debug!(conversation_id, "event from a stale subscription ignored");
            return;
        }
        if session.buffering {
            session.pending.push_back(inbound);
            return;
        }
        self.apply_event(conversation_id, session, inbound);
    }

    fn apply_event(
        self: &Arc<Self>,
        conversation_id: &str,
        session: &mut ConversationSession,
        inbound: InboundMessage,
    ) {
        let channel = inbound.channel;
        let event = match WireEvent::decode(&inbound.payload) {
            Ok(event) => event,
            Err(error) => {
                warn!(%channel, %error, "dropping malformed event");
                return;
            }
        };
        if event.conversation_id() != conversation_id {
            warn!(%channel, found = event.conversation_id(), "dropping event addressed to another conversation");
            return;
        }

        match event {
            WireEvent::Message(event) => {
                let message = event.into_message();
                let sender_id = message.sender.id.clone();
                let timestamp = message.timestamp;
                match self.store.reconcile(conversation_id, message) {
                    Ok(ReconcileOutcome::Duplicate) => {
                        debug!(%channel, "duplicate message ignored");
                    }
                    Ok(_) => {
                        session.conversation.touch(timestamp);
                        self.emit_messages(conversation_id);
                        self.emit_unread(conversation_id);
                        if self.presence.stop_typing(conversation_id, &sender_id) {
                            self.emit_typing(conversation_id);
                        }
                    }
                    Err(error) => warn!(%channel, %error, "dropping message rejected by the store"),
                }
            }
            WireEvent::ReadReceipt(receipt) => {
                match self
                    .store
                    .mark_read(conversation_id, &receipt.message_id, &receipt.reader_id)
                {
                    Ok(0) => {}
                    Ok(_) => {
                        self.emit_messages(conversation_id);
                        if receipt.reader_id == self.identity.id {
                            self.emit_unread(conversation_id);
                        }
                    }
                    Err(error) => debug!(%channel, %error, "read receipt for a message not loaded"),
                }
            }
            WireEvent::Typing(typing) => {
                if typing.participant_id == self.identity.id {
                    return;
                }
                let changed = if typing.is_typing {
                    let started = self
                        .presence
                        .signal_typing(conversation_id, &typing.participant_id);
                    self.schedule_typing_refresh(conversation_id, session);
                    started
                } else {
                    self.presence
                        .stop_typing(conversation_id, &typing.participant_id)
                };
                if changed {
                    self.emit_typing(conversation_id);
                }
            }
        }
    }

    fn schedule_typing_refresh(self: &Arc<Self>, conversation_id: &str, session: &mut ConversationSession) {
        if let Some(previous) = session.typing_timer.take() {
            previous.abort();
        }
        session.typing_timer = Some(tokio::spawn(typing_refresh(
            Arc::downgrade(self),
            conversation_id.to_string(),
        )));
    }

    async fn publish_event(&self, conversation_id: &str, event: &WireEvent) -> ChatResult<Ack> {
        let payload = event.to_value()?;
        Ok(self
            .transport
            .publish(&self.channel(conversation_id), payload)
            .await?)
    }

    async fn publish_pending(self: &Arc<Self>, conversation_id: &str, local_id: &str) {
        if let Err(error) = self.store.mark_sending(local_id) {
            debug!(conversation_id, local_id, %error, "message vanished before publish");
            return;
        }
        let Some(message) = self.store.message(conversation_id, local_id) else {
            return;
        };
        self.emit_messages(conversation_id);
        self.arm_send_timer(conversation_id, local_id);

        let event = WireEvent::Message(MessageEvent::from_message(&message));
        let result = self.publish_event(conversation_id, &event).await;
        self.disarm_send_timer(local_id);

        match result {
            Ok(ack) => {
                debug!(conversation_id, local_id, server_id = ?ack.id, "message acknowledged");
                if self.store.mark_acknowledged(local_id, ack.id.as_deref()) {
                    self.emit_messages(conversation_id);
                }
            }
            Err(error) => {
                warn!(conversation_id, local_id, %error, "publish failed");
                self.fail_send(conversation_id, local_id, &error.to_string());
            }
        }
    }

    fn fail_send(&self, conversation_id: &str, local_id: &str, reason: &str) {
        if matches!(self.store.mark_failed(local_id, reason), Ok(true)) {
            self.emit_messages(conversation_id);
        }
    }

    fn arm_send_timer(self: &Arc<Self>, conversation_id: &str, local_id: &str) {
        let weak = Arc::downgrade(self);
        let timeout = self.settings.send_timeout;
        let conversation_id = conversation_id.to_string();
        let local = local_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            lock(&inner.send_timers).remove(&local);
            if matches!(
                inner.store.mark_failed(&local, "no acknowledgement before the send timeout"),
                Ok(true)
            ) {
                warn!(%conversation_id, local_id = %local, ?timeout, "send timed out");
                inner.emit_messages(&conversation_id);
            }
        });
        if let Some(previous) = lock(&self.send_timers).insert(local_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn disarm_send_timer(&self, local_id: &str) {
        if let Some(timer) = lock(&self.send_timers).remove(local_id) {
            timer.abort();
        }
    }

    fn start_maintenance(self: &Arc<Self>) {
        let mut maintenance = lock(&self.maintenance);
        if maintenance.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        *maintenance = Some(tokio::spawn(run_maintenance(
            Arc::downgrade(self),
            self.transport.watch_state(),
            self.settings.heartbeat_interval,
        )));
    }

    fn sweep(&self, since: DateTime<Utc>, now: DateTime<Utc>) {
        let report = self.presence.sweep_at(now, since);
        for conversation_id in &report.typing_changed {
            self.emit_typing(conversation_id);
        }
        let prefix = presence_channel(&self.settings.workspace_id, "");
        for channel in &report.presence_changed {
            if let Some(conversation_id) = channel.strip_prefix(&prefix) {
                self.emit(SessionEvent::PresenceChanged {
                    conversation_id: conversation_id.to_string(),
                });
            }
        }
    }

    /// Re-announce ourselves so other clients do not see us go stale
    fn refresh_presence(&self) {
        let conversations: Vec<String> = lock(&self.sessions)
            .iter()
            .filter(|(_, session)| {
                matches!(session.phase, SessionPhase::Active | SessionPhase::Backgrounded)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for conversation_id in conversations {
            let transport = self.transport.clone();
            let channel = presence_channel(&self.settings.workspace_id, &conversation_id);
            let data = self.presence_data();
            tokio::spawn(async move {
                if let Err(error) = transport.enter_presence(&channel, data).await {
                    debug!(%channel, %error, "presence refresh failed");
                }
            });
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let sessions = self
            .sessions
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for session in sessions.values_mut() {
            session.teardown();
        }
        let timers = self
            .send_timers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, timer) in timers.drain() {
            timer.abort();
        }
        if let Some(maintenance) = self
            .maintenance
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            maintenance.abort();
        }
    }
}

async fn pump_messages(
    weak: Weak<ManagerInner>,
    conversation_id: String,
    generation: u64,
    mut subscription: Subscription<InboundMessage>,
) {
    while let Some(inbound) = subscription.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.ingest(&conversation_id, generation, inbound);
    }
    debug!(%conversation_id, "message pump stopped");
}

async fn pump_presence(
    weak: Weak<ManagerInner>,
    conversation_id: String,
    mut subscription: Subscription<Vec<PresenceMember>>,
) {
    while let Some(members) = subscription.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner
            .presence
            .on_presence_members(subscription.channel(), &members);
        inner.emit(SessionEvent::PresenceChanged {
            conversation_id: conversation_id.clone(),
        });
    }
}

/// Emits `TypingChanged` when indicators lapse without a stop signal
async fn typing_refresh(weak: Weak<ManagerInner>, conversation_id: String) {
    let mut shown = match weak.upgrade() {
        Some(inner) => inner.presence.typing_participants(&conversation_id),
        None => return,
    };
    loop {
        let expiry = match weak.upgrade() {
            Some(inner) => inner.presence.next_typing_expiry(&conversation_id),
            None => return,
        };
        let Some(expiry) = expiry else {
            return;
        };
        let wait = (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait + Duration::from_millis(5)).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let current = inner.presence.typing_participants(&conversation_id);
        if current != shown {
            inner.emit(SessionEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
                participants: current.clone(),
            });
            shown = current;
        }
    }
}

async fn run_maintenance(
    weak: Weak<ManagerInner>,
    mut states: watch::Receiver<ConnectionState>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_state = *states.borrow();
    let mut last_sweep = Utc::now();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *states.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.emit(SessionEvent::ConnectionStateChanged { state });
                if state.is_connected() && last_state.is_recovering() {
                    info!("connection restored, resyncing open conversations");
                    inner.resync_all();
                }
                last_state = state;
            }
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let now = Utc::now();
                inner.sweep(last_sweep, now);
                last_sweep = now;
                inner.refresh_presence();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_follow_config() {
        let mut config = AppConfig::default();
        config.transport.workspace_id = "acme".into();
        config.session.page_size = 0;
        config.presence.typing_timeout_ms = 750;

        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.workspace_id, "acme");
        assert_eq!(settings.page_size, 1);
        assert_eq!(settings.typing_timeout, Duration::from_millis(750));
        assert_eq!(settings.send_timeout, Duration::from_secs(15));
        assert_eq!(settings.presence_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_begin_fetch_buffers_and_teardown_resets() {
        let mut session = ConversationSession::new(Conversation::new("c1"));
        let first = session.begin_fetch();
        let second = session.begin_fetch();
        assert!(second > first);
        assert_eq!(session.in_flight, Some(second));
        assert!(session.buffering);

        session.pending.push_back(InboundMessage {
            channel: "acme:conversation:c1".into(),
            payload: Value::Null,
        });
        session.teardown();
        assert!(session.pending.is_empty());
        assert!(!session.buffering);
        assert_eq!(session.in_flight, None);
    }
}
