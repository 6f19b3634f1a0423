//! In-process broker implementing [`Transport`].
//!
//! Plays the backend's role for tests and the console's offline mode: it
//! keeps per-channel history and presence, can echo published messages the
//! way the server does, and lets callers inject failures.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::state::StateCell;
use crate::{
    Ack, ConnectionState, Credentials, HistoryPage, InboundMessage, PresenceMember, Subscription,
    Transport, TransportError, TransportResult,
};

#[derive(Default)]
struct LoopChannel {
    message_handlers: HashMap<u64, mpsc::UnboundedSender<InboundMessage>>,
    presence_handlers: HashMap<u64, mpsc::UnboundedSender<Vec<PresenceMember>>>,
    presence: Vec<PresenceMember>,
    history: Vec<Value>,
}

impl LoopChannel {
    fn deliver(&mut self, channel: &str, payload: &Value) -> usize {
        self.message_handlers.retain(|_, handler| {
            handler
                .send(InboundMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
        });
        self.message_handlers.len()
    }

    fn broadcast_presence(&mut self) {
        let snapshot = self.presence.clone();
        self.presence_handlers
            .retain(|_, handler| handler.send(snapshot.clone()).is_ok());
    }

    fn record_history(&mut self, payload: &Value) {
        if event_type(payload) != Some("message") {
            return;
        }
        let id = payload.get("id");
        if id.is_some() && self.history.iter().any(|existing| existing.get("id") == id) {
            return;
        }
        self.history.push(payload.clone());
        sort_by_timestamp(&mut self.history);
    }
}

struct Broker {
    channels: HashMap<String, LoopChannel>,
    next_handler: u64,
    next_message_id: u64,
    echo: bool,
    client_id: String,
    required_token: Option<String>,
    refused_connects: usize,
    rejected_publishes: VecDeque<String>,
    hold_acks: bool,
    published: Vec<(String, Value)>,
    connects: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            next_handler: 1,
            next_message_id: 1,
            echo: false,
            client_id: "loopback".to_string(),
            required_token: None,
            refused_connects: 0,
            rejected_publishes: VecDeque::new(),
            hold_acks: false,
            published: Vec::new(),
            connects: 0,
        }
    }
}

impl Broker {
    fn channel(&mut self, name: &str) -> &mut LoopChannel {
        self.channels.entry(name.to_string()).or_default()
    }

    fn handler_id(&mut self) -> u64 {
        let id = self.next_handler;
        self.next_handler += 1;
        id
    }

    /// Server-side treatment of a published event: messages get a permanent id.
    fn apply_echo(&mut self, channel: &str, mut event: Value) -> (Value, Option<String>) {
        if event_type(&event) != Some("message") {
            return (event, None);
        }
        let id = format!("m{}", self.next_message_id);
        self.next_message_id += 1;
        if let Some(object) = event.as_object_mut() {
            object.insert("id".to_string(), Value::String(id.clone()));
        }
        self.channel(channel).record_history(&event);
        (event, Some(id))
    }
}

struct LoopbackInner {
    state: StateCell,
    broker: Mutex<Broker>,
    history_gate: watch::Sender<bool>,
}

impl LoopbackInner {
    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory stand-in for the realtime backend
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (history_gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(LoopbackInner {
                state: StateCell::new(),
                broker: Mutex::new(Broker::default()),
                history_gate,
            }),
        }
    }

    /// Echo published messages back to subscribers with a server id
    pub fn with_echo(self) -> Self {
        self.set_echo(true);
        self
    }

    pub fn set_echo(&self, echo: bool) {
        self.inner.broker().echo = echo;
    }

    /// Next id handed out by the echo, as `m<N>`
    pub fn set_next_message_id(&self, next: u64) {
        self.inner.broker().next_message_id = next;
    }

    /// Client id used when this client enters presence
    pub fn set_client_id(&self, client_id: impl Into<String>) {
        self.inner.broker().client_id = client_id.into();
    }

    /// Reject any `connect` whose token differs
    pub fn require_token(&self, token: impl Into<String>) {
        self.inner.broker().required_token = Some(token.into());
    }

    pub fn refuse_next_connect(&self) {
        self.inner.broker().refused_connects += 1;
    }

    pub fn reject_next_publish(&self, reason: impl Into<String>) {
        self.inner.broker().rejected_publishes.push_back(reason.into());
    }

    /// While set, publishes are accepted but never acknowledged
    pub fn hold_acks(&self, hold: bool) {
        self.inner.broker().hold_acks = hold;
    }

    /// Block history requests until [`LoopbackTransport::resume_history`]
    pub fn pause_history(&self) {
        self.inner.history_gate.send_replace(false);
    }

    pub fn resume_history(&self) {
        self.inner.history_gate.send_replace(true);
    }

    /// Push a server event to every subscriber of `channel`.
    ///
    /// Message events are also kept in the channel history. Returns the
    /// number of subscribers reached; nothing is delivered while offline.
    pub fn inject(&self, channel: &str, event: Value) -> usize {
        let connected = self.inner.state.get().is_connected();
        let mut broker = self.inner.broker();
        let entry = broker.channel(channel);
        entry.record_history(&event);
        if !connected {
            return 0;
        }
        entry.deliver(channel, &event)
    }

    /// Seed stored history for `channel`
    pub fn seed_history(&self, channel: &str, events: Vec<Value>) {
        let mut broker = self.inner.broker();
        let entry = broker.channel(channel);
        for event in events {
            entry.record_history(&event);
        }
    }

    /// Replace the presence set of `channel` and notify presence subscribers
    pub fn set_presence(&self, channel: &str, members: Vec<PresenceMember>) {
        let mut broker = self.inner.broker();
        let entry = broker.channel(channel);
        entry.presence = members;
        entry.broadcast_presence();
    }

    /// Events published to `channel`, in order
    pub fn published(&self, channel: &str) -> Vec<Value> {
        self.inner
            .broker()
            .published
            .iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .broker()
            .channels
            .get(channel)
            .map(|entry| entry.message_handlers.len() + entry.presence_handlers.len())
            .unwrap_or(0)
    }

    pub fn connect_count(&self) -> usize {
        self.inner.broker().connects
    }

    /// Simulate the link dropping; the state moves to `connecting`
    pub fn drop_link(&self) {
        self.inner.state.set(ConnectionState::Connecting);
    }

    pub fn restore_link(&self) {
        self.inner.state.set(ConnectionState::Connected);
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.inner.state.get().is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn unsubscriber(&self, channel: &str, handler: u64) -> impl FnOnce() + Send + 'static {
        let weak: Weak<LoopbackInner> = Arc::downgrade(&self.inner);
        let channel = channel.to_string();
        move || {
            if let Some(inner) = weak.upgrade() {
                let mut broker = inner.broker();
                if let Some(entry) = broker.channels.get_mut(&channel) {
                    entry.message_handlers.remove(&handler);
                    entry.presence_handlers.remove(&handler);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, credentials: &Credentials) -> TransportResult<()> {
        if self.inner.state.get().is_connected() {
            return Ok(());
        }
        let mut broker = self.inner.broker();
        if broker.refused_connects > 0 {
            broker.refused_connects -= 1;
            self.inner.state.set(ConnectionState::Disconnected);
            return Err(TransportError::connection("loopback refused the connection"));
        }
        if let Some(required) = &broker.required_token {
            if required != &credentials.token {
                self.inner.state.set(ConnectionState::Failed);
                return Err(TransportError::InvalidCredentials);
            }
        }
        broker.connects += 1;
        self.inner.state.set(ConnectionState::Connected);
        debug!(workspace_id = %credentials.workspace_id, "loopback connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.state.set(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    async fn subscribe_channel(&self, channel: &str) -> TransportResult<Subscription<InboundMessage>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = {
            let mut broker = self.inner.broker();
            let handler = broker.handler_id();
            broker.channel(channel).message_handlers.insert(handler, sender);
            handler
        };
        Ok(Subscription::new(
            channel,
            receiver,
            self.unsubscriber(channel, handler),
        ))
    }

    async fn publish(&self, channel: &str, event: Value) -> TransportResult<Ack> {
        let (ack, hold) = {
            let mut broker = self.inner.broker();
            if !self.inner.state.get().is_connected() {
                return Err(TransportError::publish(channel, "transport is not connected"));
            }
            if let Some(reason) = broker.rejected_publishes.pop_front() {
                return Err(TransportError::publish(channel, reason));
            }
            broker.published.push((channel.to_string(), event.clone()));

            let mut ack = Ack::default();
            if broker.echo {
                let (echoed, id) = broker.apply_echo(channel, event);
                ack.id = id;
                broker.channel(channel).deliver(channel, &echoed);
            }
            (ack, broker.hold_acks)
        };

        if hold {
            std::future::pending::<()>().await;
        }
        Ok(ack)
    }

    async fn get_presence(&self, channel: &str) -> TransportResult<Vec<PresenceMember>> {
        self.ensure_connected()?;
        Ok(self
            .inner
            .broker()
            .channels
            .get(channel)
            .map(|entry| entry.presence.clone())
            .unwrap_or_default())
    }

    async fn subscribe_presence(
        &self,
        channel: &str,
    ) -> TransportResult<Subscription<Vec<PresenceMember>>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = {
            let mut broker = self.inner.broker();
            let handler = broker.handler_id();
            broker.channel(channel).presence_handlers.insert(handler, sender);
            handler
        };
        Ok(Subscription::new(
            channel,
            receiver,
            self.unsubscriber(channel, handler),
        ))
    }

    async fn enter_presence(&self, channel: &str, data: Value) -> TransportResult<()> {
        self.ensure_connected()?;
        let mut broker = self.inner.broker();
        let client_id = broker.client_id.clone();
        let entry = broker.channel(channel);
        entry.presence.retain(|member| member.client_id != client_id);
        entry.presence.push(PresenceMember { client_id, data });
        entry.broadcast_presence();
        Ok(())
    }

    async fn history(
        &self,
        channel: &str,
        before: Option<i64>,
        limit: usize,
    ) -> TransportResult<HistoryPage> {
        let mut gate = self.inner.history_gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(TransportError::Closed);
        }
        self.ensure_connected()?;

        let broker = self.inner.broker();
        let Some(entry) = broker.channels.get(channel) else {
            return Ok(HistoryPage {
                messages: Vec::new(),
                has_more: false,
                total_count: Some(0),
            });
        };
        let eligible: Vec<&Value> = entry
            .history
            .iter()
            .filter(|event| match (before, timestamp_of(event)) {
                (Some(before), Some(timestamp)) => timestamp < before,
                _ => true,
            })
            .collect();
        let start = eligible.len().saturating_sub(limit);
        Ok(HistoryPage {
            messages: eligible[start..].iter().map(|event| (*event).clone()).collect(),
            has_more: start > 0,
            total_count: Some(entry.history.len() as u64),
        })
    }
}

fn event_type(event: &Value) -> Option<&str> {
    event.get("type").and_then(Value::as_str)
}

fn timestamp_of(event: &Value) -> Option<i64> {
    event.get("timestamp").and_then(Value::as_i64)
}

fn sort_by_timestamp(events: &mut [Value]) {
    events.sort_by_key(|event| timestamp_of(event).unwrap_or(i64::MIN));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str, timestamp: i64) -> Value {
        json!({"type": "message", "id": id, "conversationId": "c1", "content": id, "timestamp": timestamp})
    }

    async fn connected() -> LoopbackTransport {
        let transport = LoopbackTransport::new();
        transport
            .connect(&Credentials::new("acme", "token"))
            .await
            .expect("loopback connects");
        transport
    }

    #[tokio::test]
    async fn echo_assigns_server_ids_and_delivers() {
        let transport = connected().await.with_echo();
        transport.set_next_message_id(99);
        let mut subscription = transport.subscribe_channel("c1").await.unwrap();

        let ack = transport
            .publish("c1", json!({"type": "message", "id": "local-1", "clientGeneratedId": "local-1", "timestamp": 5}))
            .await
            .unwrap();
        assert_eq!(ack.id.as_deref(), Some("m99"));

        let inbound = subscription.recv().await.unwrap();
        assert_eq!(inbound.payload["id"], "m99");
        assert_eq!(inbound.payload["clientGeneratedId"], "local-1");
    }

    #[tokio::test]
    async fn history_pages_backwards_from_cursor() {
        let transport = connected().await;
        transport.seed_history("c1", (1..=5).map(|n| message(&format!("h{n}"), n * 10)).collect());

        let newest = transport.history("c1", None, 2).await.unwrap();
        let ids: Vec<_> = newest.messages.iter().map(|m| m["id"].clone()).collect();
        assert_eq!(ids, vec![json!("h4"), json!("h5")]);
        assert!(newest.has_more);

        let older = transport.history("c1", Some(40), 10).await.unwrap();
        assert_eq!(older.messages.len(), 3);
        assert!(!older.has_more);
        assert_eq!(older.total_count, Some(5));
    }

    #[tokio::test]
    async fn publish_fails_when_offline_or_rejected() {
        let transport = LoopbackTransport::new();
        let error = transport.publish("c1", json!({})).await.unwrap_err();
        assert!(matches!(error, TransportError::Publish { .. }));

        transport.connect(&Credentials::new("acme", "t")).await.unwrap();
        transport.reject_next_publish("quota exceeded");
        let error = transport.publish("c1", json!({})).await.unwrap_err();
        assert_eq!(error, TransportError::publish("c1", "quota exceeded"));
        assert!(transport.publish("c1", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_subscription_removes_handler() {
        let transport = connected().await;
        let subscription = transport.subscribe_channel("c1").await.unwrap();
        let presence = transport.subscribe_presence("c1").await.unwrap();
        assert_eq!(transport.subscriber_count("c1"), 2);
        drop(subscription);
        presence.unsubscribe();
        assert_eq!(transport.subscriber_count("c1"), 0);
    }

    #[tokio::test]
    async fn token_mismatch_fails_connection() {
        let transport = LoopbackTransport::new();
        transport.require_token("good");
        let error = transport
            .connect(&Credentials::new("acme", "bad"))
            .await
            .unwrap_err();
        assert_eq!(error, TransportError::InvalidCredentials);
        assert_eq!(transport.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn presence_snapshots_reach_subscribers() {
        let transport = connected().await;
        transport.set_client_id("agent-7");
        let mut presence = transport.subscribe_presence("c1").await.unwrap();
        transport
            .enter_presence("c1", json!({"name": "Agent Seven", "status": "online"}))
            .await
            .unwrap();
        let snapshot = presence.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].client_id, "agent-7");
        assert_eq!(transport.get_presence("c1").await.unwrap(), snapshot);
    }
}
