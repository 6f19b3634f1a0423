//! # Supportdesk Transport
//!
//! Owns the physical realtime connection used by the conversation core.
//! Nothing outside this crate touches sockets or channel primitives.
//!
//! - [`Transport`]: the publish/subscribe contract the session manager consumes
//! - [`WsTransport`]: WebSocket implementation with supervised reconnection
//! - [`LoopbackTransport`]: in-process broker used by tests and offline mode
//!
//! Link failures never surface as errors in the middle of a stream. They
//! show up as [`ConnectionState`] transitions on [`Transport::watch_state`].

pub mod backoff;
pub mod error;
pub mod loopback;
pub mod protocol;
pub mod state;
pub mod websocket;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub use backoff::{ReconnectDecision, ReconnectPolicy};
pub use error::{TransportError, TransportResult};
pub use loopback::LoopbackTransport;
pub use state::ConnectionState;
pub use websocket::WsTransport;

/// Opaque credentials forwarded to the backend untouched
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub workspace_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(workspace_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("workspace_id", &self.workspace_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// An event received on a subscribed channel, in transport order
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: Value,
}

/// One member of a channel's presence set as reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub client_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Server acknowledgement of a publish
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ack {
    /// Identifier the backend assigned, when it reports one
    pub id: Option<String>,
}

/// Page of raw history events, oldest first
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<Value>,
    pub has_more: bool,
    #[serde(default)]
    pub total_count: Option<u64>,
}

/// Receiving end of a channel or presence subscription.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T> {
    channel: String,
    receiver: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(
        channel: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<T>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next item, or `None` once the transport dropped the channel
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Publish/subscribe contract over a realtime backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link. Resolves with the outcome of an attempt already in
    /// flight instead of starting a second one.
    async fn connect(&self, credentials: &Credentials) -> TransportResult<()>;

    /// Close the link and stop reconnecting
    async fn disconnect(&self);

    fn state(&self) -> ConnectionState;

    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Register for inbound events on `channel`. While disconnected the
    /// subscription is recorded and established on the next connection.
    async fn subscribe_channel(&self, channel: &str) -> TransportResult<Subscription<InboundMessage>>;

    /// Fails with [`TransportError::Publish`] when the link is down.
    async fn publish(&self, channel: &str, event: Value) -> TransportResult<Ack>;

    async fn get_presence(&self, channel: &str) -> TransportResult<Vec<PresenceMember>>;

    /// Receive full presence snapshots for `channel`
    async fn subscribe_presence(
        &self,
        channel: &str,
    ) -> TransportResult<Subscription<Vec<PresenceMember>>>;

    /// Announce this client in the presence set of `channel`
    async fn enter_presence(&self, channel: &str, data: Value) -> TransportResult<()>;

    /// Events older than `before` (epoch millis), oldest first
    async fn history(
        &self,
        channel: &str,
        before: Option<i64>,
        limit: usize,
    ) -> TransportResult<HistoryPage>;
}
