//! WebSocket transport with supervised reconnection.
//!
//! One connection carries every channel. A writer task drains the outbound
//! queue and sends heartbeats, a reader task dispatches inbound frames to
//! channel handlers or to the request that is waiting for them. When the
//! reader ends unexpectedly a supervisor retries with exponential backoff and
//! re-subscribes every live channel once the link is back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use supportdesk_config::TransportConfig;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backoff::{ReconnectDecision, ReconnectPolicy};
use crate::protocol::{ClientFrame, ServerFrame, UNAUTHORIZED};
use crate::state::StateCell;
use crate::{
    Ack, ConnectionState, Credentials, HistoryPage, InboundMessage, PresenceMember, Subscription,
    Transport, TransportError, TransportResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// A caller-initiated connection attempt that later callers can join
type ConnectAttempt = Shared<BoxFuture<'static, TransportResult<()>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ChannelHandlers {
    messages: HashMap<u64, mpsc::UnboundedSender<InboundMessage>>,
    presence: HashMap<u64, mpsc::UnboundedSender<Vec<PresenceMember>>>,
}

impl ChannelHandlers {
    fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.presence.is_empty()
    }
}

#[derive(Clone)]
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

#[derive(Debug)]
enum Reply {
    Ack(Option<String>),
    Nack(String),
    Subscribed,
    Presence(Vec<PresenceMember>),
    History(HistoryPage),
    Error { error: String, message: String },
}

struct WsInner {
    config: TransportConfig,
    policy: ReconnectPolicy,
    state: StateCell,
    channels: Mutex<HashMap<String, ChannelHandlers>>,
    link: Mutex<Option<Link>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    credentials: Mutex<Option<Credentials>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    connecting: Mutex<Option<ConnectAttempt>>,
    // Serialises connection attempts from `connect` and the supervisor.
    attempt_lock: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    next_handler: AtomicU64,
    next_generation: AtomicU64,
}

impl WsInner {
    async fn establish(inner: &Arc<WsInner>) -> TransportResult<()> {
        let credentials = lock(&inner.credentials)
            .clone()
            .ok_or_else(|| TransportError::connection("no credentials supplied"))?;
        let connect_timeout = inner.config.connect_timeout();

        let (mut socket, _response) = timeout(
            connect_timeout,
            tokio_tungstenite::connect_async(inner.config.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::connection("connection attempt timed out"))??;

        let auth = ClientFrame::Auth {
            workspace_id: credentials.workspace_id.clone(),
            token: credentials.token.clone(),
        };
        socket.send(Message::Text(serde_json::to_string(&auth)?)).await?;

        let connection_id = timeout(connect_timeout, await_hello(&mut socket))
            .await
            .map_err(|_| TransportError::connection("handshake timed out"))??;

        let (sink, stream) = socket.split();
        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        *lock(&inner.link) = Some(Link {
            generation,
            outbound: outbound.clone(),
        });

        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            inner.config.heartbeat_interval().max(MIN_HEARTBEAT),
        ));
        tokio::spawn(read_loop(Arc::downgrade(inner), stream, generation));

        let channels: Vec<String> = lock(&inner.channels).keys().cloned().collect();
        for channel in channels {
            let _ = outbound.send(ClientFrame::Subscribe {
                request_id: None,
                channel,
            });
        }

        inner.state.set(ConnectionState::Connected);
        info!(
            %connection_id,
            workspace_id = %credentials.workspace_id,
            "realtime link established"
        );
        Ok(())
    }

    async fn connect_once(inner: Arc<WsInner>, credentials: Credentials) -> TransportResult<()> {
        let _attempt = inner.attempt_lock.lock().await;
        if inner.state.get().is_connected() {
            return Ok(());
        }

        inner.closing.store(false, Ordering::SeqCst);
        *lock(&inner.credentials) = Some(credentials);
        if let Some(supervisor) = lock(&inner.supervisor).take() {
            supervisor.abort();
        }
        inner.state.set(ConnectionState::Connecting);

        match WsInner::establish(&inner).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let next = if error == TransportError::InvalidCredentials {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Disconnected
                };
                inner.state.set(next);
                warn!(%error, url = %inner.config.url, "failed to connect realtime link");
                Err(error)
            }
        }
    }

    fn link_lost(inner: &Arc<WsInner>, generation: u64) {
        {
            let mut link = lock(&inner.link);
            match link.as_ref() {
                Some(current) if current.generation == generation => *link = None,
                _ => return,
            }
        }
        inner.fail_pending();

        if inner.closing.load(Ordering::SeqCst) {
            return;
        }

        warn!("realtime link lost, reconnecting");
        inner.state.set(ConnectionState::Connecting);
        let handle = tokio::spawn(reconnect_loop(inner.clone()));
        if let Some(previous) = lock(&inner.supervisor).replace(handle) {
            previous.abort();
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing requests pending on a closed link");
        }
    }

    fn dispatch(&self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "dropping unreadable frame");
                return;
            }
        };

        match frame {
            ServerFrame::Event { channel, event } => self.deliver(&channel, event),
            ServerFrame::Presence {
                request_id: Some(request_id),
                members,
                ..
            } => self.resolve(&request_id, Reply::Presence(members)),
            ServerFrame::Presence {
                request_id: None,
                channel,
                members,
            } => self.broadcast_presence(&channel, members),
            ServerFrame::Ack { request_id, id } => self.resolve(&request_id, Reply::Ack(id)),
            ServerFrame::Nack {
                request_id,
                message,
            } => self.resolve(&request_id, Reply::Nack(message)),
            ServerFrame::Subscribed {
                request_id: Some(request_id),
                ..
            } => self.resolve(&request_id, Reply::Subscribed),
            ServerFrame::Subscribed { channel, .. } => debug!(%channel, "channel subscribed"),
            ServerFrame::History {
                request_id,
                messages,
                has_more,
                total_count,
            } => self.resolve(
                &request_id,
                Reply::History(HistoryPage {
                    messages,
                    has_more,
                    total_count,
                }),
            ),
            ServerFrame::Error {
                request_id: Some(request_id),
                error,
                message,
            } => self.resolve(&request_id, Reply::Error { error, message }),
            ServerFrame::Error { error, message, .. } => {
                warn!(%error, %message, "realtime backend reported an error")
            }
            ServerFrame::Hello { .. } | ServerFrame::Pong => trace!("keepalive frame"),
        }
    }

    fn deliver(&self, channel: &str, payload: Value) {
        let mut channels = lock(&self.channels);
        let Some(handlers) = channels.get_mut(channel) else {
            debug!(%channel, "event for a channel without subscribers");
            return;
        };
        handlers.messages.retain(|_, handler| {
            handler
                .send(InboundMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
        });
    }

    fn broadcast_presence(&self, channel: &str, members: Vec<PresenceMember>) {
        let mut channels = lock(&self.channels);
        if let Some(handlers) = channels.get_mut(channel) {
            handlers
                .presence
                .retain(|_, handler| handler.send(members.clone()).is_ok());
        }
    }

    fn resolve(&self, request_id: &str, reply: Reply) {
        match lock(&self.pending).remove(request_id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(%request_id, "reply for an unknown request"),
        }
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<ClientFrame>> {
        lock(&self.link).as_ref().map(|link| link.outbound.clone())
    }

    async fn request(&self, build: impl FnOnce(String) -> ClientFrame) -> TransportResult<Reply> {
        let outbound = self.outbound().ok_or(TransportError::NotConnected)?;
        let request_id = Uuid::new_v4().to_string();
        let (waiter, reply) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), waiter);

        if outbound.send(build(request_id.clone())).is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(TransportError::Closed);
        }

        match timeout(self.config.request_timeout(), reply).await {
            Ok(Ok(Reply::Error { error, .. })) if error == UNAUTHORIZED => {
                Err(TransportError::InvalidCredentials)
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(TransportError::RequestTimeout { request_id })
            }
        }
    }

    async fn subscribe_upstream(&self, channel: &str) -> TransportResult<()> {
        if !self.state.get().is_connected() {
            debug!(%channel, "subscription recorded, will be sent once connected");
            return Ok(());
        }
        match self
            .request(|request_id| ClientFrame::Subscribe {
                request_id: Some(request_id),
                channel: channel.to_string(),
            })
            .await?
        {
            Reply::Subscribed => Ok(()),
            Reply::Error { message, .. } | Reply::Nack(message) => {
                Err(TransportError::protocol(message))
            }
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> TransportError {
    TransportError::protocol(format!("unexpected reply {reply:?}"))
}

async fn await_hello(socket: &mut WsStream) -> TransportResult<String> {
    while let Some(message) = socket.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ServerFrame>(&text)? {
            ServerFrame::Hello { connection_id } => return Ok(connection_id),
            ServerFrame::Error { error, .. } if error == UNAUTHORIZED => {
                return Err(TransportError::InvalidCredentials)
            }
            ServerFrame::Error { message, .. } => return Err(TransportError::connection(message)),
            _ => continue,
        }
    }
    Err(TransportError::connection("connection closed during handshake"))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = ticker.tick() => Some(ClientFrame::Ping),
        };
        let Some(frame) = frame else {
            let _ = sink.send(Message::Close(None)).await;
            break;
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, frame = frame.name(), "failed to encode frame");
                continue;
            }
        };
        if let Err(error) = sink.send(Message::Text(text)).await {
            warn!(%error, "realtime link write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(weak: Weak<WsInner>, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(message) = stream.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match message {
            Ok(Message::Text(text)) => inner.dispatch(&text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "realtime link read failed");
                break;
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        WsInner::link_lost(&inner, generation);
    }
}

fn reconnect_loop(inner: Arc<WsInner>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let mut attempt = 0u32;
        loop {
            match inner.policy.decide(attempt) {
                ReconnectDecision::GiveUp => {
                    warn!(attempt, "reconnect attempts exhausted");
                    inner.state.set(ConnectionState::Failed);
                    return;
                }
                ReconnectDecision::Retry { delay, state } => {
                    inner.state.set(state);
                    debug!(attempt, ?delay, "scheduling reconnect");
                    tokio::time::sleep(delay).await;
                }
            }

            if inner.closing.load(Ordering::SeqCst) {
                return;
            }
            let _attempt = inner.attempt_lock.lock().await;
            if inner.state.get().is_connected() {
                return;
            }

            match WsInner::establish(&inner).await {
                Ok(()) => {
                    info!(attempt, "realtime link restored");
                    return;
                }
                Err(TransportError::InvalidCredentials) => {
                    warn!("credentials rejected while reconnecting");
                    inner.state.set(ConnectionState::Failed);
                    return;
                }
                Err(error) => {
                    warn!(attempt, %error, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    })
}

/// Realtime transport over a single WebSocket connection
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

impl WsTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            inner: Arc::new(WsInner {
                config: config.clone(),
                policy: ReconnectPolicy::from_config(&config.reconnect),
                state: StateCell::new(),
                channels: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                credentials: Mutex::new(None),
                supervisor: Mutex::new(None),
                connecting: Mutex::new(None),
                attempt_lock: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
                next_handler: AtomicU64::new(1),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    fn register<T>(
        &self,
        channel: &str,
        insert: impl FnOnce(&mut ChannelHandlers, u64, mpsc::UnboundedSender<T>),
    ) -> (Subscription<T>, bool)
    where
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = self.inner.next_handler.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut channels = lock(&self.inner.channels);
            let entry = channels.entry(channel.to_string()).or_default();
            let first = entry.is_empty();
            insert(entry, handler, sender);
            first
        };

        let weak = Arc::downgrade(&self.inner);
        let name = channel.to_string();
        let subscription = Subscription::new(channel, receiver, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let emptied = {
                let mut channels = lock(&inner.channels);
                let emptied = match channels.get_mut(&name) {
                    Some(entry) => {
                        entry.messages.remove(&handler);
                        entry.presence.remove(&handler);
                        entry.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    channels.remove(&name);
                }
                emptied
            };
            if emptied {
                if let Some(outbound) = inner.outbound() {
                    let _ = outbound.send(ClientFrame::Unsubscribe { channel: name });
                }
            }
        });
        (subscription, first)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, credentials: &Credentials) -> TransportResult<()> {
        let inner = &self.inner;
        let attempt = {
            let mut connecting = lock(&inner.connecting);
            match connecting.as_ref() {
                Some(attempt) => {
                    debug!("joining the connection attempt in flight");
                    attempt.clone()
                }
                None => {
                    if inner.state.get().is_connected() {
                        return Ok(());
                    }
                    let attempt = WsInner::connect_once(inner.clone(), credentials.clone())
                        .boxed()
                        .shared();
                    *connecting = Some(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;
        let mut connecting = lock(&inner.connecting);
        if connecting
            .as_ref()
            .map_or(false, |current| current.ptr_eq(&attempt))
        {
            *connecting = None;
        }
        result
    }

    async fn disconnect(&self) {
        let inner = &self.inner;
        inner.closing.store(true, Ordering::SeqCst);
        if let Some(supervisor) = lock(&inner.supervisor).take() {
            supervisor.abort();
        }
        let link = lock(&inner.link).take();
        drop(link);
        inner.fail_pending();
        if inner.state.set(ConnectionState::Disconnected) {
            info!("realtime link closed");
        }
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    async fn subscribe_channel(&self, channel: &str) -> TransportResult<Subscription<InboundMessage>> {
        let (subscription, first) = self.register(channel, |entry, handler, sender| {
            entry.messages.insert(handler, sender);
        });
        if first {
            self.inner.subscribe_upstream(channel).await?;
        }
        Ok(subscription)
    }

    async fn publish(&self, channel: &str, event: Value) -> TransportResult<Ack> {
        if !self.inner.state.get().is_connected() {
            return Err(TransportError::publish(channel, "transport is not connected"));
        }
        let reply = self
            .inner
            .request(|request_id| ClientFrame::Publish {
                request_id,
                channel: channel.to_string(),
                event,
            })
            .await
            .map_err(|error| TransportError::publish(channel, error.to_string()))?;

        match reply {
            Reply::Ack(id) => Ok(Ack { id }),
            Reply::Nack(message) | Reply::Error { message, .. } => {
                Err(TransportError::publish(channel, message))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn get_presence(&self, channel: &str) -> TransportResult<Vec<PresenceMember>> {
        match self
            .inner
            .request(|request_id| ClientFrame::PresenceGet {
                request_id,
                channel: channel.to_string(),
            })
            .await?
        {
            Reply::Presence(members) => Ok(members),
            Reply::Error { message, .. } => Err(TransportError::protocol(message)),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe_presence(
        &self,
        channel: &str,
    ) -> TransportResult<Subscription<Vec<PresenceMember>>> {
        let (subscription, first) = self.register(channel, |entry, handler, sender| {
            entry.presence.insert(handler, sender);
        });
        if first {
            self.inner.subscribe_upstream(channel).await?;
        }
        Ok(subscription)
    }

    async fn enter_presence(&self, channel: &str, data: Value) -> TransportResult<()> {
        match self
            .inner
            .request(|request_id| ClientFrame::PresenceEnter {
                request_id,
                channel: channel.to_string(),
                data,
            })
            .await?
        {
            Reply::Ack(_) => Ok(()),
            Reply::Nack(message) | Reply::Error { message, .. } => {
                Err(TransportError::protocol(message))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn history(
        &self,
        channel: &str,
        before: Option<i64>,
        limit: usize,
    ) -> TransportResult<HistoryPage> {
        match self
            .inner
            .request(|request_id| ClientFrame::History {
                request_id,
                channel: channel.to_string(),
                before,
                limit,
            })
            .await?
        {
            Reply::History(page) => Ok(page),
            Reply::Error { message, .. } | Reply::Nack(message) => {
                Err(TransportError::protocol(message))
            }
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for WsInner {
    fn drop(&mut self) {
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.abort();
        }
    }
}
