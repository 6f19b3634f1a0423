//! End-to-end checks for `WsTransport` against an in-process WebSocket server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use supportdesk_config::{ReconnectConfig, TransportConfig};
use supportdesk_transport::{ConnectionState, Credentials, Transport, TransportError, WsTransport};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

const GOOD_TOKEN: &str = "tok_valid";

#[derive(Clone)]
struct FakeBackend {
    addr: SocketAddr,
    subscribes: Arc<Mutex<Vec<String>>>,
    handshakes: Arc<AtomicUsize>,
    kill: broadcast::Sender<()>,
}

impl FakeBackend {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = broadcast::channel(4);
        let backend = Self {
            addr,
            subscribes: Arc::new(Mutex::new(Vec::new())),
            handshakes: Arc::new(AtomicUsize::new(0)),
            kill,
        };

        let server = backend.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = server.clone();
                tokio::spawn(async move { connection.serve(stream).await });
            }
        });
        backend
    }

    fn url(&self) -> String {
        format!("ws://{}/realtime", self.addr)
    }

    fn subscribe_count(&self, channel: &str) -> usize {
        self.subscribes
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.as_str() == channel)
            .count()
    }

    fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Drop every open connection without a close handshake
    fn drop_links(&self) {
        let _ = self.kill.send(());
    }

    async fn serve(self, stream: TcpStream) {
        let mut kill = self.kill.subscribe();
        let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };

        let Some(Ok(Message::Text(auth))) = socket.next().await else {
            return;
        };
        let auth: Value = serde_json::from_str(&auth).unwrap();
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if auth["token"] != GOOD_TOKEN {
            let _ = socket
                .send(text(json!({"type": "error", "error": "unauthorized", "message": "bad token"})))
                .await;
            return;
        }
        let _ = socket
            .send(text(json!({"type": "hello", "connection_id": "conn-1"})))
            .await;

        loop {
            tokio::select! {
                _ = kill.recv() => return,
                frame = socket.next() => {
                    let Some(Ok(Message::Text(frame))) = frame else { return };
                    let frame: Value = serde_json::from_str(&frame).unwrap();
                    for reply in self.respond(&frame) {
                        if socket.send(text(reply)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn respond(&self, frame: &Value) -> Vec<Value> {
        let request_id = frame["request_id"].clone();
        match frame["type"].as_str() {
            Some("subscribe") => {
                let channel = frame["channel"].as_str().unwrap_or_default().to_string();
                self.subscribes.lock().unwrap().push(channel.clone());
                vec![json!({"type": "subscribed", "request_id": request_id, "channel": channel})]
            }
            Some("publish") => {
                let channel = frame["channel"].clone();
                if frame["event"]["reject"] == true {
                    return vec![json!({"type": "nack", "request_id": request_id, "message": "rejected"})];
                }
                vec![
                    json!({"type": "ack", "request_id": request_id, "id": "srv-1"}),
                    json!({"type": "event", "channel": channel, "event": frame["event"]}),
                ]
            }
            Some("history") => vec![json!({
                "type": "history",
                "request_id": request_id,
                "messages": [{"type": "message", "id": "m1"}],
                "has_more": false,
                "total_count": 1
            })],
            Some("presence_get") if frame["channel"] == "restricted" => vec![json!({
                "type": "error",
                "request_id": request_id,
                "error": "unauthorized",
                "message": "token expired"
            })],
            Some("presence_get") => vec![json!({
                "type": "presence",
                "request_id": request_id,
                "channel": frame["channel"],
                "members": [{"clientId": "agent-7", "data": {"name": "Ana"}}]
            })],
            Some("ping") => vec![json!({"type": "pong"})],
            _ => Vec::new(),
        }
    }
}

fn text(value: Value) -> Message {
    Message::Text(value.to_string())
}

fn config(url: String) -> TransportConfig {
    TransportConfig {
        url,
        workspace_id: "acme".to_string(),
        connect_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        heartbeat_interval_ms: 60_000,
        reconnect: ReconnectConfig {
            base_delay_ms: 20,
            max_delay_ms: 100,
            jitter_ratio: 0.0,
            suspend_after_attempts: 50,
            max_attempts: None,
        },
    }
}

async fn wait_for_state(transport: &WsTransport, wanted: ConnectionState) {
    let mut states = transport.watch_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|state| *state == wanted))
        .await
        .expect("state transition timed out")
        .expect("state channel closed");
}

#[tokio::test]
async fn connect_reaches_connected() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));

    transport
        .connect(&Credentials::new("acme", GOOD_TOKEN))
        .await
        .unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);

    transport.disconnect().await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn rejected_token_fails_without_retrying() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));

    let error = transport
        .connect(&Credentials::new("acme", "tok_wrong"))
        .await
        .unwrap_err();
    assert_eq!(error, TransportError::InvalidCredentials);
    assert_eq!(transport.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));
    let credentials = Credentials::new("acme", "tok_wrong");

    let (first, second) = tokio::join!(
        transport.connect(&credentials),
        transport.connect(&credentials)
    );
    assert_eq!(first, Err(TransportError::InvalidCredentials));
    assert_eq!(second, Err(TransportError::InvalidCredentials));
    assert_eq!(backend.handshake_count(), 1);

    let good_a = Credentials::new("acme", GOOD_TOKEN);
    let good_b = Credentials::new("acme", GOOD_TOKEN);
    let (first, second) = tokio::join!(transport.connect(&good_a), transport.connect(&good_b));
    assert!(first.is_ok() && second.is_ok());
    assert_eq!(backend.handshake_count(), 2);
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn unauthorized_reply_maps_to_invalid_credentials() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));
    transport
        .connect(&Credentials::new("acme", GOOD_TOKEN))
        .await
        .unwrap();

    let error = transport.get_presence("restricted").await.unwrap_err();
    assert_eq!(error, TransportError::InvalidCredentials);
    assert!(transport.get_presence("support").await.is_ok());
}

#[tokio::test]
async fn unreachable_backend_reports_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = WsTransport::new(&config(format!("ws://{addr}/realtime")));
    let error = transport
        .connect(&Credentials::new("acme", GOOD_TOKEN))
        .await
        .unwrap_err();
    assert!(error.is_connection(), "unexpected error {error:?}");
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn publish_is_acknowledged_and_echoed_to_subscribers() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));
    transport
        .connect(&Credentials::new("acme", GOOD_TOKEN))
        .await
        .unwrap();

    let mut subscription = transport
        .subscribe_channel("acme:conversation:c1")
        .await
        .unwrap();
    assert_eq!(backend.subscribe_count("acme:conversation:c1"), 1);

    let ack = transport
        .publish("acme:conversation:c1", json!({"type": "typing", "isTyping": true}))
        .await
        .unwrap();
    assert_eq!(ack.id.as_deref(), Some("srv-1"));

    let inbound = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.channel, "acme:conversation:c1");
    assert_eq!(inbound.payload["isTyping"], true);
}

#[tokio::test]
async fn nack_surfaces_as_publish_error() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));
    transport
        .connect(&Credentials::new("acme", GOOD_TOKEN))
        .await
        .unwrap();

    let error = transport
        .publish("acme:conversation:c1", json!({"reject": true}))
        .await
        .unwrap_err();
    assert!(matches!(error, TransportError::Publish { .. }));
}

#[tokio::test]
async fn publish_while_disconnected_fails_fast() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));

    let error = transport
        .publish("acme:conversation:c1", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, TransportError::Publish { .. }));
}

#[tokio::test]
async fn history_and_presence_requests_are_correlated() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));
    transport
        .connect(&Credentials::new("acme", GOOD_TOKEN))
        .await
        .unwrap();

    let page = transport
        .history("acme:conversation:c1", None, 20)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.total_count, Some(1));
    assert!(!page.has_more);

    let members = transport.get_presence("acme:conversation:c1").await.unwrap();
    assert_eq!(members[0].client_id, "agent-7");
}

#[tokio::test]
async fn dropped_link_reconnects_and_resubscribes() {
    let backend = FakeBackend::start().await;
    let transport = WsTransport::new(&config(backend.url()));
    transport
        .connect(&Credentials::new("acme", GOOD_TOKEN))
        .await
        .unwrap();
    let _subscription = transport
        .subscribe_channel("acme:conversation:c1")
        .await
        .unwrap();

    backend.drop_links();

    let resubscribed = async {
        while backend.subscribe_count("acme:conversation:c1") < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), resubscribed)
        .await
        .expect("channel was not re-subscribed");
    wait_for_state(&transport, ConnectionState::Connected).await;

    transport.disconnect().await;
}
