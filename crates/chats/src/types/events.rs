//! Wire events exchanged on conversation channels and the events the
//! session manager publishes to its observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use supportdesk_transport::ConnectionState;
use tokio::sync::broadcast;
use tracing::warn;

use crate::entities::{Attachment, Message, MessageStatus, PresenceStatus, SessionPhase, Sender};
use crate::types::errors::{ChatError, ChatResult};

/// Event published on a conversation channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Message(MessageEvent),
    ReadReceipt(ReadReceiptEvent),
    Typing(TypingEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub sender: Sender,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_generated_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptEvent {
    pub conversation_id: String,
    pub message_id: String,
    pub reader_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub conversation_id: String,
    pub participant_id: String,
    pub is_typing: bool,
}

/// `data` attached to a presence member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    /// Epoch millis
    #[serde(default)]
    pub last_active: Option<i64>,
}

impl WireEvent {
    /// Parse and validate an inbound payload
    pub fn decode(payload: &Value) -> ChatResult<Self> {
        let event = WireEvent::deserialize(payload)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_value(&self) -> ChatResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            WireEvent::Message(event) => &event.conversation_id,
            WireEvent::ReadReceipt(event) => &event.conversation_id,
            WireEvent::Typing(event) => &event.conversation_id,
        }
    }

    fn validate(&self) -> ChatResult<()> {
        if self.conversation_id().trim().is_empty() {
            return Err(ChatError::malformed("missing conversationId"));
        }
        match self {
            WireEvent::Message(event) => {
                if event.id.trim().is_empty() {
                    return Err(ChatError::malformed("message without id"));
                }
                if event.sender.id.trim().is_empty() {
                    return Err(ChatError::malformed("message without sender id"));
                }
            }
            WireEvent::ReadReceipt(event) => {
                if event.message_id.is_empty() || event.reader_id.is_empty() {
                    return Err(ChatError::malformed("read receipt without message or reader"));
                }
            }
            WireEvent::Typing(event) => {
                if event.participant_id.is_empty() {
                    return Err(ChatError::malformed("typing event without participant"));
                }
            }
        }
        Ok(())
    }
}

impl MessageEvent {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            content: message.content.clone(),
            sender: message.sender.clone(),
            timestamp: message.timestamp,
            client_generated_id: message.client_generated_id.clone(),
            attachments: message.attachments.clone(),
        }
    }

    /// The canonical, server confirmed form of the event
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            content: self.content,
            sender: self.sender,
            timestamp: self.timestamp,
            status: MessageStatus::Sent,
            attachments: self.attachments,
            read_by: Vec::new(),
            local_echo: false,
            client_generated_id: self.client_generated_id,
            failure_reason: None,
        }
    }
}

/// Change notification published by the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessagesChanged {
        conversation_id: String,
    },
    TypingChanged {
        conversation_id: String,
        participants: Vec<String>,
    },
    PresenceChanged {
        conversation_id: String,
    },
    UnreadCountChanged {
        conversation_id: String,
        unread: usize,
        total: usize,
    },
    ConversationStateChanged {
        conversation_id: String,
        phase: SessionPhase,
    },
    ConnectionStateChanged {
        state: ConnectionState,
    },
}

impl SessionEvent {
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            SessionEvent::MessagesChanged { conversation_id }
            | SessionEvent::TypingChanged { conversation_id, .. }
            | SessionEvent::PresenceChanged { conversation_id }
            | SessionEvent::UnreadCountChanged { conversation_id, .. }
            | SessionEvent::ConversationStateChanged { conversation_id, .. } => {
                Some(conversation_id)
            }
            SessionEvent::ConnectionStateChanged { .. } => None,
        }
    }
}

type EventFilter = Box<dyn Fn(&SessionEvent) -> bool + Send + Sync>;

/// Filtered view over the session event broadcast
pub struct EventStream {
    receiver: broadcast::Receiver<SessionEvent>,
    filter: EventFilter,
}

impl EventStream {
    pub fn new(receiver: broadcast::Receiver<SessionEvent>) -> Self {
        Self {
            receiver,
            filter: Box::new(|_| true),
        }
    }

    pub fn filtered(
        receiver: broadcast::Receiver<SessionEvent>,
        filter: impl Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            receiver,
            filter: Box::new(filter),
        }
    }

    /// Next matching event, or `None` once the manager is gone
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if (self.filter)(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event observer lagging behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event that is already queued
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if (self.filter)(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event observer lagging behind");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_message_event() {
        let event = WireEvent::decode(&json!({
            "type": "message",
            "id": "m1",
            "conversationId": "c1",
            "content": "Hi there",
            "sender": {"id": "user-3", "kind": "user"},
            "timestamp": 1_700_000_000_000i64,
            "clientGeneratedId": "local-abc"
        }))
        .unwrap();

        match event {
            WireEvent::Message(message) => {
                assert_eq!(message.client_generated_id.as_deref(), Some("local-abc"));
                let message = message.into_message();
                assert_eq!(message.status, MessageStatus::Sent);
                assert!(!message.local_echo);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        let missing_id = json!({
            "type": "message",
            "id": "",
            "conversationId": "c1",
            "content": "x",
            "sender": {"id": "u", "kind": "user"},
            "timestamp": 1
        });
        assert!(matches!(
            WireEvent::decode(&missing_id),
            Err(ChatError::MalformedMessage { .. })
        ));
        assert!(WireEvent::decode(&json!({"type": "unknown"})).is_err());
        assert!(WireEvent::decode(&json!("not an object")).is_err());
    }

    #[test]
    fn test_typing_and_receipt_wire_shape() {
        let typing = WireEvent::Typing(TypingEvent {
            conversation_id: "c1".to_string(),
            participant_id: "agent-1".to_string(),
            is_typing: true,
        });
        assert_eq!(
            typing.to_value().unwrap(),
            json!({"type": "typing", "conversationId": "c1", "participantId": "agent-1", "isTyping": true})
        );

        let receipt = WireEvent::decode(&json!({
            "type": "read_receipt",
            "conversationId": "c1",
            "messageId": "m3",
            "readerId": "user-3"
        }))
        .unwrap();
        assert_eq!(receipt.conversation_id(), "c1");
    }

    #[tokio::test]
    async fn test_event_stream_filters() {
        let (sender, receiver) = broadcast::channel(8);
        let mut stream = EventStream::filtered(receiver, |event| {
            event.conversation_id() == Some("c2")
        });

        sender
            .send(SessionEvent::MessagesChanged {
                conversation_id: "c1".to_string(),
            })
            .unwrap();
        sender
            .send(SessionEvent::PresenceChanged {
                conversation_id: "c2".to_string(),
            })
            .unwrap();

        assert_eq!(
            stream.recv().await,
            Some(SessionEvent::PresenceChanged {
                conversation_id: "c2".to_string()
            })
        );
        assert_eq!(stream.try_recv(), None);
    }
}
