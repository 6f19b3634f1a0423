use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of identifiers minted for optimistic entries
pub const LOCAL_ID_PREFIX: &str = "local-";

/// A message in a conversation log, either server confirmed or a local echo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server id, or a `local-` id while the message is an optimistic echo
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub sender: Sender,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Participants that have read the message, in the order they did so
    #[serde(default)]
    pub read_by: Vec<String>,
    /// Shown locally before the backend confirmed it
    #[serde(default)]
    pub local_echo: bool,
    /// Temporary id round-tripped through the backend to match the echo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_generated_id: Option<String>,
    /// Why the last send attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Who wrote a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub kind: SenderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Agent,
    System,
}

impl From<&str> for SenderKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "agent" => SenderKind::Agent,
            "system" => SenderKind::System,
            _ => SenderKind::User,
        }
    }
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Still waiting for the backend to accept or reject it
    pub fn is_pending(&self) -> bool {
        matches!(self, MessageStatus::Queued | MessageStatus::Sending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

/// File attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Content the caller wants to send, before it becomes an optimistic entry
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub content: String,
    pub sender: Sender,
    pub attachments: Vec<Attachment>,
    /// Defaults to now, never earlier than the newest loaded message
    pub timestamp: Option<DateTime<Utc>>,
}

impl Sender {
    pub fn new(id: impl Into<String>, kind: SenderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl MessageDraft {
    pub fn new(content: impl Into<String>, sender: Sender) -> Self {
        Self {
            content: content.into(),
            sender,
            attachments: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Validate draft data
    pub fn validate(&self) -> Result<(), String> {
        if self.content.trim().is_empty() && self.attachments.is_empty() {
            return Err("Message content cannot be empty".to_string());
        }

        if self.content.len() > 100_000 {
            return Err("Message content too long (max 100,000 characters)".to_string());
        }

        if self.sender.id.trim().is_empty() {
            return Err("Sender id cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Message {
    /// Check if this message is an unconfirmed local entry
    pub fn is_optimistic(&self) -> bool {
        self.local_echo
    }

    /// Check if the send can be retried
    pub fn is_retryable(&self) -> bool {
        self.local_echo && self.status == MessageStatus::Failed
    }

    pub fn is_read_by(&self, participant_id: &str) -> bool {
        self.read_by.iter().any(|reader| reader == participant_id)
    }

    /// Record a reader. Returns true when the reader was new.
    pub fn add_reader(&mut self, participant_id: &str) -> bool {
        if self.is_read_by(participant_id) {
            return false;
        }
        self.read_by.push(participant_id.to_string());
        if participant_id != self.sender.id
            && matches!(self.status, MessageStatus::Sent | MessageStatus::Delivered)
        {
            self.status = MessageStatus::Read;
        }
        true
    }
}
