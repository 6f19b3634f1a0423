//! Frames exchanged with the realtime backend over the WebSocket link.
//!
//! Every frame is a JSON object tagged by `type`. Requests that expect a
//! reply carry a `request_id` which the server echoes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PresenceMember;

/// Frames sent by the client
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection
    Auth { workspace_id: String, token: String },
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        channel: String,
    },
    Unsubscribe { channel: String },
    Publish {
        request_id: String,
        channel: String,
        event: Value,
    },
    PresenceGet { request_id: String, channel: String },
    PresenceEnter {
        request_id: String,
        channel: String,
        data: Value,
    },
    History {
        request_id: String,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<i64>,
        limit: usize,
    },
    Ping,
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Auth { .. } => "auth",
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::Publish { .. } => "publish",
            ClientFrame::PresenceGet { .. } => "presence_get",
            ClientFrame::PresenceEnter { .. } => "presence_enter",
            ClientFrame::History { .. } => "history",
            ClientFrame::Ping => "ping",
        }
    }
}

// Auth frames carry the opaque token, keep it out of logs.
impl std::fmt::Debug for ClientFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientFrame::Auth { workspace_id, .. } => f
                .debug_struct("Auth")
                .field("workspace_id", workspace_id)
                .field("token", &"<redacted>")
                .finish(),
            ClientFrame::Subscribe { request_id, channel } => f
                .debug_struct("Subscribe")
                .field("request_id", request_id)
                .field("channel", channel)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Authentication accepted
    Hello { connection_id: String },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
        message: String,
    },
    Subscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        channel: String,
    },
    Ack {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Nack { request_id: String, message: String },
    /// Inbound event on a subscribed channel
    Event { channel: String, event: Value },
    /// Presence snapshot, either pushed or in reply to `presence_get`
    Presence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        channel: String,
        members: Vec<PresenceMember>,
    },
    History {
        request_id: String,
        messages: Vec<Value>,
        has_more: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_count: Option<u64>,
    },
    Pong,
}

/// Error code the server uses to reject the auth frame
pub const UNAUTHORIZED: &str = "unauthorized";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_are_type_tagged() {
        let frame = ClientFrame::History {
            request_id: "r1".to_string(),
            channel: "acme:conversation:c1".to_string(),
            before: None,
            limit: 20,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "history", "request_id": "r1", "channel": "acme:conversation:c1", "limit": 20})
        );
    }

    #[test]
    fn server_frames_parse_optional_request_ids() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"subscribed","channel":"c"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Subscribed {
                request_id: None,
                channel: "c".to_string()
            }
        );

        let frame: ServerFrame = serde_json::from_value(json!({
            "type": "presence",
            "channel": "c",
            "members": [{"clientId": "agent-1", "data": {"name": "Ana"}}]
        }))
        .unwrap();
        match frame {
            ServerFrame::Presence { members, .. } => assert_eq!(members[0].client_id, "agent-1"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn auth_debug_redacts_token() {
        let frame = ClientFrame::Auth {
            workspace_id: "acme".to_string(),
            token: "secret-token".to_string(),
        };
        let rendered = format!("{frame:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("acme"));
    }
}
