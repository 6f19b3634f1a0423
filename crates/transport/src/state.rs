//! Connection state shared between the transport and its readers.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of the realtime link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Repeated reconnection failures; retries continue in the background.
    Suspended,
    /// Terminal until `connect` is called again.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a reconnect loop may be running for this state
    pub fn is_recovering(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Suspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single writer, many readers.
#[derive(Debug)]
pub(crate) struct StateCell {
    sender: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionState::Disconnected);
        Self { sender }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.sender.borrow()
    }

    /// Returns true when the state actually changed
    pub(crate) fn set(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.sender.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            debug!(from = %previous, to = %next, "connection state changed");
        }
        changed
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.sender.subscribe()
    }
}
