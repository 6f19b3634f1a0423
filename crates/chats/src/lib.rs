//! # Supportdesk Chats Crate
//!
//! Client-side conversation core for the Supportdesk agent console. It keeps
//! an ordered, deduplicated message log per conversation, reconciles
//! optimistic sends with their server echoes, tracks presence and typing,
//! and derives unread counts, all on top of a pluggable realtime
//! [`Transport`](supportdesk_transport::Transport).
//!
//! ## Architecture
//!
//! - **Entities**: Domain models (Conversation, Message, PresenceEntry, etc.)
//! - **Repositories**: The message store and history providers
//! - **Services**: Session manager, presence tracker, unread aggregator
//! - **Types**: Errors, wire events and session events
//! - **Utils**: Internal utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use supportdesk_chats::{SessionManager, SessionSettings};
//!
//! let manager = SessionManager::new(transport, SessionSettings::default(), me);
//! manager.connect(credentials).await?;
//! manager.open_conversation("c1").await?;
//! manager.send_message("c1", "Hello!", Vec::new()).await?;
//! ```

pub mod entities;
pub mod repositories;
pub mod services;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use entities::{
    Attachment, Conversation, ConversationKind, Message, MessageDraft, MessageStatus,
    PaginationCursor, PresenceEntry, PresenceStatus, SessionPhase, Sender, SenderKind,
    TypingIndicator,
};
pub use repositories::{HistoryBatch, HistoryProvider, MessageStore, ReconcileOutcome};
pub use services::{PresenceTracker, SessionManager, SessionSettings, UnreadAggregator};
pub use types::{ChatError, ChatResult, EventStream, SessionEvent, WireEvent};
