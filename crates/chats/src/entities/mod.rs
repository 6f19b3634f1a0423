//! Domain entities for conversations.
//!
//! Plain data with no knowledge of the transport or of how state is kept.

pub mod conversation;
pub mod message;
pub mod presence;

pub use conversation::{Conversation, ConversationKind, PaginationCursor, SessionPhase};
pub use message::{
    Attachment, Message, MessageDraft, MessageStatus, Sender, SenderKind, LOCAL_ID_PREFIX,
};
pub use presence::{PresenceEntry, PresenceStatus, TypingIndicator};
