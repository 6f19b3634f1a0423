//! Services coordinating the conversation core.
//!
//! The session manager owns the per-conversation state machines and is
//! the only component that talks to the transport. Presence and unread
//! accounting are derived views it keeps up to date.

pub mod presence_tracker;
pub mod session_manager;
pub mod unread;

pub use presence_tracker::{PresenceTracker, SweepReport};
pub use session_manager::{SessionManager, SessionSettings};
pub use unread::UnreadAggregator;
