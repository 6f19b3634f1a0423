//! State holders for the conversation core.
//!
//! The message store keeps the canonical log; history providers feed it
//! older pages.

pub mod history;
pub mod message_store;

pub use history::{HistoryBatch, HistoryProvider, TransportHistory};
pub use message_store::{LoadedPage, MessageStore, ReconcileOutcome};
