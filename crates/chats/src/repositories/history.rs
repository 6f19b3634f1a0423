//! Source of older message pages.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use supportdesk_transport::Transport;
use tracing::warn;

use crate::entities::Message;
use crate::types::{conversation_channel, ChatError, ChatResult, WireEvent};

/// One page of history, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryBatch {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub total_count: Option<u64>,
}

/// Where backfill pages come from
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Messages strictly older than `before`, or the newest page when `None`
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> ChatResult<HistoryBatch>;
}

/// Reads history over the realtime transport
pub struct TransportHistory {
    transport: Arc<dyn Transport>,
    workspace_id: String,
}

impl TransportHistory {
    pub fn new(transport: Arc<dyn Transport>, workspace_id: impl Into<String>) -> Self {
        Self {
            transport,
            workspace_id: workspace_id.into(),
        }
    }
}

#[async_trait]
impl HistoryProvider for TransportHistory {
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> ChatResult<HistoryBatch> {
        let channel = conversation_channel(&self.workspace_id, conversation_id);
        let page = self
            .transport
            .history(&channel, before.map(|at| at.timestamp_millis()), limit)
            .await
            .map_err(|err| ChatError::pagination(err.to_string()))?;

        let mut messages = Vec::with_capacity(page.messages.len());
        for payload in &page.messages {
            match WireEvent::decode(payload) {
                Ok(WireEvent::Message(event)) if event.conversation_id == conversation_id => {
                    messages.push(event.into_message())
                }
                Ok(_) => {}
                Err(error) => warn!(%channel, %error, "dropping malformed history entry"),
            }
        }

        Ok(HistoryBatch {
            messages,
            has_more: page.has_more,
            total_count: page.total_count,
        })
    }
}
