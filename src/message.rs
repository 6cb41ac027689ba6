use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw inbound platform message, as delivered by the chat gateway.
///
/// Held only by the per-channel ring buffer; evicted copies are dropped.
/// Everything downstream of the cache works with the formatted
/// [`MemoRecord`](crate::fragment::MemoRecord) instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub server_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            server_id: self.server_id.clone(),
            channel_id: self.channel_id.clone(),
            message_id: self.id.clone(),
            author_id: self.author_id.clone(),
            ts: self.timestamp.timestamp(),
        }
    }
}

/// Where a fragment came from. Carried alongside each persisted row and fed
/// into the stable media identity when nothing better exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub server_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    /// Unix seconds.
    pub ts: i64,
}
