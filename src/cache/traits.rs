use crate::fragment::MemoRecord;
use crate::message::InboundMessage;
use async_trait::async_trait;

/// Upstream classifier: turns a raw message into typed fragments.
///
/// Callers fail open — a formatter error is substituted with a degraded
/// text-only [`MemoRecord`], never propagated into the write path.
#[async_trait]
pub trait MessageFormatter: Send + Sync {
    async fn format(&self, message: &InboundMessage) -> anyhow::Result<MemoRecord>;
}

/// Platform history fetch for cold-start hydration. Returns at most `limit`
/// messages, newest first; the hydrator reverses them to chronological
/// order.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn recent_messages(
        &self,
        server_id: &str,
        channel_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<InboundMessage>>;
}

/// Per-user ingestion consent. The gate fails closed: a lookup error is
/// treated as "not opted in".
#[async_trait]
pub trait ConsentRegistry: Send + Sync {
    async fn is_opted_in(&self, user_id: &str) -> anyhow::Result<bool>;
}
