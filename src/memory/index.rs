use async_trait::async_trait;
use std::collections::HashSet;

/// One mirrored vector entry: the owning fragment row id, its search scope,
/// and the L2-normalized embedding.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub rid: i64,
    pub server_id: String,
    pub channel_id: String,
    pub embedding: Vec<f32>,
}

/// Ranked search hit. Score is inner product on normalized vectors, i.e.
/// cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub rid: i64,
    pub score: f32,
}

/// Vector-index mirror of the fragment store.
///
/// All operations are idempotent; the relational store is authoritative and
/// any divergence is repaired by the maintenance reconciliation pass, so
/// implementations may fail without endangering correctness.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Delete-then-insert by row id.
    async fn upsert(&self, entry: VectorEntry) -> anyhow::Result<()> {
        self.upsert_many(vec![entry]).await
    }

    async fn upsert_many(&self, entries: Vec<VectorEntry>) -> anyhow::Result<()>;

    async fn delete_many(&self, rids: &[i64]) -> anyhow::Result<()>;

    /// Every row id the index currently knows, scanned in batches.
    async fn existing_ids(&self) -> anyhow::Result<HashSet<i64>>;

    /// Top-`k` nearest entries within the `(server_id, channel_id)` scope.
    async fn search(
        &self,
        server_id: &str,
        channel_id: &str,
        query: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<SearchHit>>;

    /// Advisory index compaction.
    async fn compact(&self) -> anyhow::Result<()>;
}

/// Disabled-index fallback: accepts writes silently and finds nothing.
/// Semantic recall is best-effort context, so an assistant without a vector
/// backend still caches and persists normally.
pub struct NoopVectorIndex;

#[async_trait]
impl VectorIndex for NoopVectorIndex {
    fn name(&self) -> &str {
        "noop"
    }

    async fn upsert_many(&self, _entries: Vec<VectorEntry>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_many(&self, _rids: &[i64]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn existing_ids(&self) -> anyhow::Result<HashSet<i64>> {
        Ok(HashSet::new())
    }

    async fn search(
        &self,
        _server_id: &str,
        _channel_id: &str,
        _query: &[f32],
        _k: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    async fn compact(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
