use super::embeddings::EmbeddingProvider;
use super::index::{VectorEntry, VectorIndex};
use super::store::FragmentStore;
use super::vector;
use crate::config::MemoryConfig;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

/// Periodic housekeeping for the dual store: embedding-drift repair and
/// relational↔vector reconciliation. Both cycles run once immediately at
/// startup, then on a fixed interval, and are cancelled as a unit on
/// shutdown. Everything here is advisory — errors are logged, never
/// propagated, and ingestion/search never wait on it.
pub struct MaintenanceScheduler {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceScheduler {
    pub fn start(
        store: Arc<FragmentStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &MemoryConfig,
    ) -> Self {
        let token = CancellationToken::new();
        let period = Duration::from_secs(config.maintenance_interval_secs.max(1));
        let retention_days = config.retention_days;

        let drift = {
            let token = token.clone();
            let store = store.clone();
            let index = index.clone();
            tokio::spawn(async move {
                let mut ticker = interval(period);
                let mut previous_run = 0_i64;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        () = token.cancelled() => break,
                    }
                    let started = chrono::Utc::now().timestamp();
                    match repair_embedding_drift(&store, &index, &embedder, previous_run).await {
                        Ok(repaired) if repaired > 0 => {
                            tracing::info!(repaired, "embedding drift repair complete");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("embedding drift repair failed: {e:#}"),
                    }
                    previous_run = started;
                }
            })
        };

        let reconcile = {
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        () = token.cancelled() => break,
                    }
                    match reconcile_stores(&store, &index, retention_days).await {
                        Ok(report) if report.total_actions() > 0 => {
                            tracing::info!(
                                pruned = report.pruned,
                                mirrored = report.mirrored,
                                orphans_deleted = report.orphans_deleted,
                                "store reconciliation complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("store reconciliation failed: {e:#}"),
                    }
                }
            })
        };

        Self {
            token,
            handles: vec![drift, reconcile],
        }
    }

    /// Cooperative shutdown: cancel both cycles and await them.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("maintenance task join failed: {e}");
            }
        }
    }
}

/// Re-embed rows whose embedding no longer matches the current model/dims,
/// whose blob is the wrong length or all-zero, or whose `last_embedded_ts`
/// predates the previous pass. One row's failure never aborts the pass.
pub async fn repair_embedding_drift(
    store: &FragmentStore,
    index: &Arc<dyn VectorIndex>,
    embedder: &Arc<dyn EmbeddingProvider>,
    stale_before: i64,
) -> anyhow::Result<usize> {
    let dims = embedder.dimensions();
    if dims == 0 {
        return Ok(0);
    }

    let rows = store.rows_needing_embedding(embedder.model(), dims, stale_before)?;
    let mut repaired = 0_usize;
    for row in rows {
        let embedding = match embedder.embed_one(&row.content).await {
            Ok(v) if v.len() == dims && !vector::is_zero(&v) => v,
            Ok(v) => {
                tracing::debug!(rid = row.id, "drift repair got unusable vector (len {})", v.len());
                continue;
            }
            Err(e) => {
                tracing::debug!(rid = row.id, "drift repair embedding failed: {e:#}");
                continue;
            }
        };

        let now = chrono::Utc::now().timestamp();
        store.update_embedding(row.id, &embedding, embedder.model(), dims, now)?;
        let entry = VectorEntry {
            rid: row.id,
            server_id: row.server_id.clone(),
            channel_id: row.channel_id.clone(),
            embedding: vector::l2_normalize(&embedding),
        };
        if let Err(e) = index.upsert(entry).await {
            tracing::warn!(rid = row.id, "vector refresh after repair failed: {e:#}");
        }
        repaired += 1;
    }
    Ok(repaired)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    pub pruned: usize,
    pub mirrored: usize,
    pub orphans_deleted: usize,
}

impl ReconcileReport {
    pub fn total_actions(&self) -> usize {
        self.pruned + self.mirrored + self.orphans_deleted
    }
}

/// Make the vector index converge on the relational truth: mirror rows the
/// index is missing, delete entries with no relational counterpart, apply
/// age-based retention when configured, then ask for compaction.
pub async fn reconcile_stores(
    store: &FragmentStore,
    index: &Arc<dyn VectorIndex>,
    retention_days: Option<u32>,
) -> anyhow::Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    if let Some(days) = retention_days {
        let cutoff = chrono::Utc::now().timestamp() - i64::from(days) * 86_400;
        let pruned = store.prune_older_than(cutoff)?;
        report.pruned = pruned.len();
        if let Err(e) = index.delete_many(&pruned).await {
            tracing::warn!("retention delete from vector index failed: {e:#}");
        }
    }

    let relational = store.all_embeddings()?;
    let known = index.existing_ids().await?;

    let missing: Vec<VectorEntry> = relational
        .iter()
        .filter(|row| !vector::is_zero(&row.embedding) && !known.contains(&row.id))
        .map(|row| VectorEntry {
            rid: row.id,
            server_id: row.server_id.clone(),
            channel_id: row.channel_id.clone(),
            embedding: vector::l2_normalize(&row.embedding),
        })
        .collect();
    report.mirrored = missing.len();
    if !missing.is_empty() {
        index.upsert_many(missing).await?;
    }

    let relational_ids: std::collections::HashSet<i64> =
        relational.iter().map(|row| row.id).collect();
    let orphans: Vec<i64> = known
        .iter()
        .copied()
        .filter(|id| !relational_ids.contains(id))
        .collect();
    report.orphans_deleted = orphans.len();
    if !orphans.is_empty() {
        index.delete_many(&orphans).await?;
    }

    if let Err(e) = index.compact().await {
        tracing::debug!("vector index compaction skipped: {e:#}");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embeddings::DeterministicEmbedding;
    use crate::memory::index::SearchHit;
    use crate::memory::store::NewFragmentRow;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct FakeIndex {
        entries: Mutex<HashMap<i64, VectorEntry>>,
    }

    impl FakeIndex {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(HashMap::new()),
            })
        }

        fn seed(&self, rid: i64) {
            self.entries.lock().unwrap().insert(
                rid,
                VectorEntry {
                    rid,
                    server_id: "s1".into(),
                    channel_id: "c1".into(),
                    embedding: vec![1.0, 0.0, 0.0, 0.0],
                },
            );
        }
    }

    #[async_trait]
    impl VectorIndex for FakeIndex {
        fn name(&self) -> &str {
            "fake"
        }

        async fn upsert_many(&self, entries: Vec<VectorEntry>) -> anyhow::Result<()> {
            let mut map = self.entries.lock().unwrap();
            for e in entries {
                map.insert(e.rid, e);
            }
            Ok(())
        }

        async fn delete_many(&self, rids: &[i64]) -> anyhow::Result<()> {
            let mut map = self.entries.lock().unwrap();
            for rid in rids {
                map.remove(rid);
            }
            Ok(())
        }

        async fn existing_ids(&self) -> anyhow::Result<HashSet<i64>> {
            Ok(self.entries.lock().unwrap().keys().copied().collect())
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

    fn seeded_row(message_id: &str, embedding: Vec<f32>, embedded_ts: i64) -> NewFragmentRow {
        NewFragmentRow {
            server_id: "s1".into(),
            channel_id: "c1".into(),
            message_id: message_id.into(),
            author_id: "u1".into(),
            ts: chrono::Utc::now().timestamp(),
            content: format!("content of {message_id}"),
            kind: "text".into(),
            title: String::new(),
            url: None,
            media_id: format!("{message_id}:0:text"),
            embedding,
            emb_model: "deterministic_test".into(),
            emb_dim: 4,
            source_idx: 0,
            content_hash: format!("hash:{message_id}"),
            last_embedded_ts: embedded_ts,
        }
    }

    #[tokio::test]
    async fn reconcile_mirrors_missing_rows() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let index = FakeIndex::new();
        let dyn_index: Arc<dyn VectorIndex> = index.clone();

        store
            .upsert(&seeded_row("m1", vec![0.1, 0.2, 0.3, 0.4], 1))
            .unwrap();
        store
            .upsert(&seeded_row("m2", vec![0.4, 0.3, 0.2, 0.1], 1))
            .unwrap();

        let report = reconcile_stores(&store, &dyn_index, None).await.unwrap();
        assert_eq!(report.mirrored, 2);

        let rel_ids: HashSet<i64> = store
            .all_embeddings()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(dyn_index.existing_ids().await.unwrap(), rel_ids);
    }

    #[tokio::test]
    async fn reconcile_deletes_orphans() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let index = FakeIndex::new();
        index.seed(999);
        let dyn_index: Arc<dyn VectorIndex> = index.clone();

        let report = reconcile_stores(&store, &dyn_index, None).await.unwrap();
        assert_eq!(report.orphans_deleted, 1);
        assert!(dyn_index.existing_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_skips_zero_vectors() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let dyn_index: Arc<dyn VectorIndex> = FakeIndex::new();

        store.upsert(&seeded_row("m1", vec![0.0; 4], 0)).unwrap();
        let report = reconcile_stores(&store, &dyn_index, None).await.unwrap();
        assert_eq!(report.mirrored, 0);
        assert!(dyn_index.existing_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_prunes_both_stores() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let index = FakeIndex::new();
        let dyn_index: Arc<dyn VectorIndex> = index.clone();

        let mut old = seeded_row("m1", vec![0.1, 0.2, 0.3, 0.4], 1);
        old.ts = 1_000; // long past any retention window
        let rid = store.upsert(&old).unwrap();
        index.seed(rid);

        let report = reconcile_stores(&store, &dyn_index, Some(30)).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert_eq!(store.count().unwrap(), 0);
        assert!(dyn_index.existing_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drift_repair_reembeds_pending_rows() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let index = FakeIndex::new();
        let dyn_index: Arc<dyn VectorIndex> = index.clone();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(DeterministicEmbedding::new(4));

        let rid = store.upsert(&seeded_row("m1", vec![0.0; 4], 0)).unwrap();

        let repaired = repair_embedding_drift(&store, &dyn_index, &embedder, 0)
            .await
            .unwrap();
        assert_eq!(repaired, 1);

        let rows = store.rows_by_ids(&[rid]).unwrap();
        assert!(!vector::is_zero(&rows[0].embedding));
        assert!(rows[0].last_embedded_ts > 0);
        assert!(dyn_index.existing_ids().await.unwrap().contains(&rid));
    }

    #[tokio::test]
    async fn drift_repair_catches_model_change() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let dyn_index: Arc<dyn VectorIndex> = FakeIndex::new();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(DeterministicEmbedding::new(4));

        let mut row = seeded_row("m1", vec![0.1, 0.2, 0.3, 0.4], chrono::Utc::now().timestamp());
        row.emb_model = "old-model".into();
        store.upsert(&row).unwrap();

        let repaired = repair_embedding_drift(&store, &dyn_index, &embedder, 0)
            .await
            .unwrap();
        assert_eq!(repaired, 1);
        assert!(store
            .rows_needing_embedding("deterministic_test", 4, 0)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn drift_repair_catches_configured_model_switch_within_provider() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let dyn_index: Arc<dyn VectorIndex> = FakeIndex::new();

        // Same provider and dims, model "model-a" configured at write time.
        let writer: Arc<dyn EmbeddingProvider> =
            Arc::new(DeterministicEmbedding::with_model(4, "model-a"));
        let mut row = seeded_row("m1", vec![0.1, 0.2, 0.3, 0.4], chrono::Utc::now().timestamp());
        row.emb_model = writer.model().into();
        let rid = store.upsert(&row).unwrap();

        // Operator switches to "model-b" without touching provider or dims.
        let reader: Arc<dyn EmbeddingProvider> =
            Arc::new(DeterministicEmbedding::with_model(4, "model-b"));
        assert_eq!(reader.name(), writer.name());

        let repaired = repair_embedding_drift(&store, &dyn_index, &reader, 0)
            .await
            .unwrap();
        assert_eq!(repaired, 1);

        let rows = store.rows_by_ids(&[rid]).unwrap();
        assert_eq!(rows[0].emb_model, "model-b");
        assert!(store
            .rows_needing_embedding("model-b", 4, 0)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn scheduler_runs_immediately_and_shuts_down() {
        let store = Arc::new(FragmentStore::open_in_memory().unwrap());
        let index = FakeIndex::new();
        let dyn_index: Arc<dyn VectorIndex> = index.clone();
        index.seed(42); // orphan, reconciled away by the first pass

        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(DeterministicEmbedding::new(4));
        let config = MemoryConfig {
            maintenance_interval_secs: 3_600,
            ..MemoryConfig::default()
        };

        let scheduler =
            MaintenanceScheduler::start(store, dyn_index.clone(), embedder, &config);

        // First tick fires immediately; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(dyn_index.existing_ids().await.unwrap().is_empty());

        scheduler.shutdown().await;
    }
}
