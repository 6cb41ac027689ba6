use super::embeddings::EmbeddingProvider;
use super::index::{VectorEntry, VectorIndex};
use super::store::{FragmentStore, NewFragmentRow};
use super::vector;
use crate::fragment::{stable_media_id, MemoRecord};
use crate::message::Provenance;

use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Turns a formatted memo into persisted fragment rows plus mirrored vector
/// entries.
///
/// All embeddings for one message are computed concurrently; an embedding
/// failure degrades that fragment to a zero vector with
/// `last_embedded_ts = 0` (repairable by maintenance) and never aborts its
/// siblings. Vector-index failures are logged and left for reconciliation —
/// the relational store is authoritative.
pub struct FragmentProjector {
    store: Arc<FragmentStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
}

/// Dedup hash over the fragment's type tag and embeddable text.
pub fn content_hash(kind: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

impl FragmentProjector {
    pub fn new(
        store: Arc<FragmentStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
        }
    }

    pub fn store(&self) -> &Arc<FragmentStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Project one memo. Returns the number of rows upserted.
    pub async fn project(&self, provenance: &Provenance, memo: &MemoRecord) -> anyhow::Result<usize> {
        let dims = self.embedder.dimensions();
        let model = self.embedder.model().to_string();

        let candidates: Vec<(usize, &crate::fragment::Fragment, String)> = memo
            .fragments
            .iter()
            .enumerate()
            .filter_map(|(idx, fragment)| {
                let text = fragment.content_text();
                (!text.is_empty()).then_some((idx, fragment, text))
            })
            .collect();

        if candidates.is_empty() {
            return Ok(0);
        }

        let embeddings = join_all(
            candidates
                .iter()
                .map(|(_, _, text)| self.embedder.embed_one(text)),
        )
        .await;

        let now = chrono::Utc::now().timestamp();
        let mut written = 0_usize;
        for ((source_idx, fragment, text), embedded) in candidates.into_iter().zip(embeddings) {
            let (embedding, embedded_ts) = match embedded {
                Ok(v) if v.len() == dims && !vector::is_zero(&v) => (v, now),
                Ok(v) => {
                    tracing::warn!(
                        message_id = %provenance.message_id,
                        source_idx,
                        "embedder returned unusable vector (len {}): marking pending",
                        v.len()
                    );
                    (vec![0.0; dims], 0)
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %provenance.message_id,
                        source_idx,
                        "embedding failed: {e:#}; marking pending"
                    );
                    (vec![0.0; dims], 0)
                }
            };

            let row = NewFragmentRow {
                server_id: provenance.server_id.clone(),
                channel_id: provenance.channel_id.clone(),
                message_id: provenance.message_id.clone(),
                author_id: provenance.author_id.clone(),
                ts: provenance.ts,
                content: text.clone(),
                kind: fragment.kind().to_string(),
                title: fragment.title().to_string(),
                url: fragment.url().map(str::to_string),
                media_id: stable_media_id(fragment, provenance, source_idx),
                embedding: embedding.clone(),
                emb_model: model.clone(),
                emb_dim: dims,
                source_idx,
                content_hash: content_hash(fragment.kind(), &text),
                last_embedded_ts: embedded_ts,
            };

            let rid = self.store.upsert(&row)?;
            written += 1;

            if !vector::is_zero(&embedding) {
                let entry = VectorEntry {
                    rid,
                    server_id: provenance.server_id.clone(),
                    channel_id: provenance.channel_id.clone(),
                    embedding: vector::l2_normalize(&embedding),
                };
                if let Err(e) = self.index.upsert(entry).await {
                    tracing::warn!(
                        rid,
                        "vector mirror upsert failed, leaving for reconciliation: {e:#}"
                    );
                }
            }
        }

        Ok(written)
    }
}
