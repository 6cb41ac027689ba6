use super::gate::IngestionGate;
use super::memo::MemoStore;
use super::state::ChannelCacheState;
use super::traits::{ConsentRegistry, MessageFormatter};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::fragment::{MemoRecord, RenderMode};
use crate::memory::store::FragmentRow;
use crate::memory::{vector, FragmentProjector};
use crate::message::InboundMessage;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(super) struct CacheInner {
    pub(super) channels: HashMap<String, ChannelCacheState>,
    pub(super) memos: MemoStore,
}

/// Orchestrates the short-term cache write path and read views, and fronts
/// the long-term store for recall and purge.
///
/// Channels are fixed at construction; any other channel id is
/// `UnknownChannel`. The inner state sits behind one async mutex; every
/// collaborator call (formatter, embedder, vector index) happens off the
/// lock.
pub struct CacheManager {
    pub(super) inner: Mutex<CacheInner>,
    pub(super) formatter: Arc<dyn MessageFormatter>,
    pub(super) gate: Arc<IngestionGate>,
    projector: Arc<FragmentProjector>,
    pub(super) format_concurrency: usize,
    pub(super) ingest_concurrency: usize,
}

impl CacheManager {
    pub fn new(
        config: &Config,
        formatter: Arc<dyn MessageFormatter>,
        consent: Arc<dyn ConsentRegistry>,
        projector: Arc<FragmentProjector>,
    ) -> Result<Self> {
        let capacity = config.cache.capacity.max(1);
        let channels: HashMap<String, ChannelCacheState> = config
            .cache
            .channels
            .iter()
            .map(|ch| {
                (
                    ch.channel_id.clone(),
                    ChannelCacheState::new(ch.server_id.clone(), ch.channel_id.clone(), capacity),
                )
            })
            .collect();

        let memos = MemoStore::new(config.data_dir.join("memos"), capacity)?;
        let gate = Arc::new(IngestionGate::new(
            consent,
            projector.clone(),
            config.cache.self_user_id.clone(),
        ));

        Ok(Self {
            inner: Mutex::new(CacheInner { channels, memos }),
            formatter,
            gate,
            projector,
            format_concurrency: config.cache.format_concurrency.max(1),
            ingest_concurrency: config.cache.ingest_concurrency.max(1),
        })
    }

    /// Write path. Appends to the ring (retiring the evicted memo in
    /// lockstep), resolves the memo record, runs the ingestion gate, and
    /// persists the snapshot when membership or memo content changed.
    /// Ingestion failures never surface here; only an unknown channel does.
    pub async fn add_message(
        &self,
        channel_id: &str,
        message: InboundMessage,
        ingest: bool,
        precomputed_memo: Option<MemoRecord>,
    ) -> Result<()> {
        let probe = message.clone();
        let provenance = message.provenance();

        let (memo_present, evicted) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let state = inner
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| CacheError::UnknownChannel(channel_id.to_string()))?;

            let memo_present = inner.memos.has(&message.id);
            let evicted = state.append(message);
            if let Some(old_id) = &evicted {
                inner.memos.delete(old_id);
            }
            (memo_present, evicted)
        };

        let decision = self.gate.evaluate(&probe, ingest, memo_present).await;

        let supplied = precomputed_memo.is_some();
        let newly_created = !supplied && !memo_present;
        let memo = if let Some(memo) = precomputed_memo {
            memo
        } else {
            let stored = if memo_present {
                let guard = self.inner.lock().await;
                guard.memos.get(&probe.id).cloned()
            } else {
                None
            };
            match stored {
                Some(memo) => memo,
                None => match self.formatter.format(&probe).await {
                    Ok(memo) => memo,
                    Err(e) => {
                        tracing::warn!(message_id = %probe.id, "formatter failed, degrading: {e:#}");
                        MemoRecord::degraded(&probe.author_name, &probe.content)
                    }
                },
            }
        };

        if supplied || newly_created {
            let mut guard = self.inner.lock().await;
            guard.memos.set(probe.id.clone(), memo.clone());
        }

        if decision.should_ingest && !decision.relational_present {
            self.gate.ingest_message(&provenance, &memo).await;
        }

        if newly_created || supplied || evicted.is_some() {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if let Some(state) = inner.channels.get(channel_id) {
                let ids = state.ids_in_order();
                if let Err(e) = inner.memos.save_channel_snapshot(channel_id, &ids) {
                    tracing::warn!(channel_id, "snapshot write failed: {e:#}");
                }
            }
        }

        Ok(())
    }

    /// Raw messages in the buffer, oldest first.
    pub async fn list_raw(
        &self,
        channel_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<InboundMessage>> {
        let guard = self.inner.lock().await;
        let state = guard
            .channels
            .get(channel_id)
            .ok_or_else(|| CacheError::UnknownChannel(channel_id.to_string()))?;
        Ok(state.iter(limit).cloned().collect())
    }

    /// Memos rendered in the requested mode, oldest first. Rendering is
    /// done per call; nothing pre-rendered is stored.
    pub async fn list_formatted(
        &self,
        channel_id: &str,
        mode: RenderMode,
        limit: Option<usize>,
    ) -> Result<Vec<serde_json::Value>> {
        let guard = self.inner.lock().await;
        let state = guard
            .channels
            .get(channel_id)
            .ok_or_else(|| CacheError::UnknownChannel(channel_id.to_string()))?;

        Ok(state
            .iter(limit)
            .map(|msg| render_message(&guard.memos, msg, mode))
            .collect())
    }

    pub async fn get_by_id(
        &self,
        channel_id: &str,
        message_id: &str,
        mode: RenderMode,
    ) -> Result<serde_json::Value> {
        let guard = self.inner.lock().await;
        let state = guard
            .channels
            .get(channel_id)
            .ok_or_else(|| CacheError::UnknownChannel(channel_id.to_string()))?;
        let msg = state
            .get(message_id)
            .ok_or_else(|| CacheError::UnknownMessage {
                channel_id: channel_id.to_string(),
                message_id: message_id.to_string(),
            })?;
        Ok(render_message(&guard.memos, msg, mode))
    }

    /// Semantic recall scoped to one channel. Any embedding or index
    /// failure degrades to empty results; only a relational read error
    /// surfaces.
    pub async fn recall(
        &self,
        server_id: &str,
        channel_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<FragmentRow>> {
        let embedder = self.projector.embedder();
        if embedder.dimensions() == 0 || k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = match embedder.embed_one(query).await {
            Ok(v) if !vector::is_zero(&v) => vector::l2_normalize(&v),
            Ok(_) => return Ok(Vec::new()),
            Err(e) => {
                tracing::warn!("recall embedding failed: {e:#}");
                return Ok(Vec::new());
            }
        };

        let hits = match self
            .projector
            .index()
            .search(server_id, channel_id, &query_vec, k)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("vector search failed: {e:#}");
                return Ok(Vec::new());
            }
        };

        let ids: Vec<i64> = hits.iter().map(|h| h.rid).collect();
        let rows = self.projector.store().rows_by_ids(&ids)?;
        let mut by_id: HashMap<i64, FragmentRow> =
            rows.into_iter().map(|r| (r.id, r)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Consent withdrawal: delete every persisted fragment by this author
    /// and retire the mirrored vector entries. Returns how many rows went.
    pub async fn purge_author(&self, author_id: &str) -> Result<usize> {
        let ids = self.projector.store().purge_author(author_id)?;
        if !ids.is_empty() {
            if let Err(e) = self.projector.index().delete_many(&ids).await {
                tracing::warn!(author_id, "vector purge failed, reconciliation will retry: {e:#}");
            }
        }
        tracing::info!(author_id, rows = ids.len(), "author purged");
        Ok(ids.len())
    }
}

fn render_message(
    memos: &MemoStore,
    message: &InboundMessage,
    mode: RenderMode,
) -> serde_json::Value {
    match memos.get(&message.id) {
        Some(memo) => memo.render(&message.id, mode),
        None => {
            MemoRecord::degraded(&message.author_name, &message.content).render(&message.id, mode)
        }
    }
}
