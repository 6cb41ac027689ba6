use super::manager::CacheManager;
use super::traits::HistorySource;
use crate::error::{CacheError, Result};
use crate::fragment::MemoRecord;
use crate::message::InboundMessage;

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

impl CacheManager {
    /// Cold-start hydration. For each channel: load the memo snapshot,
    /// fetch recent history, format the messages the snapshot doesn't
    /// cover under bounded concurrency, and install everything into the
    /// cache strictly oldest-first even though formatting completes out of
    /// order. Ingestion happens afterwards in a separately-bounded pass so
    /// cache population never waits on embedding latency; the pass is
    /// awaited before this returns.
    pub async fn initialize(
        &self,
        history: &dyn HistorySource,
        channel_ids: &[String],
    ) -> Result<()> {
        for channel_id in channel_ids {
            self.hydrate_channel(history, channel_id).await?;
        }
        Ok(())
    }

    async fn hydrate_channel(&self, history: &dyn HistorySource, channel_id: &str) -> Result<()> {
        let (server_id, capacity, loaded_ids) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let state = inner
                .channels
                .get(channel_id)
                .ok_or_else(|| CacheError::UnknownChannel(channel_id.to_string()))?;
            let server_id = state.server_id.clone();
            let capacity = state.capacity();
            let loaded = inner.memos.load_channel(channel_id);
            (server_id, capacity, loaded)
        };

        let fetched = match history
            .recent_messages(&server_id, channel_id, capacity)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(channel_id, "history fetch failed, skipping channel: {e:#}");
                return Ok(());
            }
        };

        // Newest-first from the platform; the cache wants chronological.
        let mut messages = fetched;
        messages.reverse();
        if messages.is_empty() {
            return self.reconcile(channel_id, &loaded_ids).await;
        }

        let have_memo: Vec<bool> = {
            let guard = self.inner.lock().await;
            messages.iter().map(|m| guard.memos.has(&m.id)).collect()
        };

        // Position-indexed slots. `Some(None)` marks a snapshot hit (reuse
        // the stored memo); `Some(Some(_))` a freshly formatted one.
        let mut slots: Vec<Option<Option<MemoRecord>>> = have_memo
            .iter()
            .map(|&hit| if hit { Some(None) } else { None })
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.format_concurrency));
        let mut formatting: JoinSet<(usize, MemoRecord)> = JoinSet::new();
        for (idx, message) in messages.iter().enumerate() {
            if have_memo[idx] {
                continue;
            }
            let formatter = self.formatter.clone();
            let semaphore = semaphore.clone();
            let message = message.clone();
            formatting.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let memo = match formatter.format(&message).await {
                    Ok(memo) => memo,
                    Err(e) => {
                        tracing::warn!(
                            message_id = %message.id,
                            "hydration formatting failed, degrading: {e:#}"
                        );
                        MemoRecord::degraded(&message.author_name, &message.content)
                    }
                };
                (idx, memo)
            });
        }

        // Flush contiguous runs as they become ready, so the cache is
        // appended in chronological order regardless of completion order.
        let mut next_idx = 0;
        next_idx = self
            .flush_ready(channel_id, &messages, &mut slots, next_idx)
            .await?;
        while let Some(joined) = formatting.join_next().await {
            match joined {
                Ok((idx, memo)) => slots[idx] = Some(Some(memo)),
                Err(e) => tracing::warn!(channel_id, "formatting task failed: {e}"),
            }
            next_idx = self
                .flush_ready(channel_id, &messages, &mut slots, next_idx)
                .await?;
        }
        // A panicked task leaves a hole; degrade it rather than stall the
        // cursor. Slots below the cursor were already flushed.
        for (idx, slot) in slots.iter_mut().enumerate().skip(next_idx) {
            if slot.is_none() {
                let msg = &messages[idx];
                *slot = Some(Some(MemoRecord::degraded(&msg.author_name, &msg.content)));
            }
        }
        self.flush_ready(channel_id, &messages, &mut slots, next_idx)
            .await?;

        self.deferred_ingest(channel_id, &messages).await;
        self.reconcile(channel_id, &loaded_ids).await
    }

    async fn flush_ready(
        &self,
        channel_id: &str,
        messages: &[InboundMessage],
        slots: &mut [Option<Option<MemoRecord>>],
        mut next_idx: usize,
    ) -> Result<usize> {
        while next_idx < slots.len() {
            let Some(memo) = slots[next_idx].take() else {
                break;
            };
            self.add_message(channel_id, messages[next_idx].clone(), false, memo)
                .await?;
            next_idx += 1;
        }
        Ok(next_idx)
    }

    /// Second pass: gate + project every hydrated message, bounded by its
    /// own limiter and awaited to completion.
    async fn deferred_ingest(&self, channel_id: &str, messages: &[InboundMessage]) {
        let memos: Vec<Option<MemoRecord>> = {
            let guard = self.inner.lock().await;
            messages.iter().map(|m| guard.memos.get(&m.id).cloned()).collect()
        };

        let semaphore = Arc::new(Semaphore::new(self.ingest_concurrency));
        let mut ingesting: JoinSet<()> = JoinSet::new();
        for (message, memo) in messages.iter().zip(memos) {
            let Some(memo) = memo else { continue };
            let gate = self.gate.clone();
            let semaphore = semaphore.clone();
            let message = message.clone();
            ingesting.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let decision = gate.evaluate(&message, true, true).await;
                if decision.should_ingest {
                    gate.ingest_message(&message.provenance(), &memo).await;
                }
            });
        }

        while let Some(joined) = ingesting.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(channel_id, "hydration ingest task failed: {e}");
            }
        }
    }

    async fn reconcile(
        &self,
        channel_id: &str,
        loaded_ids: &std::collections::HashSet<String>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(state) = inner.channels.get(channel_id) {
            let current = state.ids_in_order();
            if let Err(e) = inner.memos.reconcile_channel(channel_id, &current, loaded_ids) {
                tracing::warn!(channel_id, "snapshot reconciliation failed: {e:#}");
            }
        }
        Ok(())
    }
}
