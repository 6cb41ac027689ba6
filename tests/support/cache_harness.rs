#![allow(dead_code, clippy::cast_precision_loss)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use mnemos::cache::{ConsentRegistry, HistorySource, MessageFormatter};
use mnemos::config::{ChannelConfig, Config};
use mnemos::fragment::{Fragment, MemoRecord};
use mnemos::memory::embeddings::EmbeddingProvider;
use mnemos::memory::{
    FragmentProjector, FragmentStore, SearchHit, VectorEntry, VectorIndex,
};
use mnemos::message::InboundMessage;
use mnemos::CacheManager;

pub const EMBEDDING_DIMS: usize = 8;
pub const EMBEDDING_SEED: u64 = 0x5EED_BA5E;

pub const SERVER: &str = "srv-1";
pub const CHANNEL: &str = "chan-1";
pub const SELF_ID: &str = "bot-self";

// ── Deterministic embedder ───────────────────────────────────────

pub struct DeterministicEmbeddingProvider {
    dims: usize,
    seed: u64,
}

impl DeterministicEmbeddingProvider {
    pub const fn new(dims: usize, seed: u64) -> Self {
        Self { dims, seed }
    }

    fn fnv1a64(seed: u64, bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ seed;
        for &byte in bytes {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }

    fn splitmix64(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = x;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn unit_f32(x: u64) -> f32 {
        const U24_MAX: f32 = ((1u32 << 24) - 1) as f32;
        let top_u24: u32 = (x >> 40) as u32;
        (top_u24 as f32 / U24_MAX) * 2.0 - 1.0
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicEmbeddingProvider {
    fn name(&self) -> &str {
        "cache-test-harness"
    }

    fn model(&self) -> &str {
        "cache-test-model"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let base = Self::fnv1a64(self.seed, text.as_bytes());
            let mut vector = Vec::with_capacity(self.dims);
            for i in 0..self.dims {
                vector.push(Self::unit_f32(Self::splitmix64(base ^ (i as u64))));
            }
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

/// Embedder that always errors, for degraded-path tests.
pub struct FailingEmbeddingProvider {
    dims: usize,
}

impl FailingEmbeddingProvider {
    pub const fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for FailingEmbeddingProvider {
    fn name(&self) -> &str {
        "failing-test-harness"
    }

    fn model(&self) -> &str {
        "failing-test-model"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, _texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding backend offline")
    }
}

// ── In-memory vector index ───────────────────────────────────────

/// Exact cosine search over a hash map, enough to exercise the mirror
/// contract without LanceDB.
pub struct InMemoryVectorIndex {
    entries: Mutex<HashMap<i64, VectorEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn ids(&self) -> HashSet<i64> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    pub fn insert_raw(&self, entry: VectorEntry) {
        self.entries.lock().unwrap().insert(entry.rid, entry);
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn upsert_many(&self, entries: Vec<VectorEntry>) -> anyhow::Result<()> {
        let mut map = self.entries.lock().unwrap();
        for entry in entries {
            map.insert(entry.rid, entry);
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
        Ok(self.ids())
    }

    async fn search(
        &self,
        server_id: &str,
        channel_id: &str,
        query: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let map = self.entries.lock().unwrap();
        let mut hits: Vec<SearchHit> = map
            .values()
            .filter(|e| e.server_id == server_id && e.channel_id == channel_id)
            .map(|e| SearchHit {
                rid: e.rid,
                score: mnemos::memory::vector::cosine_similarity(&e.embedding, query),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn compact(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Formatter ────────────────────────────────────────────────────

/// Formatter with per-message scripted delays, so hydration tests can force
/// completion order to differ from chronological order. Counts calls per
/// message id.
pub struct ScriptedFormatter {
    delays_ms: Mutex<HashMap<String, u64>>,
    calls: Mutex<HashMap<String, usize>>,
    total_calls: AtomicUsize,
    fail_ids: Mutex<HashSet<String>>,
}

impl ScriptedFormatter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delays_ms: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            total_calls: AtomicUsize::new(0),
            fail_ids: Mutex::new(HashSet::new()),
        })
    }

    pub fn delay(&self, message_id: &str, ms: u64) {
        self.delays_ms
            .lock()
            .unwrap()
            .insert(message_id.to_string(), ms);
    }

    pub fn fail_for(&self, message_id: &str) {
        self.fail_ids.lock().unwrap().insert(message_id.to_string());
    }

    pub fn calls_for(&self, message_id: &str) -> usize {
        self.calls.lock().unwrap().get(message_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageFormatter for ScriptedFormatter {
    async fn format(&self, message: &InboundMessage) -> anyhow::Result<MemoRecord> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(message.id.clone())
            .or_insert(0) += 1;

        let delay = self.delays_ms.lock().unwrap().get(&message.id).copied();
        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.fail_ids.lock().unwrap().contains(&message.id) {
            anyhow::bail!("classifier unavailable for {}", message.id);
        }

        Ok(MemoRecord::new(
            message.author_name.clone(),
            vec![Fragment::text(message.content.clone())],
        ))
    }
}

// ── Consent ──────────────────────────────────────────────────────

pub struct TestConsentRegistry {
    opted_in: Mutex<HashSet<String>>,
    failing: Mutex<bool>,
}

impl TestConsentRegistry {
    pub fn allowing(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            opted_in: Mutex::new(ids.iter().map(ToString::to_string).collect()),
            failing: Mutex::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl ConsentRegistry for TestConsentRegistry {
    async fn is_opted_in(&self, user_id: &str) -> anyhow::Result<bool> {
        if *self.failing.lock().unwrap() {
            anyhow::bail!("consent registry unreachable");
        }
        Ok(self.opted_in.lock().unwrap().contains(user_id))
    }
}

// ── History ──────────────────────────────────────────────────────

/// Fixed per-channel history, newest-first like the platform returns it.
pub struct StaticHistory {
    newest_first: Mutex<HashMap<String, Vec<InboundMessage>>>,
}

impl StaticHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            newest_first: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_channel(&self, channel_id: &str, newest_first: Vec<InboundMessage>) {
        self.newest_first
            .lock()
            .unwrap()
            .insert(channel_id.to_string(), newest_first);
    }
}

#[async_trait]
impl HistorySource for StaticHistory {
    async fn recent_messages(
        &self,
        _server_id: &str,
        channel_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<InboundMessage>> {
        let map = self.newest_first.lock().unwrap();
        let mut out = map.get(channel_id).cloned().unwrap_or_default();
        out.truncate(limit);
        Ok(out)
    }
}

// ── Fixtures ─────────────────────────────────────────────────────

pub fn message(id: &str, author_id: &str, content: &str, ts: i64) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        server_id: SERVER.to_string(),
        channel_id: CHANNEL.to_string(),
        author_id: author_id.to_string(),
        author_name: format!("name-of-{author_id}"),
        content: content.to_string(),
        timestamp: Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now),
    }
}

pub fn test_config(data_dir: &std::path::Path, capacity: usize) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.to_path_buf();
    config.cache.capacity = capacity;
    config.cache.self_user_id = SELF_ID.to_string();
    config.cache.channels = vec![ChannelConfig {
        server_id: SERVER.to_string(),
        channel_id: CHANNEL.to_string(),
    }];
    config
}

pub struct Harness {
    pub manager: CacheManager,
    pub formatter: Arc<ScriptedFormatter>,
    pub consent: Arc<TestConsentRegistry>,
    pub index: Arc<InMemoryVectorIndex>,
    pub store: Arc<FragmentStore>,
    pub tmp: TempDir,
}

pub fn build_harness(capacity: usize, opted_in: &[&str]) -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let config = test_config(tmp.path(), capacity);

    let formatter = ScriptedFormatter::new();
    let consent = TestConsentRegistry::allowing(opted_in);
    let index = InMemoryVectorIndex::new();
    let store = Arc::new(
        FragmentStore::new(&tmp.path().join("fragments.db")).expect("fragment store"),
    );
    let projector = Arc::new(FragmentProjector::new(
        store.clone(),
        index.clone(),
        Arc::new(DeterministicEmbeddingProvider::new(
            EMBEDDING_DIMS,
            EMBEDDING_SEED,
        )),
    ));

    let manager = CacheManager::new(&config, formatter.clone(), consent.clone(), projector)
        .expect("cache manager");

    Harness {
        manager,
        formatter,
        consent,
        index,
        store,
        tmp,
    }
}
