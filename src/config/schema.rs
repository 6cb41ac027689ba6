use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for the memory subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the sqlite database, the vector index and the
    /// per-channel memo snapshots.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

// ── Short-term cache ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Ring buffer capacity per channel.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Channels the manager serves. Anything else is `UnknownChannel`.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// The assistant's own platform user id — permanently opted in.
    #[serde(default)]
    pub self_user_id: String,

    /// Concurrent formatter calls during cold-start hydration.
    #[serde(default = "default_format_concurrency")]
    pub format_concurrency: usize,

    /// Concurrent deferred-ingestion tasks during hydration.
    #[serde(default = "default_ingest_concurrency")]
    pub ingest_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            channels: Vec::new(),
            self_user_id: String::new(),
            format_concurrency: default_format_concurrency(),
            ingest_concurrency: default_ingest_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub server_id: String,
    pub channel_id: String,
}

// ── Long-term memory ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Embedding provider: "none" | "openai" | "custom:URL"
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,

    /// Embedding model name (e.g. "text-embedding-3-small")
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Embedding vector dimensions
    #[serde(default = "default_embedding_dims")]
    pub embedding_dimensions: usize,

    /// Seconds between maintenance passes (drift repair, reconciliation).
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Prune fragment rows older than this many days. `None` keeps forever.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dims(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            retention_days: None,
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_capacity() -> usize {
    50
}

fn default_format_concurrency() -> usize {
    4
}

fn default_ingest_concurrency() -> usize {
    2
}

fn default_embedding_provider() -> String {
    "none".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_embedding_dims() -> usize {
    1536
}

fn default_maintenance_interval_secs() -> u64 {
    12 * 60 * 60
}
