pub mod schema;

pub use schema::{CacheConfig, ChannelConfig, Config, MemoryConfig};

use anyhow::Context;
use std::path::Path;

impl Config {
    /// Load configuration from a TOML file. Missing fields fall back to
    /// their serde defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }
}
