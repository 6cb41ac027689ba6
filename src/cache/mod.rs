//! Short-term memory: per-channel ring buffers of raw messages, the memo
//! store that mirrors them with formatted fragments, and the manager that
//! feeds long-term ingestion.

pub mod gate;
pub mod hydration;
pub mod manager;
pub mod memo;
pub mod state;
pub mod traits;

pub use gate::{GateDecision, IngestionGate};
pub use manager::CacheManager;
pub use memo::MemoStore;
pub use state::ChannelCacheState;
pub use traits::{ConsentRegistry, HistorySource, MessageFormatter};
