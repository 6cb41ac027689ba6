use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `mnemos`.
///
/// Only the read path surfaces typed errors to callers; the write/ingestion
/// path absorbs downstream failures and logs them, so cache writes never
/// block on store health. Internal code continues to use `anyhow::Result`
/// for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum MnemosError {
    // ── Cache read path ─────────────────────────────────────────────────
    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    // ── Snapshot persistence ────────────────────────────────────────────
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Cache errors ────────────────────────────────────────────────────────────

/// Caller errors on the cache read path. These are the only user-visible
/// failures: querying a channel the manager was never configured for, or a
/// message the ring buffer no longer holds.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("channel {0} is not configured")]
    UnknownChannel(String),

    #[error("message {message_id} not cached in channel {channel_id}")]
    UnknownMessage {
        channel_id: String,
        message_id: String,
    },
}

// ─── Snapshot errors ────────────────────────────────────────────────────────

/// Memo snapshot failures. `Corrupt` is handled internally by treating the
/// snapshot as absent; it never aborts hydration.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("corrupt snapshot for channel {channel_id}: {reason}")]
    Corrupt { channel_id: String, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MnemosError>;
