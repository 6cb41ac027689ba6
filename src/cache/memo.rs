use crate::error::SnapshotError;
use crate::fragment::MemoRecord;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Formatted-message store: an in-memory map of message id → memo, mirrored
/// to one gzip'd JSON snapshot per channel so hydration can skip
/// re-formatting messages it has already seen.
///
/// Snapshots are rewritten whole (temp file, then rename) so a reader never
/// observes a partial document, and pruned to the newest `capacity` entries
/// so they track the ring buffer instead of growing without bound. A
/// corrupt snapshot is treated as absent.
pub struct MemoStore {
    dir: PathBuf,
    capacity: usize,
    memos: HashMap<String, MemoRecord>,
}

impl MemoStore {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create memo dir: {}", dir.display()))?;
        Ok(Self {
            dir,
            capacity: capacity.max(1),
            memos: HashMap::new(),
        })
    }

    pub fn has(&self, message_id: &str) -> bool {
        self.memos.contains_key(message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<&MemoRecord> {
        self.memos.get(message_id)
    }

    pub fn set(&mut self, message_id: impl Into<String>, memo: MemoRecord) {
        self.memos.insert(message_id.into(), memo);
    }

    pub fn delete(&mut self, message_id: &str) {
        self.memos.remove(message_id);
    }

    pub fn len(&self) -> usize {
        self.memos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memos.is_empty()
    }

    /// Load a channel's snapshot into memory and return the ids it held.
    /// Missing or corrupt snapshots yield an empty set; corruption is
    /// logged and the messages will simply be re-formatted.
    pub fn load_channel(&mut self, channel_id: &str) -> HashSet<String> {
        let path = self.snapshot_path(channel_id);
        if !path.exists() {
            return HashSet::new();
        }

        match read_snapshot(&path, channel_id) {
            Ok(entries) => {
                let ids: HashSet<String> = entries.keys().cloned().collect();
                self.memos.extend(entries);
                ids
            }
            Err(e) => {
                tracing::warn!("discarding corrupt memo snapshot for {channel_id}: {e:#}");
                HashSet::new()
            }
        }
    }

    /// Rewrite the channel snapshot from the buffer's current id order
    /// (oldest→newest), pruned to the newest `capacity` entries.
    pub fn save_channel_snapshot(&self, channel_id: &str, ordered_ids: &[String]) -> Result<()> {
        let skip = ordered_ids.len().saturating_sub(self.capacity);
        let mut entries: HashMap<&str, &MemoRecord> = HashMap::new();
        for id in &ordered_ids[skip..] {
            if let Some(memo) = self.memos.get(id) {
                entries.insert(id, memo);
            }
        }

        let path = self.snapshot_path(channel_id);
        write_snapshot(&path, &entries)
            .with_context(|| format!("failed to write memo snapshot for {channel_id}"))
    }

    /// Post-hydration cleanup: drop memos that the old snapshot carried but
    /// the freshly fetched window no longer contains, then persist the new
    /// membership.
    pub fn reconcile_channel(
        &mut self,
        channel_id: &str,
        current_ids: &[String],
        loaded_ids: &HashSet<String>,
    ) -> Result<()> {
        let current: HashSet<&str> = current_ids.iter().map(String::as_str).collect();
        for stale in loaded_ids.iter().filter(|id| !current.contains(id.as_str())) {
            self.memos.remove(stale);
        }
        self.save_channel_snapshot(channel_id, current_ids)
    }

    fn snapshot_path(&self, channel_id: &str) -> PathBuf {
        let safe: String = channel_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json.gz"))
    }
}

fn read_snapshot(
    path: &Path,
    channel_id: &str,
) -> std::result::Result<HashMap<String, MemoRecord>, SnapshotError> {
    let raw = fs::read(path)?;
    let mut decoder = GzDecoder::new(raw.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| SnapshotError::Corrupt {
            channel_id: channel_id.to_string(),
            reason: format!("gzip decode failed: {e}"),
        })?;
    serde_json::from_slice(&json).map_err(|e| SnapshotError::Corrupt {
        channel_id: channel_id.to_string(),
        reason: format!("json parse failed: {e}"),
    })
}

fn write_snapshot(path: &Path, entries: &HashMap<&str, &MemoRecord>) -> Result<()> {
    let json = serde_json::to_vec(entries)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, compressed)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
