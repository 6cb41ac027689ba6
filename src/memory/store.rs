use super::vector;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// One persisted fragment row. `(message_id, source_idx, kind,
/// content_hash)` is unique; re-ingesting identical content updates in
/// place instead of duplicating.
#[derive(Debug, Clone)]
pub struct FragmentRow {
    pub id: i64,
    pub server_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    pub ts: i64,
    pub content: String,
    pub kind: String,
    pub title: String,
    pub url: Option<String>,
    pub media_id: String,
    pub embedding: Vec<f32>,
    pub emb_model: String,
    pub emb_dim: usize,
    pub source_idx: usize,
    pub content_hash: String,
    /// Unix seconds of the last successful embedding; 0 marks the row as
    /// pending repair by the maintenance pass.
    pub last_embedded_ts: i64,
}

/// Insert/update payload for [`FragmentStore::upsert`].
#[derive(Debug, Clone)]
pub struct NewFragmentRow {
    pub server_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    pub ts: i64,
    pub content: String,
    pub kind: String,
    pub title: String,
    pub url: Option<String>,
    pub media_id: String,
    pub embedding: Vec<f32>,
    pub emb_model: String,
    pub emb_dim: usize,
    pub source_idx: usize,
    pub content_hash: String,
    pub last_embedded_ts: i64,
}

/// Scope + embedding of one row, as consumed by vector-index reconciliation.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub id: i64,
    pub server_id: String,
    pub channel_id: String,
    pub embedding: Vec<f32>,
}

/// SQLite-backed fragment store — the authoritative half of the dual-store
/// memory. The vector index is always reconstructible from these rows.
///
/// A single connection guarded by one mutex; the lock is held only for
/// statement execution, never across collaborator I/O.
pub struct FragmentStore {
    conn: Mutex<Connection>,
}

impl FragmentStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fragments (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id        TEXT NOT NULL,
                channel_id       TEXT NOT NULL,
                message_id       TEXT NOT NULL,
                author_id        TEXT NOT NULL,
                ts               INTEGER NOT NULL,
                content          TEXT NOT NULL,
                kind             TEXT NOT NULL,
                title            TEXT NOT NULL DEFAULT '',
                url              TEXT,
                media_id         TEXT NOT NULL,
                embedding        BLOB NOT NULL,
                emb_model        TEXT NOT NULL,
                emb_dim          INTEGER NOT NULL,
                source_idx       INTEGER NOT NULL,
                content_hash     TEXT NOT NULL,
                last_embedded_ts INTEGER NOT NULL DEFAULT 0,
                UNIQUE(message_id, source_idx, kind, content_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_fragments_message ON fragments(message_id);
            CREATE INDEX IF NOT EXISTS idx_fragments_author ON fragments(author_id);
            CREATE INDEX IF NOT EXISTS idx_fragments_ts ON fragments(ts);
            CREATE INDEX IF NOT EXISTS idx_fragments_media ON fragments(media_id);",
        )?;
        Ok(())
    }

    fn lock_connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|error| anyhow::anyhow!("fragment store lock poisoned: {error}"))
    }

    /// Insert-or-update keyed by the content identity. Content changes
    /// refresh embedding/title/url/media in place; unrelated columns are
    /// untouched. Returns the row id.
    pub fn upsert(&self, row: &NewFragmentRow) -> Result<i64> {
        let conn = self.lock_connection()?;
        conn.execute(
            "INSERT INTO fragments (
                server_id, channel_id, message_id, author_id, ts,
                content, kind, title, url, media_id,
                embedding, emb_model, emb_dim, source_idx, content_hash,
                last_embedded_ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(message_id, source_idx, kind, content_hash) DO UPDATE SET
                embedding        = excluded.embedding,
                emb_model        = excluded.emb_model,
                emb_dim          = excluded.emb_dim,
                title            = excluded.title,
                url              = excluded.url,
                media_id         = excluded.media_id,
                last_embedded_ts = excluded.last_embedded_ts",
            params![
                row.server_id,
                row.channel_id,
                row.message_id,
                row.author_id,
                row.ts,
                row.content,
                row.kind,
                row.title,
                row.url,
                row.media_id,
                vector::vec_to_bytes(&row.embedding),
                row.emb_model,
                row.emb_dim as i64,
                row.source_idx as i64,
                row.content_hash,
                row.last_embedded_ts,
            ],
        )
        .context("fragment upsert failed")?;

        let id: i64 = conn
            .query_row(
                "SELECT id FROM fragments
                 WHERE message_id = ?1 AND source_idx = ?2 AND kind = ?3 AND content_hash = ?4",
                params![row.message_id, row.source_idx as i64, row.kind, row.content_hash],
                |r| r.get(0),
            )
            .context("fragment id lookup after upsert failed")?;
        Ok(id)
    }

    /// Whether any fragment of this message was already persisted. Used by
    /// the ingestion gate to short-circuit re-embedding.
    pub fn has_message(&self, message_id: &str) -> Result<bool> {
        let conn = self.lock_connection()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM fragments WHERE message_id = ?1 LIMIT 1",
                params![message_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock_connection()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM fragments", [], |r| r.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// All row scopes + embeddings, for reconciliation against the vector
    /// index.
    pub fn all_embeddings(&self) -> Result<Vec<EmbeddingRow>> {
        let conn = self.lock_connection()?;
        let mut stmt =
            conn.prepare("SELECT id, server_id, channel_id, embedding FROM fragments")?;
        let rows = stmt.query_map([], |r| {
            let blob: Vec<u8> = r.get(3)?;
            Ok(EmbeddingRow {
                id: r.get(0)?,
                server_id: r.get(1)?,
                channel_id: r.get(2)?,
                embedding: vector::bytes_to_vec(&blob),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Rows whose embedding has drifted from the current configuration or
    /// never succeeded: model/dims mismatch, wrong blob length, all-zero
    /// vector, or a `last_embedded_ts` predating `stale_before`. The
    /// all-zero case compares against `zeroblob` in SQL so the scan never
    /// loads healthy embeddings.
    pub fn rows_needing_embedding(
        &self,
        model: &str,
        dims: usize,
        stale_before: i64,
    ) -> Result<Vec<FragmentRow>> {
        self.select_rows(
            "WHERE emb_model != ?1
                OR emb_dim != ?2
                OR length(embedding) != ?3
                OR last_embedded_ts < ?4
                OR embedding = zeroblob(length(embedding))",
            params![model, dims as i64, (dims * 4) as i64, stale_before],
        )
    }

    pub fn rows_by_ids(&self, ids: &[i64]) -> Result<Vec<FragmentRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let clause = format!("WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        self.select_rows(&clause, params.as_slice())
    }

    pub fn rows_for_message(&self, message_id: &str) -> Result<Vec<FragmentRow>> {
        self.select_rows(
            "WHERE message_id = ?1 ORDER BY source_idx",
            params![message_id],
        )
    }

    pub fn update_embedding(
        &self,
        id: i64,
        embedding: &[f32],
        model: &str,
        dims: usize,
        embedded_ts: i64,
    ) -> Result<()> {
        let conn = self.lock_connection()?;
        conn.execute(
            "UPDATE fragments
             SET embedding = ?2, emb_model = ?3, emb_dim = ?4, last_embedded_ts = ?5
             WHERE id = ?1",
            params![
                id,
                vector::vec_to_bytes(embedding),
                model,
                dims as i64,
                embedded_ts
            ],
        )?;
        Ok(())
    }

    /// Consent withdrawal: delete every row by this author and return the
    /// ids so the mirrored vector entries can be retired too.
    pub fn purge_author(&self, author_id: &str) -> Result<Vec<i64>> {
        let conn = self.lock_connection()?;
        let mut stmt = conn.prepare("SELECT id FROM fragments WHERE author_id = ?1")?;
        let ids: Vec<i64> = stmt
            .query_map(params![author_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        conn.execute("DELETE FROM fragments WHERE author_id = ?1", params![author_id])?;
        Ok(ids)
    }

    /// Age-based retention: delete rows older than `cutoff_ts` and return
    /// their ids.
    pub fn prune_older_than(&self, cutoff_ts: i64) -> Result<Vec<i64>> {
        let conn = self.lock_connection()?;
        let mut stmt = conn.prepare("SELECT id FROM fragments WHERE ts < ?1")?;
        let ids: Vec<i64> = stmt
            .query_map(params![cutoff_ts], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        conn.execute("DELETE FROM fragments WHERE ts < ?1", params![cutoff_ts])?;
        Ok(ids)
    }

    fn select_rows<P: rusqlite::Params>(&self, clause: &str, params: P) -> Result<Vec<FragmentRow>> {
        let conn = self.lock_connection()?;
        let sql = format!(
            "SELECT id, server_id, channel_id, message_id, author_id, ts,
                    content, kind, title, url, media_id, embedding,
                    emb_model, emb_dim, source_idx, content_hash, last_embedded_ts
             FROM fragments {clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |r| {
            let blob: Vec<u8> = r.get(11)?;
            let emb_dim: i64 = r.get(13)?;
            let source_idx: i64 = r.get(14)?;
            Ok(FragmentRow {
                id: r.get(0)?,
                server_id: r.get(1)?,
                channel_id: r.get(2)?,
                message_id: r.get(3)?,
                author_id: r.get(4)?,
                ts: r.get(5)?,
                content: r.get(6)?,
                kind: r.get(7)?,
                title: r.get(8)?,
                url: r.get(9)?,
                media_id: r.get(10)?,
                embedding: vector::bytes_to_vec(&blob),
                emb_model: r.get(12)?,
                emb_dim: usize::try_from(emb_dim).unwrap_or(0),
                source_idx: usize::try_from(source_idx).unwrap_or(0),
                content_hash: r.get(15)?,
                last_embedded_ts: r.get(16)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
