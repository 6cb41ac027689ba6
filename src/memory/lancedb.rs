use super::index::{SearchHit, VectorEntry, VectorIndex};

use anyhow::Context;
use async_trait::async_trait;

use arrow_array::builder::{FixedSizeListBuilder, Float32Builder};
use arrow_array::{Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};

use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::table::OptimizeAction;
use lancedb::Table;
use tokio::sync::OnceCell;

use futures_util::TryStreamExt;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TABLE_NAME: &str = "fragments";
const LANCE_DISTANCE_COL: &str = "_distance";

struct LanceInner {
    db_dir: PathBuf,
    schema: SchemaRef,
    table: OnceCell<Table>,
}

impl LanceInner {
    /// Lazily established, cached connection + table handle.
    async fn table(&self) -> anyhow::Result<&Table> {
        self.table
            .get_or_try_init(|| async {
                let uri = self.db_dir.to_string_lossy().to_string();
                let conn = lancedb::connect(&uri)
                    .execute()
                    .await
                    .with_context(|| format!("Failed to connect to LanceDB at {uri}"))?;

                let table = match conn.open_table(TABLE_NAME).execute().await {
                    Ok(t) => t,
                    Err(_) => conn
                        .create_empty_table(TABLE_NAME, self.schema.clone())
                        .execute()
                        .await
                        .context("Failed to create empty LanceDB fragments table")?,
                };

                Ok(table)
            })
            .await
    }
}

/// LanceDB-backed [`VectorIndex`]: one table keyed by fragment row id,
/// scoped by `(server_id, channel_id)` for search filtering.
pub struct LanceVectorIndex {
    inner: Arc<LanceInner>,
    dims: usize,
}

impl LanceVectorIndex {
    pub fn new(data_dir: &Path, dims: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            dims > 0,
            "LanceDB vector index requires embeddings (embedding_dimensions > 0)"
        );

        let db_dir = data_dir.join("lancedb");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create LanceDB dir: {}", db_dir.display()))?;

        let dims_i32 =
            i32::try_from(dims).with_context(|| format!("Invalid embedding dimension: {dims}"))?;

        let embedding_field = Field::new("item", DataType::Float32, true);
        let embedding_dt = DataType::FixedSizeList(Arc::new(embedding_field), dims_i32);
        let schema = Arc::new(Schema::new(vec![
            Field::new("rid", DataType::Int64, false),
            Field::new("server_id", DataType::Utf8, false),
            Field::new("channel_id", DataType::Utf8, false),
            Field::new("embedding", embedding_dt, false),
        ]));

        Ok(Self {
            inner: Arc::new(LanceInner {
                db_dir,
                schema,
                table: OnceCell::new(),
            }),
            dims,
        })
    }

    fn sql_eq(column: &str, value: &str) -> String {
        let v = value.replace('\'', "''");
        format!("{column} = '{v}'")
    }

    fn sql_id_list(rids: &[i64]) -> String {
        let ids: Vec<String> = rids.iter().map(i64::to_string).collect();
        format!("rid IN ({})", ids.join(", "))
    }

    fn build_batch(&self, entries: &[VectorEntry]) -> anyhow::Result<RecordBatch> {
        let rid = Arc::new(Int64Array::from(
            entries.iter().map(|e| e.rid).collect::<Vec<_>>(),
        ));
        let server_id = Arc::new(StringArray::from(
            entries
                .iter()
                .map(|e| Some(e.server_id.as_str()))
                .collect::<Vec<_>>(),
        ));
        let channel_id = Arc::new(StringArray::from(
            entries
                .iter()
                .map(|e| Some(e.channel_id.as_str()))
                .collect::<Vec<_>>(),
        ));

        let dims_i32 = i32::try_from(self.dims)?;
        let mut emb_builder = FixedSizeListBuilder::new(Float32Builder::new(), dims_i32);
        for entry in entries {
            anyhow::ensure!(
                entry.embedding.len() == self.dims,
                "Embedding dimension mismatch: got {}, expected {}",
                entry.embedding.len(),
                self.dims
            );
            emb_builder.values().append_slice(&entry.embedding);
            emb_builder.append(true);
        }
        let embedding = Arc::new(emb_builder.finish());

        let cols: Vec<Arc<dyn Array>> = vec![rid, server_id, channel_id, embedding];
        RecordBatch::try_new(self.inner.schema.clone(), cols).context("record batch build failed")
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    fn name(&self) -> &str {
        "lancedb"
    }

    async fn upsert_many(&self, entries: Vec<VectorEntry>) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let table = self.inner.table().await?;

        let rids: Vec<i64> = entries.iter().map(|e| e.rid).collect();
        table
            .delete(&Self::sql_id_list(&rids))
            .await
            .context("LanceDB pre-upsert delete failed")?;

        let batch = self.build_batch(&entries)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new([Ok(batch)].into_iter(), schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("LanceDB add failed")?;
        Ok(())
    }

    async fn delete_many(&self, rids: &[i64]) -> anyhow::Result<()> {
        if rids.is_empty() {
            return Ok(());
        }
        let table = self.inner.table().await?;
        table
            .delete(&Self::sql_id_list(rids))
            .await
            .context("LanceDB delete failed")?;
        Ok(())
    }

    async fn existing_ids(&self) -> anyhow::Result<HashSet<i64>> {
        let table = self.inner.table().await?;
        let mut stream = table
            .query()
            .select(Select::columns(&["rid"]))
            .execute()
            .await
            .context("LanceDB id scan failed")?;

        let mut ids = HashSet::new();
        while let Some(batch) = stream.try_next().await? {
            if let Some(col) = batch
                .column_by_name("rid")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            {
                for i in 0..col.len() {
                    if !col.is_null(i) {
                        ids.insert(col.value(i));
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn search(
        &self,
        server_id: &str,
        channel_id: &str,
        query: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let table = self.inner.table().await?;
        let filter = format!(
            "{} AND {}",
            Self::sql_eq("server_id", server_id),
            Self::sql_eq("channel_id", channel_id)
        );

        let mut stream = table
            .query()
            .only_if(filter)
            .nearest_to(query)?
            .column("embedding")
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k)
            .select(Select::columns(&["rid", LANCE_DISTANCE_COL]))
            .execute()
            .await
            .context("LanceDB vector search failed")?;

        let mut hits = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            let rid = batch
                .column_by_name("rid")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let dist = batch
                .column_by_name(LANCE_DISTANCE_COL)
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
            let (Some(rid), Some(dist)) = (rid, dist) else {
                continue;
            };
            for i in 0..rid.len() {
                if rid.is_null(i) {
                    continue;
                }
                let score = (1.0 - dist.value(i)).clamp(0.0, 1.0);
                hits.push(SearchHit {
                    rid: rid.value(i),
                    score,
                });
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn compact(&self) -> anyhow::Result<()> {
        let table = self.inner.table().await?;
        table
            .optimize(OptimizeAction::All)
            .await
            .context("LanceDB optimize failed")?;
        Ok(())
    }
}
