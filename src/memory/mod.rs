//! Long-term memory: the authoritative sqlite fragment store, the derived
//! vector index, embedding providers, and the maintenance loops that keep
//! the two stores convergent.

pub mod embeddings;
pub mod index;
#[cfg(feature = "vector-search")]
pub mod lancedb;
pub mod maintenance;
pub mod projector;
pub mod store;
pub mod vector;

pub use embeddings::{create_embedding_provider, EmbeddingProvider, NoopEmbedding};
pub use index::{NoopVectorIndex, SearchHit, VectorEntry, VectorIndex};
pub use maintenance::{MaintenanceScheduler, ReconcileReport};
pub use projector::FragmentProjector;
pub use store::{FragmentRow, FragmentStore, NewFragmentRow};

use crate::config::MemoryConfig;
use std::path::Path;
use std::sync::Arc;

/// Wire up the vector index for the configured embedding dimensions.
/// Falls back to the no-op index when semantic recall is disabled, so the
/// rest of the subsystem never branches on the feature.
pub fn create_vector_index(
    data_dir: &Path,
    config: &MemoryConfig,
) -> anyhow::Result<Arc<dyn VectorIndex>> {
    if config.embedding_provider == "none" || config.embedding_dimensions == 0 {
        return Ok(Arc::new(NoopVectorIndex));
    }

    #[cfg(feature = "vector-search")]
    {
        let index =
            lancedb::LanceVectorIndex::new(data_dir, config.embedding_dimensions)?;
        Ok(Arc::new(index))
    }

    #[cfg(not(feature = "vector-search"))]
    {
        let _ = data_dir;
        tracing::warn!("built without vector-search; semantic recall disabled");
        Ok(Arc::new(NoopVectorIndex))
    }
}
