pub mod catalog;
pub mod config;
pub mod destination;
pub mod embedding;
pub mod errors;
pub mod hash;
pub mod models;
pub mod sync;
pub mod tracking;
pub mod transform;

use crate::catalog::Catalog;
use crate::config::StorageConfig;
use crate::destination::DestinationSink;
use crate::embedding::EmbeddingProvider;
use crate::errors::Result;
use crate::sync::{EntityProcessor, SyncPass};
use crate::transform::TransformRouter;
use std::sync::Arc;
use uuid::Uuid;

/// The main entry point for the `syncstore` library.
///
/// `SyncStore` is the settlement layer of a connector-based synchronization
/// platform: source connectors stream batches of parent entities in, and the
/// store decides what changed, fans changed parents out into embeddable
/// chunks, and writes the result to the relational catalog and every
/// registered destination sink. It encapsulates:
/// - A metadata catalog (`Catalog`) using SQLite to track one content hash
///   per `(sync_id, entity_id)`, the only durable state the core owns.
/// - The batch pipeline (`EntityProcessor`) with bounded-concurrency hashing
///   and transformation, batched embedding, and multi-sink persistence.
/// - Pass-scoped liveness tracking (`SyncPass`) feeding end-of-pass orphan
///   reconciliation.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use syncstore::{config::StorageConfig, destination::MemorySink,
///     embedding::NullEmbeddingProvider, transform::ParagraphRouter, SyncStore};
/// use uuid::Uuid;
///
/// #[tokio::main]
/// async fn main() {
///     let config = StorageConfig::new("/var/lib/syncstore");
///     let store = SyncStore::new(config).await.unwrap();
///     let processor = store.processor(
///         Arc::new(ParagraphRouter::new("body")),
///         Arc::new(NullEmbeddingProvider),
///         vec![Arc::new(MemorySink::new("memory"))],
///     );
///     let pass = store.begin_pass(Uuid::new_v4(), Uuid::new_v4());
///     // feed batches through processor.process_batch(&pass, ...),
///     // then processor.finish_pass(&pass).
/// }
/// ```
pub struct SyncStore {
    pub config: StorageConfig,
    pub catalog: Arc<Catalog>,
}

impl SyncStore {
    /// Opens the catalog under the configured base path and initializes its
    /// schema.
    pub async fn new(config: StorageConfig) -> Result<Self> {
        if let Some(base) = config.catalog_path.parent() {
            tokio::fs::create_dir_all(base).await?;
        }

        let catalog = Arc::new(Catalog::new(&config)?);
        catalog.initialize_schema()?;

        Ok(Self { config, catalog })
    }

    /// Builds an entity processor over this store's catalog with the given
    /// collaborators. Sparse embedding and tuning knobs attach via the
    /// processor's `with_*` methods.
    pub fn processor(
        &self,
        router: Arc<dyn TransformRouter>,
        embedder: Arc<dyn EmbeddingProvider>,
        sinks: Vec<Arc<dyn DestinationSink>>,
    ) -> EntityProcessor {
        EntityProcessor::new(Arc::clone(&self.catalog), router, embedder, sinks)
    }

    /// Starts a new sync pass context for liveness tracking and accounting.
    pub fn begin_pass(&self, sync_id: Uuid, sync_job_id: Uuid) -> SyncPass {
        SyncPass::new(sync_id, sync_job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_syncstore_initialization() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("nested"));

        let store = SyncStore::new(config.clone()).await;
        assert!(store.is_ok());
        assert!(config.catalog_path.exists());
    }
}
