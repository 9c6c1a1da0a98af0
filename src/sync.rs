use crate::catalog::Catalog;
use crate::config::PipelineOptions;
use crate::destination::DestinationSink;
use crate::embedding::{EmbeddingProvider, SparseEmbeddingProvider};
use crate::errors::{Result, StoreError};
use crate::hash::content_hash;
use crate::models::{CatalogRow, ChangeAction, Chunk, Entity};
use crate::tracking::{GuardRail, ProgressSnapshot, SyncProgress};
use crate::transform::TransformRouter;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task;
use uuid::Uuid;

/// Pass-scoped context for one end-to-end sync run.
///
/// Owns the cross-batch liveness state (which entity ids each batch has
/// already settled) and the pass-wide progress and quota counters. One
/// `SyncPass` is created per sync run, threaded through every
/// `process_batch` call, and finally handed to `finish_pass` for orphan
/// reconciliation.
pub struct SyncPass {
    sync_id: Uuid,
    sync_job_id: Uuid,
    seen: Mutex<HashMap<String, HashSet<String>>>,
    pub progress: SyncProgress,
    pub guard_rail: GuardRail,
}

impl SyncPass {
    pub fn new(sync_id: Uuid, sync_job_id: Uuid) -> Self {
        Self {
            sync_id,
            sync_job_id,
            seen: Mutex::new(HashMap::new()),
            progress: SyncProgress::default(),
            guard_rail: GuardRail::default(),
        }
    }

    pub fn sync_id(&self) -> Uuid {
        self.sync_id
    }

    pub fn sync_job_id(&self) -> Uuid {
        self.sync_job_id
    }

    /// Records an entity id into the per-type seen set. Returns whether this
    /// was the first sighting within the pass.
    fn mark_seen(&self, entity_type: &str, entity_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap();
        seen.entry(entity_type.to_string())
            .or_default()
            .insert(entity_id.to_string())
    }

    pub fn was_seen(&self, entity_type: &str, entity_id: &str) -> bool {
        let seen = self.seen.lock().unwrap();
        seen.get(entity_type)
            .map(|ids| ids.contains(entity_id))
            .unwrap_or(false)
    }
}

/// Result of settling one batch of parent entities.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Chunks persisted to the destinations, keyed by parent entity id.
    /// Parents that produced no persisted chunks (KEEP, DELETE, SKIP) are
    /// absent.
    pub persisted: HashMap<String, Vec<Chunk>>,
    /// Partition sizes for this batch alone.
    pub counts: ProgressSnapshot,
}

/// Disjoint change-action partitions plus the lookup context later stages
/// need.
#[derive(Default)]
struct BatchPartitions {
    inserts: Vec<Entity>,
    updates: Vec<Entity>,
    keeps: Vec<Entity>,
    deletes: Vec<Entity>,
    hashes: HashMap<String, String>,
    rows: HashMap<String, CatalogRow>,
    skipped: usize,
}

/// The settlement core: six stages per batch, one orphan reconciliation per
/// pass.
///
/// Stage order within a batch: dedup/liveness, action determination
/// (lookup + hash + partition), transform fan-out, batched embedding,
/// persistence (catalog before destinations, clear before insert), then
/// progress/quota accounting. A record excluded by one stage never reaches
/// the next; records within a stage complete in no particular order.
pub struct EntityProcessor {
    catalog: Arc<Catalog>,
    router: Arc<dyn TransformRouter>,
    embedder: Arc<dyn EmbeddingProvider>,
    sparse_embedder: Option<Arc<dyn SparseEmbeddingProvider>>,
    sinks: Vec<Arc<dyn DestinationSink>>,
    options: PipelineOptions,
}

impl EntityProcessor {
    pub fn new(
        catalog: Arc<Catalog>,
        router: Arc<dyn TransformRouter>,
        embedder: Arc<dyn EmbeddingProvider>,
        sinks: Vec<Arc<dyn DestinationSink>>,
    ) -> Self {
        Self {
            catalog,
            router,
            embedder,
            sparse_embedder: None,
            sinks,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_sparse_embedder(mut self, provider: Arc<dyn SparseEmbeddingProvider>) -> Self {
        self.sparse_embedder = Some(provider);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Settles one batch of parent entities against the catalog and every
    /// destination sink.
    pub async fn process_batch(&self, pass: &SyncPass, batch: Vec<Entity>) -> Result<BatchOutcome> {
        let batch_size = batch.len();

        // --- Stage 1: Dedup & liveness ---
        let (fresh, dedup_skipped) = self.dedup_stage(pass, batch);

        // --- Stage 2: Action determination ---
        let mut partitions = self.determine_actions(pass, fresh).await?;
        partitions.skipped += dedup_skipped;
        log::info!(
            "batch of {}: {} insert, {} update, {} keep, {} delete, {} skipped",
            batch_size,
            partitions.inserts.len(),
            partitions.updates.len(),
            partitions.keeps.len(),
            partitions.deletes.len(),
            partitions.skipped,
        );

        // --- Stage 3: Transform fan-out ---
        let mut chunk_map = self.transform_stage(pass, &mut partitions).await;

        // --- Stage 4: Batched embedding ---
        self.vector_stage(&partitions, &mut chunk_map).await?;

        // --- Stage 5: Persistence ---
        self.persist(pass, &mut partitions, &mut chunk_map).await?;

        // --- Stage 6: Accounting ---
        let counts = self.account(pass, &partitions);

        Ok(BatchOutcome {
            persisted: chunk_map,
            counts,
        })
    }

    /// Drops skip-flagged records and anything already settled earlier in
    /// the pass, recording every survivor into the liveness sets. Returns
    /// the survivors and the number of records dropped here.
    fn dedup_stage(&self, pass: &SyncPass, batch: Vec<Entity>) -> (Vec<Entity>, usize) {
        let mut fresh = Vec::with_capacity(batch.len());
        let mut skipped = 0usize;
        for entity in batch {
            if entity.should_skip {
                skipped += 1;
                continue;
            }
            if !pass.mark_seen(&entity.entity_type, &entity.entity_id) {
                log::warn!(
                    "duplicate {} '{}' dropped from batch",
                    entity.entity_type,
                    entity.entity_id
                );
                skipped += 1;
                continue;
            }
            fresh.push(entity);
        }
        if skipped > 0 {
            pass.progress.record_skipped(skipped);
        }
        (fresh, skipped)
    }

    /// One bulk catalog round trip, bounded-concurrency hashing, then the
    /// INSERT / UPDATE / KEEP / DELETE partition. Deletion markers win over
    /// catalog state and never get hashed.
    async fn determine_actions(
        &self,
        pass: &SyncPass,
        fresh: Vec<Entity>,
    ) -> Result<BatchPartitions> {
        let mut partitions = BatchPartitions::default();

        let (deletions, candidates): (Vec<Entity>, Vec<Entity>) =
            fresh.into_iter().partition(|e| e.deletion_marker);
        partitions.deletes = deletions;

        // A lookup error aborts the batch: treating it as "no rows" would
        // reclassify updates as inserts and duplicate their chunks.
        let mut ids: Vec<String> = candidates.iter().map(|e| e.entity_id.clone()).collect();
        ids.extend(partitions.deletes.iter().map(|e| e.entity_id.clone()));
        partitions.rows = self.catalog.get_rows(pass.sync_id(), &ids)?;

        type HashOutcome = std::result::Result<(Entity, String), String>;

        let gate = Arc::new(Semaphore::new(self.options.max_workers));
        let mut hashed: Vec<(usize, HashOutcome)> =
            stream::iter(candidates.into_iter().enumerate().map(|(idx, entity)| {
                let gate = Arc::clone(&gate);
                async move {
                    let _permit = gate.acquire_owned().await.expect("admission gate closed");
                    let entity_label = format!("{} '{}'", entity.entity_type, entity.entity_id);
                    // Canonical serialization is CPU-bound; keep it off the
                    // I/O workers.
                    let joined = task::spawn_blocking(move || {
                        let hash = content_hash(&entity);
                        (entity, hash)
                    })
                    .await;
                    let outcome: HashOutcome = match joined {
                        Ok((entity, Ok(hash))) => Ok((entity, hash)),
                        Ok((_, Err(err))) => Err(format!("hash failed for {entity_label}: {err}")),
                        Err(err) => Err(format!("hash task failed for {entity_label}: {err}")),
                    };
                    (idx, outcome)
                }
            }))
            .buffer_unordered(self.options.max_workers)
            .collect()
            .await;
        hashed.sort_by_key(|(idx, _)| *idx);

        for (_, outcome) in hashed {
            let (entity, hash) = match outcome {
                Ok(pair) => pair,
                Err(reason) => {
                    log::warn!("{reason}, record skipped");
                    partitions.skipped += 1;
                    pass.progress.record_skipped(1);
                    continue;
                }
            };
            let entity_id = entity.entity_id.clone();
            match partitions.rows.get(&entity_id) {
                None => partitions.inserts.push(entity),
                Some(row) if row.hash == hash => partitions.keeps.push(entity),
                Some(_) => partitions.updates.push(entity),
            }
            partitions.hashes.insert(entity_id, hash);
        }

        Ok(partitions)
    }

    /// Fans inserts and updates through the transform router with the same
    /// admission bound as hashing. Parents whose transform fails or yields
    /// nothing are withdrawn from their partition before persistence.
    async fn transform_stage(
        &self,
        pass: &SyncPass,
        partitions: &mut BatchPartitions,
    ) -> HashMap<String, Vec<Chunk>> {
        let parents: Vec<Entity> = partitions
            .inserts
            .iter()
            .chain(partitions.updates.iter())
            .cloned()
            .collect();
        if parents.is_empty() {
            return HashMap::new();
        }

        let gate = Arc::new(Semaphore::new(self.options.max_workers));
        let router = Arc::clone(&self.router);
        let results: Vec<(Entity, Result<Vec<Chunk>>)> =
            stream::iter(parents.into_iter().map(|entity| {
                let gate = Arc::clone(&gate);
                let router = Arc::clone(&router);
                async move {
                    let _permit = gate.acquire_owned().await.expect("admission gate closed");
                    let chunks = router.transform(&entity).await;
                    (entity, chunks)
                }
            }))
            .buffer_unordered(self.options.max_workers)
            .collect()
            .await;

        let mut chunk_map = HashMap::new();
        let mut dropped: HashSet<String> = HashSet::new();
        for (entity, outcome) in results {
            match outcome {
                Ok(chunks) if !chunks.is_empty() => {
                    chunk_map.insert(entity.entity_id.clone(), chunks);
                }
                Ok(_) => {
                    log::warn!(
                        "transform produced nothing for {} '{}', record skipped",
                        entity.entity_type,
                        entity.entity_id
                    );
                    dropped.insert(entity.entity_id);
                }
                Err(err) => {
                    log::warn!(
                        "transform failed for {} '{}', record skipped: {err}",
                        entity.entity_type,
                        entity.entity_id
                    );
                    dropped.insert(entity.entity_id);
                }
            }
        }

        if !dropped.is_empty() {
            // Required filter: a parent without chunks must not be committed.
            partitions.inserts.retain(|e| !dropped.contains(&e.entity_id));
            partitions.updates.retain(|e| !dropped.contains(&e.entity_id));
            partitions.skipped += dropped.len();
            pass.progress.record_skipped(dropped.len());
        }

        chunk_map
    }

    /// One batched dense call for every surviving chunk, plus one batched
    /// sparse call when some sink keeps a keyword index. Vectors map back to
    /// chunks positionally; a count mismatch leaves the tail unvectorized.
    async fn vector_stage(
        &self,
        partitions: &BatchPartitions,
        chunk_map: &mut HashMap<String, Vec<Chunk>>,
    ) -> Result<()> {
        let ordered_parents: Vec<&Entity> = partitions
            .inserts
            .iter()
            .chain(partitions.updates.iter())
            .collect();

        let mut texts = Vec::new();
        for parent in &ordered_parents {
            if let Some(chunks) = chunk_map.get(&parent.entity_id) {
                texts.extend(chunks.iter().map(|c| c.text.clone()));
            }
        }
        if texts.is_empty() {
            return Ok(());
        }

        let dense = self.embed_dense(texts.clone()).await?;
        if dense.len() != texts.len() {
            log::warn!(
                "dense provider returned {} vectors for {} texts; unmatched positions skipped",
                dense.len(),
                texts.len()
            );
        }

        let sparse = if self.sinks.iter().any(|sink| sink.has_keyword_index()) {
            match &self.sparse_embedder {
                Some(provider) => {
                    let vectors = provider.embed(texts.clone()).await?;
                    if vectors.len() != texts.len() {
                        log::warn!(
                            "sparse provider returned {} vectors for {} texts; unmatched positions skipped",
                            vectors.len(),
                            texts.len()
                        );
                    }
                    Some(vectors)
                }
                None => {
                    log::warn!(
                        "a destination declares a keyword index but no sparse provider is configured"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut dense_iter = dense.into_iter();
        let mut sparse_iter = sparse.map(|v| v.into_iter());
        for parent in &ordered_parents {
            if let Some(chunks) = chunk_map.get_mut(&parent.entity_id) {
                for chunk in chunks {
                    chunk.dense_vector = dense_iter.next();
                    if let Some(iter) = sparse_iter.as_mut() {
                        chunk.sparse_vector = iter.next();
                    }
                }
            }
        }
        Ok(())
    }

    async fn embed_dense(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        // Stay under the provider's per-call input ceiling.
        for slice in texts.chunks(self.options.embedding_batch_ceiling.max(1)) {
            out.extend(self.embedder.embed(slice.to_vec()).await?);
        }
        Ok(out)
    }

    /// Catalog before destinations, clear before insert. Catalog failures
    /// propagate; nothing here is rolled back.
    async fn persist(
        &self,
        pass: &SyncPass,
        partitions: &mut BatchPartitions,
        chunk_map: &mut HashMap<String, Vec<Chunk>>,
    ) -> Result<()> {
        let sync_id = pass.sync_id();

        // Step 1: catalog inserts, minting row ids for new parents.
        let mut new_rows = Vec::with_capacity(partitions.inserts.len());
        for entity in &mut partitions.inserts {
            let row_id = Uuid::new_v4();
            entity.db_row_id = Some(row_id);
            new_rows.push(CatalogRow {
                row_id,
                sync_id,
                entity_id: entity.entity_id.clone(),
                entity_type: entity.entity_type.clone(),
                hash: partitions
                    .hashes
                    .get(&entity.entity_id)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::SyncError(format!(
                            "no hash recorded for insert '{}'",
                            entity.entity_id
                        ))
                    })?,
            });
        }
        self.catalog.create_rows(&new_rows)?;

        // Step 2: catalog hash updates via the pre-fetched row ids.
        let mut hash_updates = Vec::with_capacity(partitions.updates.len());
        for entity in &mut partitions.updates {
            let row = partitions.rows.get(&entity.entity_id).ok_or_else(|| {
                StoreError::SyncError(format!(
                    "update '{}' lost its catalog row between stages",
                    entity.entity_id
                ))
            })?;
            entity.db_row_id = Some(row.row_id);
            let hash = partitions
                .hashes
                .get(&entity.entity_id)
                .cloned()
                .ok_or_else(|| {
                    StoreError::SyncError(format!(
                        "no hash recorded for update '{}'",
                        entity.entity_id
                    ))
                })?;
            hash_updates.push((row.row_id, hash));
        }
        self.catalog.update_hashes(&hash_updates)?;

        // Row ids flow down to every surviving chunk.
        for entity in partitions.inserts.iter().chain(partitions.updates.iter()) {
            if let Some(chunks) = chunk_map.get_mut(&entity.entity_id) {
                for chunk in chunks {
                    chunk.db_row_id = entity.db_row_id;
                }
            }
        }

        // Step 3: destination clears for updated and deleted parents.
        for sink in &self.sinks {
            for entity in &partitions.updates {
                if let Some(row_id) = entity.db_row_id {
                    sink.bulk_delete_by_parent_id(row_id, sync_id).await?;
                }
            }
            for entity in &partitions.deletes {
                // A deletion with no catalog row has nothing to clear.
                if let Some(row) = partitions.rows.get(&entity.entity_id) {
                    sink.bulk_delete_by_parent_id(row.row_id, sync_id).await?;
                }
            }
        }

        // Step 4: destination inserts for the batch's surviving chunks.
        let mut all_chunks = Vec::new();
        for entity in partitions.inserts.iter().chain(partitions.updates.iter()) {
            if let Some(chunks) = chunk_map.get(&entity.entity_id) {
                all_chunks.extend(chunks.iter().cloned());
            }
        }
        if !all_chunks.is_empty() {
            for sink in &self.sinks {
                sink.bulk_insert(&all_chunks).await?;
            }
        }

        // Step 5: catalog removals for explicit deletions, idempotent.
        let delete_row_ids: Vec<Uuid> = partitions
            .deletes
            .iter()
            .filter_map(|e| partitions.rows.get(&e.entity_id).map(|row| row.row_id))
            .collect();
        self.catalog.remove_rows(&delete_row_ids)?;

        Ok(())
    }

    fn account(&self, pass: &SyncPass, partitions: &BatchPartitions) -> ProgressSnapshot {
        pass.progress.record_inserted(partitions.inserts.len());
        pass.progress.record_updated(partitions.updates.len());
        pass.progress.record_kept(partitions.keeps.len());
        pass.progress.record_deleted(partitions.deletes.len());
        for _ in &partitions.inserts {
            pass.guard_rail.increment(ChangeAction::Insert);
        }
        for _ in &partitions.updates {
            pass.guard_rail.increment(ChangeAction::Update);
        }
        ProgressSnapshot {
            inserted: partitions.inserts.len(),
            updated: partitions.updates.len(),
            kept: partitions.keeps.len(),
            deleted: partitions.deletes.len(),
            skipped: partitions.skipped,
        }
    }

    /// End-of-pass orphan reconciliation: every catalog row not re-observed
    /// by the pass is purged from all destinations, then from the catalog.
    /// Returns the number of orphans removed.
    pub async fn finish_pass(&self, pass: &SyncPass) -> Result<usize> {
        let rows = self.catalog.rows_for_sync(pass.sync_id())?;
        let orphans: Vec<CatalogRow> = rows
            .into_iter()
            .filter(|row| !pass.was_seen(&row.entity_type, &row.entity_id))
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        log::info!(
            "reconciliation: removing {} orphaned entities for sync {}",
            orphans.len(),
            pass.sync_id()
        );

        for sink in &self.sinks {
            for row in &orphans {
                sink.bulk_delete_by_parent_id(row.row_id, pass.sync_id()).await?;
            }
        }

        let row_ids: Vec<Uuid> = orphans.iter().map(|row| row.row_id).collect();
        self.catalog.remove_rows(&row_ids)?;
        pass.progress.record_deleted(orphans.len());
        Ok(orphans.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::destination::MemorySink;
    use crate::embedding::NullEmbeddingProvider;
    use crate::transform::TransformRouter;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    /// Router that yields one chunk per parent, or fails on demand.
    struct ScriptedRouter {
        fail_ids: HashSet<String>,
        empty_ids: HashSet<String>,
    }

    impl ScriptedRouter {
        fn passthrough() -> Self {
            Self {
                fail_ids: HashSet::new(),
                empty_ids: HashSet::new(),
            }
        }

        fn failing_on(ids: &[&str]) -> Self {
            Self {
                fail_ids: ids.iter().map(|s| s.to_string()).collect(),
                empty_ids: HashSet::new(),
            }
        }

        fn empty_on(ids: &[&str]) -> Self {
            Self {
                fail_ids: HashSet::new(),
                empty_ids: ids.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl TransformRouter for ScriptedRouter {
        async fn transform(&self, parent: &Entity) -> Result<Vec<Chunk>> {
            if self.fail_ids.contains(&parent.entity_id) {
                return Err(StoreError::SyncError("scripted transform failure".into()));
            }
            if self.empty_ids.contains(&parent.entity_id) {
                return Ok(Vec::new());
            }
            Ok(vec![Chunk::derived_from(
                parent,
                0,
                format!("chunk of {}", parent.entity_id),
            )])
        }
    }

    struct Fixture {
        processor: EntityProcessor,
        sink: Arc<MemorySink>,
        catalog: Arc<Catalog>,
        _dir: tempfile::TempDir,
    }

    fn setup(router: ScriptedRouter) -> Fixture {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path());
        let catalog = Arc::new(Catalog::new(&config).unwrap());
        catalog.initialize_schema().unwrap();
        let sink = Arc::new(MemorySink::new("memory"));
        let processor = EntityProcessor::new(
            Arc::clone(&catalog),
            Arc::new(router),
            Arc::new(NullEmbeddingProvider),
            vec![Arc::clone(&sink) as Arc<dyn DestinationSink>],
        );
        Fixture {
            processor,
            sink,
            catalog,
            _dir: dir,
        }
    }

    fn entity(pass: &SyncPass, id: &str, body: &str) -> Entity {
        Entity::new("source", "doc", id, pass.sync_id(), pass.sync_job_id())
            .with_field("body", json!(body))
    }

    #[tokio::test]
    async fn test_first_run_inserts_everything() {
        let fx = setup(ScriptedRouter::passthrough());
        let pass = SyncPass::new(Uuid::new_v4(), Uuid::new_v4());

        let outcome = fx
            .processor
            .process_batch(&pass, vec![entity(&pass, "a", "1"), entity(&pass, "b", "2")])
            .await
            .unwrap();

        assert_eq!(outcome.counts.inserted, 2);
        assert_eq!(outcome.persisted.len(), 2);
        assert_eq!(fx.sink.records().len(), 2);
        assert_eq!(fx.catalog.rows_for_sync(pass.sync_id()).unwrap().len(), 2);
        assert_eq!(pass.guard_rail.consumed(), 2);
    }

    #[tokio::test]
    async fn test_second_run_is_all_keep() {
        let fx = setup(ScriptedRouter::passthrough());
        let sync_id = Uuid::new_v4();

        let first_pass = SyncPass::new(sync_id, Uuid::new_v4());
        fx.processor
            .process_batch(&first_pass, vec![entity(&first_pass, "a", "1")])
            .await
            .unwrap();

        let second_pass = SyncPass::new(sync_id, Uuid::new_v4());
        let outcome = fx
            .processor
            .process_batch(&second_pass, vec![entity(&second_pass, "a", "1")])
            .await
            .unwrap();

        assert_eq!(outcome.counts.kept, 1);
        assert_eq!(outcome.counts.inserted, 0);
        assert!(outcome.persisted.is_empty());
        // KEEP consumes no quota and rewrites nothing.
        assert_eq!(second_pass.guard_rail.consumed(), 0);
        assert_eq!(fx.sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_update_clears_before_insert() {
        let fx = setup(ScriptedRouter::passthrough());
        let sync_id = Uuid::new_v4();

        let first_pass = SyncPass::new(sync_id, Uuid::new_v4());
        fx.processor
            .process_batch(&first_pass, vec![entity(&first_pass, "a", "v1")])
            .await
            .unwrap();
        let row_id = fx.catalog.rows_for_sync(sync_id).unwrap()[0].row_id;

        let second_pass = SyncPass::new(sync_id, Uuid::new_v4());
        let outcome = fx
            .processor
            .process_batch(&second_pass, vec![entity(&second_pass, "a", "v2")])
            .await
            .unwrap();

        assert_eq!(outcome.counts.updated, 1);
        // Row id survives the update; only the hash moves.
        let rows = fx.catalog.rows_for_sync(sync_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_id, row_id);

        // The sink saw the parent cleared before the replacement insert.
        let ops = fx.sink.ops();
        let clear_pos = ops
            .iter()
            .position(|op| matches!(op, crate::destination::SinkOp::DeleteByParent(id) if *id == row_id))
            .expect("clear must happen");
        let insert_pos = ops.len() - 1;
        assert!(matches!(ops[insert_pos], crate::destination::SinkOp::Insert(_)));
        assert!(clear_pos < insert_pos);
        assert_eq!(fx.sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_within_batch_process_once() {
        let fx = setup(ScriptedRouter::passthrough());
        let pass = SyncPass::new(Uuid::new_v4(), Uuid::new_v4());

        let outcome = fx
            .processor
            .process_batch(
                &pass,
                vec![entity(&pass, "a", "1"), entity(&pass, "a", "other")],
            )
            .await
            .unwrap();

        assert_eq!(outcome.counts.inserted, 1);
        assert_eq!(pass.progress.snapshot().skipped, 1);
        assert_eq!(fx.sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_flag_short_circuits() {
        let fx = setup(ScriptedRouter::passthrough());
        let pass = SyncPass::new(Uuid::new_v4(), Uuid::new_v4());

        let outcome = fx
            .processor
            .process_batch(&pass, vec![entity(&pass, "a", "1").as_skipped()])
            .await
            .unwrap();

        assert_eq!(outcome.counts.inserted, 0);
        assert_eq!(pass.progress.snapshot().skipped, 1);
        assert!(fx.sink.records().is_empty());
        assert!(fx.catalog.rows_for_sync(pass.sync_id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_precedence_over_catalog_state() {
        let fx = setup(ScriptedRouter::passthrough());
        let pass = SyncPass::new(Uuid::new_v4(), Uuid::new_v4());

        // No catalog row exists; deletion must still settle as DELETE.
        let outcome = fx
            .processor
            .process_batch(&pass, vec![entity(&pass, "ghost", "x").as_deletion()])
            .await
            .unwrap();

        assert_eq!(outcome.counts.deleted, 1);
        assert!(outcome.persisted.is_empty());
        // Nothing existed, so no destination clear was issued.
        assert!(fx.sink.ops().is_empty());
    }

    #[tokio::test]
    async fn test_transform_failure_drops_parent_without_commit() {
        let fx = setup(ScriptedRouter::failing_on(&["bad"]));
        let pass = SyncPass::new(Uuid::new_v4(), Uuid::new_v4());

        let outcome = fx
            .processor
            .process_batch(
                &pass,
                vec![entity(&pass, "good", "1"), entity(&pass, "bad", "2")],
            )
            .await
            .unwrap();

        assert_eq!(outcome.counts.inserted, 1);
        assert_eq!(outcome.counts.skipped, 1);
        assert!(!outcome.persisted.contains_key("bad"));
        // The failed parent never reached the catalog.
        let rows = fx.catalog.rows_for_sync(pass.sync_id()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "good");
    }

    #[tokio::test]
    async fn test_empty_transform_treated_as_failure() {
        let fx = setup(ScriptedRouter::empty_on(&["hollow"]));
        let pass = SyncPass::new(Uuid::new_v4(), Uuid::new_v4());

        let outcome = fx
            .processor
            .process_batch(&pass, vec![entity(&pass, "hollow", "1")])
            .await
            .unwrap();

        assert_eq!(outcome.counts.inserted, 0);
        assert_eq!(outcome.counts.skipped, 1);
        assert!(fx.catalog.rows_for_sync(pass.sync_id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_reconciliation_removes_unseen_rows() {
        let fx = setup(ScriptedRouter::passthrough());
        let sync_id = Uuid::new_v4();

        let first_pass = SyncPass::new(sync_id, Uuid::new_v4());
        fx.processor
            .process_batch(
                &first_pass,
                vec![entity(&first_pass, "a", "1"), entity(&first_pass, "b", "2")],
            )
            .await
            .unwrap();

        // Next pass only re-observes "a"; "b" went silent.
        let second_pass = SyncPass::new(sync_id, Uuid::new_v4());
        fx.processor
            .process_batch(&second_pass, vec![entity(&second_pass, "a", "1")])
            .await
            .unwrap();

        let removed = fx.processor.finish_pass(&second_pass).await.unwrap();
        assert_eq!(removed, 1);

        let rows = fx.catalog.rows_for_sync(sync_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "a");
        // Destination state shrank to the surviving parent too.
        assert_eq!(fx.sink.records().len(), 1);
        assert_eq!(fx.sink.records()[0].parent_entity_id, "a");

        // A second reconciliation finds nothing left to do.
        assert_eq!(fx.processor.finish_pass(&second_pass).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_finish_pass_with_nothing_stored() {
        let fx = setup(ScriptedRouter::passthrough());
        let pass = SyncPass::new(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(fx.processor.finish_pass(&pass).await.unwrap(), 0);
    }
}
