use std::sync::Arc;

use serde_json::json;
use syncstore::{
    config::StorageConfig,
    destination::{DestinationSink, MemorySink},
    embedding::{HashingSparseProvider, NullEmbeddingProvider},
    models::Entity,
    transform::ParagraphRouter,
    SyncStore,
};
use tempfile::tempdir;
use uuid::Uuid;

fn page(sync_id: Uuid, job_id: Uuid, id: &str, body: &str) -> Entity {
    Entity::new("smoke", "page", id, sync_id, job_id).with_field("body", json!(body))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default());
    let _ = logger.try_init();

    println!("🔄 Entity pipeline smoke-test");
    println!("=============================\n");

    let temp_dir = tempdir()?;
    let config = StorageConfig::new(temp_dir.path());
    let store = SyncStore::new(config).await?;

    let sink = Arc::new(MemorySink::new("memory").with_keyword_index());
    let processor = store
        .processor(
            Arc::new(ParagraphRouter::new("body")),
            Arc::new(NullEmbeddingProvider),
            vec![Arc::clone(&sink) as Arc<dyn DestinationSink>],
        )
        .with_sparse_embedder(Arc::new(HashingSparseProvider::default()));

    let sync_id = Uuid::new_v4();

    println!("➡️  Pass 1: initial ingest");
    let job_1 = Uuid::new_v4();
    let pass = store.begin_pass(sync_id, job_1);
    processor
        .process_batch(
            &pass,
            vec![
                page(sync_id, job_1, "intro", "Welcome.\n\nThis is the intro page."),
                page(sync_id, job_1, "faq", "Q: why?\n\nA: because."),
            ],
        )
        .await?;
    processor.finish_pass(&pass).await?;
    println!("  - progress: {:?}", pass.progress.snapshot());
    println!("  - destination records: {}", sink.records().len());

    println!("➡️  Pass 2: one change, one silent disappearance");
    let job_2 = Uuid::new_v4();
    let pass = store.begin_pass(sync_id, job_2);
    processor
        .process_batch(
            &pass,
            vec![page(
                sync_id,
                job_2,
                "intro",
                "Welcome.\n\nThis intro was rewritten.",
            )],
        )
        .await?;
    let orphans = processor.finish_pass(&pass).await?;
    println!("  - progress: {:?}", pass.progress.snapshot());
    println!("  - orphans reconciled: {orphans}");
    println!("  - destination records: {}", sink.records().len());
    println!("  - quota consumed: {}", pass.guard_rail.consumed());

    println!("✅ catalog state verified");
    let rows = store.catalog.rows_for_sync(sync_id)?;
    for row in &rows {
        println!("  - {} ({}) hash {}", row.entity_id, row.entity_type, &row.hash[..12]);
    }
    assert_eq!(rows.len(), 1);

    println!("\n🎉 Entity pipeline smoke-test completed successfully");
    Ok(())
}
