use crate::errors::Result;
use crate::models::Chunk;
use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

/// A pluggable vector/search store receiving chunk records.
///
/// Sinks are not assumed to support atomic replace; the pipeline always
/// clears a parent's chunks (`bulk_delete_by_parent_id`) before inserting
/// replacements.
#[async_trait]
pub trait DestinationSink: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this sink maintains a keyword/sparse index. When no sink
    /// does, the sparse embedding stage is skipped entirely.
    fn has_keyword_index(&self) -> bool {
        false
    }

    async fn bulk_insert(&self, chunks: &[Chunk]) -> Result<()>;

    /// Remove specific chunk records by chunk identity.
    async fn bulk_delete(&self, chunk_ids: &[Uuid], sync_id: Uuid) -> Result<()>;

    /// Remove every chunk belonging to one parent catalog row.
    async fn bulk_delete_by_parent_id(&self, parent_id: Uuid, sync_id: Uuid) -> Result<()>;
}

/// Operations observed by [`MemorySink`], in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkOp {
    Insert(Vec<Uuid>),
    Delete(Vec<Uuid>),
    DeleteByParent(Uuid),
}

/// In-memory reference sink. Backs the smoke binary and doubles as the
/// observable mock in integration tests.
#[derive(Default)]
pub struct MemorySink {
    name: String,
    keyword_index: bool,
    state: Mutex<MemorySinkState>,
}

#[derive(Default)]
struct MemorySinkState {
    records: Vec<Chunk>,
    ops: Vec<SinkOp>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keyword_index: false,
            state: Mutex::default(),
        }
    }

    pub fn with_keyword_index(mut self) -> Self {
        self.keyword_index = true;
        self
    }

    pub fn records(&self) -> Vec<Chunk> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn ops(&self) -> Vec<SinkOp> {
        self.state.lock().unwrap().ops.clone()
    }
}

#[async_trait]
impl DestinationSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_keyword_index(&self) -> bool {
        self.keyword_index
    }

    async fn bulk_insert(&self, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(SinkOp::Insert(chunks.iter().map(|c| c.chunk_id).collect()));
        state.records.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn bulk_delete(&self, chunk_ids: &[Uuid], sync_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(SinkOp::Delete(chunk_ids.to_vec()));
        state
            .records
            .retain(|c| c.sync_id != sync_id || !chunk_ids.contains(&c.chunk_id));
        Ok(())
    }

    async fn bulk_delete_by_parent_id(&self, parent_id: Uuid, sync_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(SinkOp::DeleteByParent(parent_id));
        state
            .records
            .retain(|c| c.sync_id != sync_id || c.db_row_id != Some(parent_id));
        Ok(())
    }
}
