use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Sources that report no timestamp get one this far in the past, so the
/// record is treated as stale unless proven otherwise.
const UPDATED_AT_FALLBACK_DAYS: i64 = 14;

/// One logical record yielded by a source connector.
///
/// System metadata is a closed set of typed fields; only the source-defined
/// payload stays dynamic (`fields`). `db_row_id` is assigned by the pipeline
/// once the catalog row for this entity exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub entity_type: String,
    pub source_name: String,
    pub sync_id: Uuid,
    pub sync_job_id: Uuid,
    pub db_row_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
    pub deletion_marker: bool,
    pub should_skip: bool,
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(
        source_name: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        sync_id: Uuid,
        sync_job_id: Uuid,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            source_name: source_name.into(),
            sync_id,
            sync_job_id,
            db_row_id: None,
            updated_at: default_updated_at(),
            deletion_marker: false,
            should_skip: false,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Harmonizes a source-reported timestamp onto the entity; `None` keeps
    /// the staleness fallback.
    pub fn with_updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> Self {
        if let Some(ts) = updated_at {
            self.updated_at = ts;
        }
        self
    }

    pub fn as_deletion(mut self) -> Self {
        self.deletion_marker = true;
        self
    }

    pub fn as_skipped(mut self) -> Self {
        self.should_skip = true;
        self
    }
}

pub fn default_updated_at() -> DateTime<Utc> {
    Utc::now() - Duration::days(UPDATED_AT_FALLBACK_DAYS)
}

/// A derived, embeddable sub-record produced from exactly one parent entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub parent_entity_id: String,
    pub entity_type: String,
    pub sync_id: Uuid,
    pub db_row_id: Option<Uuid>,
    pub text: String,
    pub fields: Map<String, Value>,
    pub dense_vector: Option<Vec<f32>>,
    pub sparse_vector: Option<SparseVector>,
}

impl Chunk {
    /// Builds a chunk derived from `parent` at position `ordinal`. The chunk
    /// id is stable across passes for an unchanged parent.
    pub fn derived_from(parent: &Entity, ordinal: usize, text: impl Into<String>) -> Self {
        Self {
            chunk_id: stable_chunk_id(&parent.entity_id, ordinal),
            parent_entity_id: parent.entity_id.clone(),
            entity_type: parent.entity_type.clone(),
            sync_id: parent.sync_id,
            db_row_id: parent.db_row_id,
            text: text.into(),
            fields: Map::new(),
            dense_vector: None,
            sparse_vector: None,
        }
    }
}

/// Deterministic chunk identity: v5 uuid over "parent_entity_id|ordinal".
pub fn stable_chunk_id(parent_entity_id: &str, ordinal: usize) -> Uuid {
    let name = format!("{}|{}", parent_entity_id, ordinal);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Keyword-index weights paired with vocabulary positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

/// One durable catalog row per `(sync_id, entity_id)`.
#[derive(Debug, Clone)]
pub struct CatalogRow {
    pub row_id: Uuid,
    pub sync_id: Uuid,
    pub entity_id: String,
    pub entity_type: String,
    pub hash: String,
}

/// Outcome of change-action determination for one parent entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Insert,
    Update,
    Keep,
    Delete,
    Skip,
}
