use crate::errors::Result;
use crate::models::{Chunk, Entity};
use async_trait::async_trait;

/// Routing seam between a parent entity and its derived chunk records.
///
/// Implementations may fan one parent out into any number of chunks, or fail
/// for that parent alone; the pipeline treats an error and an empty result
/// the same way (the parent is dropped from the batch and never committed).
#[async_trait]
pub trait TransformRouter: Send + Sync {
    async fn transform(&self, parent: &Entity) -> Result<Vec<Chunk>>;
}

/// Reference router: splits one designated text field into paragraph chunks.
pub struct ParagraphRouter {
    text_field: String,
}

impl ParagraphRouter {
    pub fn new(text_field: impl Into<String>) -> Self {
        Self {
            text_field: text_field.into(),
        }
    }
}

#[async_trait]
impl TransformRouter for ParagraphRouter {
    async fn transform(&self, parent: &Entity) -> Result<Vec<Chunk>> {
        let Some(text) = parent.fields.get(&self.text_field).and_then(|v| v.as_str()) else {
            return Ok(Vec::new());
        };

        Ok(text
            .split("\n\n")
            .map(str::trim)
            .filter(|paragraph| !paragraph.is_empty())
            .enumerate()
            .map(|(ordinal, paragraph)| Chunk::derived_from(parent, ordinal, paragraph))
            .collect())
    }
}
