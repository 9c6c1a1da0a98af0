use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub catalog_path: PathBuf,
}

impl StorageConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            catalog_path: base_path.join("catalog.sqlite"),
        }
    }
}

/// Tunables for one batch run through the entity pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound on concurrently in-flight hash computations and
    /// transform invocations within a batch.
    pub max_workers: usize,
    /// Ceiling on texts submitted to an embedding provider in one call.
    pub embedding_batch_ceiling: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_workers: 8,
            embedding_batch_ceiling: 2048,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let config = StorageConfig::new("/tmp/syncstore");
        assert_eq!(
            config.catalog_path,
            PathBuf::from("/tmp/syncstore/catalog.sqlite")
        );
    }

    #[test]
    fn test_pipeline_defaults() {
        let options = PipelineOptions::default();
        assert_eq!(options.max_workers, 8);
        assert!(options.embedding_batch_ceiling > 0);
    }
}
