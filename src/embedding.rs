use crate::errors::{Result, StoreError};
use crate::models::SparseVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Dense vector model operating on batches of text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}

/// Optional keyword/sparse model; only consulted when a destination declares
/// a keyword index.
#[async_trait]
pub trait SparseEmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<SparseVector>>;
}

pub struct NullEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for NullEmbeddingProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(vec![vec![]; texts.len()])
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

pub struct OpenAIProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request_payload = OpenAIRequest {
            input: texts,
            model: self.model.clone(),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&request_payload)
            .send()
            .await
            .map_err(|e| StoreError::Embedding(format!("OpenAI API request failed: {}", e)))?;

        if !response.status().is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StoreError::Embedding(format!(
                "OpenAI API returned an error: {}",
                error_body
            )));
        }

        let openai_response = response.json::<OpenAIResponse>().await.map_err(|e| {
            StoreError::Embedding(format!("Failed to parse OpenAI response: {}", e))
        })?;

        // The API may reorder entries; restore request order.
        let mut data = openai_response.data;
        data.sort_by_key(|entry| entry.index);
        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }
}

/// Deterministic term-frequency sparse encoder. Tokens are lowercased,
/// hashed into a fixed vocabulary, and weighted by in-text frequency.
pub struct HashingSparseProvider {
    buckets: u32,
}

impl HashingSparseProvider {
    pub fn new(buckets: u32) -> Result<Self> {
        if buckets == 0 {
            return Err(StoreError::InvalidArg(
                "sparse bucket count must be nonzero".into(),
            ));
        }
        Ok(Self { buckets })
    }

    fn bucket(&self, token: &str) -> u32 {
        let digest = Sha256::digest(token.as_bytes());
        let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        raw % self.buckets
    }

    fn encode(&self, text: &str) -> SparseVector {
        let mut counts = std::collections::BTreeMap::new();
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            *counts.entry(self.bucket(&token.to_lowercase())).or_insert(0u32) += 1;
        }
        let mut indices = Vec::with_capacity(counts.len());
        let mut values = Vec::with_capacity(counts.len());
        for (index, count) in counts {
            indices.push(index);
            values.push(count as f32);
        }
        SparseVector { indices, values }
    }
}

impl Default for HashingSparseProvider {
    fn default() -> Self {
        Self { buckets: 1 << 18 }
    }
}

#[async_trait]
impl SparseEmbeddingProvider for HashingSparseProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<SparseVector>> {
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::FastEmbedProvider;

#[cfg(feature = "local-embeddings")]
mod local {
    use super::*;
    use fastembed::{InitOptions, TextEmbedding};
    use std::sync::{Arc, Mutex};
    use tokio::task;

    /// Local ONNX embedding model, offloaded to the blocking pool because
    /// inference is CPU-bound.
    pub struct FastEmbedProvider {
        model: Arc<Mutex<TextEmbedding>>,
    }

    impl FastEmbedProvider {
        pub fn new_default() -> Result<Self> {
            Self::new_with_options(Default::default())
        }

        pub fn new_with_options(options: InitOptions) -> Result<Self> {
            let embedding = TextEmbedding::try_new(options).map_err(|e| {
                StoreError::Embedding(format!("Failed to initialize FastEmbed model: {}", e))
            })?;
            Ok(Self {
                model: Arc::new(Mutex::new(embedding)),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FastEmbedProvider {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }

            let model = Arc::clone(&self.model);
            let embeddings = task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut guard = model
                    .lock()
                    .map_err(|_| StoreError::Embedding("FastEmbed model mutex poisoned".into()))?;
                let document_refs: Vec<_> = texts.iter().map(|s| s.as_str()).collect();
                guard
                    .embed(document_refs, None)
                    .map_err(|e| StoreError::Embedding(format!("FastEmbed embedding failed: {}", e)))
            })
            .await
            .map_err(|e| StoreError::Embedding(format!("FastEmbed task join error: {}", e)))??;

            Ok(embeddings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_provider_preserves_cardinality() {
        let provider = NullEmbeddingProvider;
        let out = provider
            .embed(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_hashing_sparse_is_deterministic() {
        let provider = HashingSparseProvider::default();
        let first = provider.embed(vec!["alpha beta alpha".to_string()]).await.unwrap();
        let second = provider.embed(vec!["alpha beta alpha".to_string()]).await.unwrap();
        assert_eq!(first, second);

        let vector = &first[0];
        // Two distinct tokens, one of them twice.
        assert_eq!(vector.indices.len(), 2);
        assert!(vector.values.contains(&2.0));
        assert!(vector.values.contains(&1.0));
    }

    #[tokio::test]
    async fn test_hashing_sparse_ignores_case_and_punctuation() {
        let provider = HashingSparseProvider::default();
        let out = provider
            .embed(vec!["Alpha, beta!".to_string(), "alpha beta".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn test_zero_buckets_rejected() {
        assert!(HashingSparseProvider::new(0).is_err());
    }
}
