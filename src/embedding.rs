//! Embedding providers and vector utilities.
//!
//! The model behind [`Embedder`] is loaded lazily, once per process:
//! concurrent callers share the same handle and the initialization runs
//! under a lock, so a burst of ingestion jobs never races the load.
//!
//! Output vectors are always forced to the configured target dimension —
//! truncated when the model returns more components, zero-padded when it
//! returns fewer — so a model/schema dimension mismatch can never fail an
//! ingestion.
//!
//! Providers:
//! - **`ollama`** — POST `{host}/api/embed` with a batch of inputs.
//! - **`hash`** — deterministic character-trigram hashing; no network,
//!   used for offline operation and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::EmbeddingConfig;
use crate::error::PipelineError;

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Embed a batch; one vector per input, same order. Either the whole
    /// batch succeeds or the call errors — never a partial result.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// Process-wide embedding front end: lazy, lock-guarded model load plus
/// dimension forcing on every output vector.
pub struct Embedder {
    config: EmbeddingConfig,
    model: OnceCell<Arc<dyn EmbeddingModel>>,
}

impl Embedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            model: OnceCell::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn model(&self) -> Result<&Arc<dyn EmbeddingModel>, PipelineError> {
        self.model
            .get_or_try_init(|| async { create_model(&self.config) })
            .await
    }

    /// Embed passages for storage. Inputs are trimmed; an empty batch
    /// returns an empty list without touching the model.
    pub async fn embed_passages(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let trimmed: Vec<String> = texts.iter().map(|t| t.trim().to_string()).collect();

        let raw = self.model().await?.embed(&trimmed).await?;
        if raw.len() != trimmed.len() {
            return Err(PipelineError::Embedding(format!(
                "provider returned {} vectors for {} inputs",
                raw.len(),
                trimmed.len()
            )));
        }

        Ok(raw
            .into_iter()
            .map(|v| fit_dimension(v, self.config.dimension))
            .collect())
    }

    /// Embed a query as a single-item batch. A blank query, or a model
    /// that produces no vector, yields `None` — not an error.
    pub async fn embed_query(&self, text: &str) -> Result<Option<Vec<f32>>, PipelineError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let mut vectors = self.embed_passages(&[text.to_string()]).await?;
        Ok(vectors.pop())
    }
}

fn create_model(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingModel>, PipelineError> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedding {
            dimension: config.dimension,
            model: config.model.clone(),
        })),
        "ollama" => Ok(Arc::new(OllamaEmbedding::new(config)?)),
        other => Err(PipelineError::Embedding(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Truncate or zero-pad to exactly `dimension` components.
pub fn fit_dimension(mut vector: Vec<f32>, dimension: usize) -> Vec<f32> {
    vector.truncate(dimension);
    vector.resize(dimension, 0.0);
    vector
}

// ============ Ollama provider ============

pub struct OllamaEmbedding {
    host: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaEmbedding {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;
        Ok(Self {
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedding {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/api/embed", self.host))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Embedding(format!(
                "embedding API error {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                PipelineError::Embedding("invalid response: missing embeddings".to_string())
            })?;

        let mut vectors = Vec::with_capacity(embeddings.len());
        for row in embeddings {
            let vector: Vec<f32> = row
                .as_array()
                .ok_or_else(|| {
                    PipelineError::Embedding("invalid response: embedding not an array".to_string())
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

// ============ Hashing provider ============

/// Character-trigram hashing into a fixed number of buckets, L2
/// normalized. Deterministic and dependency-free; similar strings land on
/// overlapping buckets, which is enough for offline use and tests.
pub struct HashEmbedding {
    dimension: usize,
    model: String,
}

#[async_trait]
impl EmbeddingModel for HashEmbedding {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dimension)).collect())
    }
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0f32; dimension.max(1)];
    let lowered = text.to_lowercase();
    let chars: Vec<char> = lowered.chars().collect();

    if chars.is_empty() {
        return vector;
    }

    for window in chars.windows(3) {
        let token: String = window.iter().collect();
        // FNV-1a over the trigram bytes.
        let mut hash = 1469598103934665603u64;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        let bucket = (hash % vector.len() as u64) as usize;
        vector[bucket] += 1.0;
    }

    let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in &mut vector {
            *v /= magnitude;
        }
    }
    vector
}

// ============ Vector codecs ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;

    fn hash_embedder(dimension: usize) -> Embedder {
        Embedder::new(EmbeddingConfig {
            provider: "hash".into(),
            dimension,
            ..EmbeddingConfig::default()
        })
    }

    #[tokio::test]
    async fn empty_batch_returns_empty_without_model() {
        let embedder = hash_embedder(16);
        let out = embedder.embed_passages(&[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn blank_query_yields_none() {
        let embedder = hash_embedder(16);
        assert!(embedder.embed_query("   ").await.unwrap().is_none());
        assert!(embedder.embed_query("rust").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn every_output_has_target_dimension() {
        for dim in [3, 16, 128] {
            let embedder = hash_embedder(dim);
            let out = embedder
                .embed_passages(&["alpha".into(), "beta gamma delta".into()])
                .await
                .unwrap();
            assert!(out.iter().all(|v| v.len() == dim));
        }
    }

    #[test]
    fn fit_dimension_truncates_and_pads() {
        assert_eq!(fit_dimension(vec![1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(fit_dimension(vec![1.0], 3), vec![1.0, 0.0, 0.0]);
        assert_eq!(fit_dimension(vec![1.0, 2.0], 2), vec![1.0, 2.0]);
        assert_eq!(fit_dimension(Vec::new(), 4), vec![0.0; 4]);
    }

    #[test]
    fn hash_embedding_is_deterministic_and_normalized() {
        let a = hash_embed("Hydraulic pressure and flow", 64);
        let b = hash_embed("Hydraulic pressure and flow", 64);
        assert_eq!(a, b);
        let magnitude: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let q = hash_embed("database migration guide", 128);
        let close = hash_embed("guide to database migrations", 128);
        let far = hash_embed("zebra xylophone quartz", 128);
        assert!(cosine_similarity(&q, &close) > cosine_similarity(&q, &far));
    }

    #[test]
    fn vec_blob_round_trip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        let v = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
