//! Cross-encoder reranking.
//!
//! A cross-encoder scores each `(query, passage)` pair jointly and is
//! only ever applied to a small candidate set. Inference is serialized
//! behind a lock — the backing model is not assumed to tolerate
//! concurrent calls. Reranking is best-effort everywhere: callers catch
//! scoring errors and keep their prior ordering.
//!
//! Providers:
//! - **`lexical`** — query-term overlap count; no network, deterministic.
//! - **`http`** — POST `{host}/api/rerank` with the query and passages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::RerankerConfig;
use crate::error::PipelineError;

#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// One relevance score per passage, same order as the input.
    async fn score_pairs(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<Vec<f32>, PipelineError>;
}

/// Shared reranker handle; a process-wide singleton like the embedding
/// model, with inference serialized across concurrent requests.
pub struct Reranker {
    model: Arc<dyn CrossEncoder>,
    inference_lock: Mutex<()>,
    pub top_k: usize,
}

impl Reranker {
    pub fn new(model: Arc<dyn CrossEncoder>, top_k: usize) -> Self {
        Self {
            model,
            inference_lock: Mutex::new(()),
            top_k,
        }
    }

    pub async fn score(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<Vec<f32>, PipelineError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.inference_lock.lock().await;
        let scores = self.model.score_pairs(query, passages).await?;
        if scores.len() != passages.len() {
            return Err(PipelineError::Rerank(format!(
                "scorer returned {} scores for {} passages",
                scores.len(),
                passages.len()
            )));
        }
        Ok(scores)
    }
}

/// Build the configured reranker; `None` when disabled.
pub fn build_reranker(config: &RerankerConfig) -> Result<Option<Reranker>, PipelineError> {
    let model: Arc<dyn CrossEncoder> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "lexical" => Arc::new(LexicalCrossEncoder),
        "http" => Arc::new(HttpCrossEncoder::new(config)?),
        other => {
            return Err(PipelineError::Rerank(format!(
                "unknown reranker provider: {}",
                other
            )))
        }
    };
    Ok(Some(Reranker::new(model, config.top_k)))
}

// ============ Lexical provider ============

/// Counts how many distinct query terms occur in the passage. Crude, but
/// deterministic and always available.
pub struct LexicalCrossEncoder;

#[async_trait]
impl CrossEncoder for LexicalCrossEncoder {
    async fn score_pairs(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<Vec<f32>, PipelineError> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3)
            .map(|t| t.to_string())
            .collect();

        Ok(passages
            .iter()
            .map(|p| {
                let lowered = p.to_lowercase();
                terms.iter().filter(|t| lowered.contains(t.as_str())).count() as f32
            })
            .collect())
    }
}

// ============ HTTP provider ============

pub struct HttpCrossEncoder {
    host: String,
    model: String,
    client: reqwest::Client,
}

impl HttpCrossEncoder {
    pub fn new(config: &RerankerConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Rerank(e.to_string()))?;
        Ok(Self {
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score_pairs(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<Vec<f32>, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": passages,
        });

        let resp = self
            .client
            .post(format!("{}/api/rerank", self.host))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Rerank(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Rerank(format!(
                "rerank API error {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Rerank(e.to_string()))?;

        let scores = json
            .get("scores")
            .and_then(|s| s.as_array())
            .ok_or_else(|| PipelineError::Rerank("invalid response: missing scores".to_string()))?;

        Ok(scores
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lexical_scores_by_term_overlap() {
        let scorer = LexicalCrossEncoder;
        let scores = scorer
            .score_pairs(
                "password reset procedure",
                &[
                    "How to reset your password".to_string(),
                    "Campus parking map".to_string(),
                ],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn reranker_rejects_short_score_vectors() {
        struct Short;
        #[async_trait]
        impl CrossEncoder for Short {
            async fn score_pairs(
                &self,
                _query: &str,
                _passages: &[String],
            ) -> Result<Vec<f32>, PipelineError> {
                Ok(vec![1.0])
            }
        }

        let reranker = Reranker::new(Arc::new(Short), 3);
        let err = reranker
            .score("q", &["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Rerank(_)));
    }

    #[tokio::test]
    async fn empty_candidate_set_short_circuits() {
        let reranker = Reranker::new(Arc::new(LexicalCrossEncoder), 3);
        assert!(reranker.score("q", &[]).await.unwrap().is_empty());
    }

    #[test]
    fn disabled_provider_builds_none() {
        let cfg = RerankerConfig {
            provider: "disabled".into(),
            ..RerankerConfig::default()
        };
        assert!(build_reranker(&cfg).unwrap().is_none());

        let cfg = RerankerConfig::default();
        assert!(build_reranker(&cfg).unwrap().is_some());
    }
}
