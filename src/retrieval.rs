//! Namespace-scoped vector retrieval.
//!
//! Embeds the query as a single-item batch, fetches the candidate rows
//! (chunks of ingested, non-deleted documents in the namespace), and
//! orders them by cosine similarity in-process — the store's
//! `ORDER BY cosine_distance(...) LIMIT n` contract for SQLite. When a
//! reranker is supplied, the pool widens to
//! `top_k * candidate_multiplier` before rescoring; a reranker failure
//! silently keeps the similarity ordering.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, Embedder};
use crate::models::DocumentStatus;
use crate::rerank::Reranker;

/// One retrieval candidate, small enough to pass through every chain
/// stage by value.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub namespace_id: String,
    pub ordinal: i64,
    pub text: String,
    pub headings: Vec<String>,
    pub source_url: Option<String>,
    pub score: f32,
}

/// Similarity search over a namespace's ingested chunks.
pub async fn search_chunks(
    pool: &SqlitePool,
    embedder: &Embedder,
    config: &RetrievalConfig,
    reranker: Option<&Reranker>,
    namespace_id: &str,
    query: &str,
) -> Result<Vec<ScoredChunk>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let Some(query_vector) = embedder.embed_query(query).await? else {
        return Ok(Vec::new());
    };

    let mut candidates = fetch_candidates(pool, namespace_id, &query_vector).await?;

    let pool_size = match reranker {
        Some(_) => config.top_k * config.candidate_multiplier,
        None => config.top_k,
    };
    candidates.truncate(pool_size);

    if let Some(reranker) = reranker {
        let passages: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        match reranker.score(query, &passages).await {
            Ok(scores) => {
                for (candidate, score) in candidates.iter_mut().zip(scores.iter()) {
                    candidate.score = *score;
                }
                candidates.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            Err(e) => {
                // Best-effort: the similarity ordering stands.
                warn!(error = %e, "rerank failed; keeping similarity order");
            }
        }
    }

    candidates.truncate(config.top_k);
    Ok(candidates)
}

/// Scoped candidate fetch, most similar first.
async fn fetch_candidates(
    pool: &SqlitePool,
    namespace_id: &str,
    query_vector: &[f32],
) -> Result<Vec<ScoredChunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id, c.namespace_id, c.ordinal,
               c.text, c.headings_json, c.metadata_json, c.embedding
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE c.namespace_id = ?
          AND d.status = ?
          AND d.deleted_at IS NULL
          AND c.embedding IS NOT NULL
        "#,
    )
    .bind(namespace_id)
    .bind(DocumentStatus::Ingested.as_str())
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<ScoredChunk> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let similarity = cosine_similarity(query_vector, &vector);

            let headings: Vec<String> = row
                .get::<Option<String>, _>("headings_json")
                .and_then(|h| serde_json::from_str(&h).ok())
                .unwrap_or_default();
            let source_url = row
                .get::<Option<String>, _>("metadata_json")
                .and_then(|m| serde_json::from_str::<serde_json::Value>(&m).ok())
                .and_then(|v| {
                    v.get("source_url")
                        .and_then(|u| u.as_str())
                        .map(|u| u.to_string())
                });

            ScoredChunk {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                namespace_id: row.get("namespace_id"),
                ordinal: row.get("ordinal"),
                text: row.get("text"),
                headings,
                source_url,
                score: similarity,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(candidates)
}
