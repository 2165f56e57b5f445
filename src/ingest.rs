//! Per-document ingestion: blob bytes → parsed text → passages →
//! embeddings → stored chunks.
//!
//! Chunks are replaced wholesale (delete-then-insert, one transaction)
//! so re-running an ingestion — including a duplicate task delivery —
//! converges on the same state. Any failure marks the document `failed`
//! with a truncated human-readable error and propagates to the job
//! orchestrator.

use anyhow::{anyhow, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::chunk::split_passages;
use crate::config::Config;
use crate::db;
use crate::embedding::{vec_to_blob, Embedder};
use crate::error::PipelineError;
use crate::models::{merge_metadata, Document, DocumentStatus};
use crate::parse;

const TEXT_PREVIEW_CHARS: usize = 500;
const ERROR_TRUNCATE_CHARS: usize = 1000;

/// Run one document ingestion. On failure the document is re-marked
/// `failed` in a fresh write before the error is returned to the caller.
pub async fn ingest_document(
    pool: &SqlitePool,
    blob: &dyn BlobStore,
    embedder: &Embedder,
    config: &Config,
    document_id: &str,
) -> Result<()> {
    match ingest_inner(pool, blob, embedder, config, document_id).await {
        Ok(outcome) => {
            if let IngestOutcome::Completed { chunk_count } = outcome {
                info!(document_id, chunk_count, "document ingested");
            }
            Ok(())
        }
        Err(e) => {
            mark_document_failed(pool, document_id, &e.to_string()).await;
            Err(e)
        }
    }
}

enum IngestOutcome {
    Completed { chunk_count: usize },
    Skipped,
}

async fn ingest_inner(
    pool: &SqlitePool,
    blob: &dyn BlobStore,
    embedder: &Embedder,
    config: &Config,
    document_id: &str,
) -> Result<IngestOutcome> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("document {} not found", document_id));
    };
    let document = Document::from_row(&row);

    if document.is_deleted() {
        warn!(document_id, "skipping ingestion of deleted document");
        return Ok(IngestOutcome::Skipped);
    }

    let status = document
        .status_enum()
        .ok_or_else(|| anyhow!("document {} has unknown status {}", document_id, document.status))?;
    // Status gate: only re-enterable states proceed. A concurrent or
    // duplicate delivery sees `processing` here and backs off.
    if !status.can_transition(DocumentStatus::Processing) {
        warn!(
            document_id,
            status = document.status.as_str(),
            "document not ready for ingestion; skipping"
        );
        return Ok(IngestOutcome::Skipped);
    }

    sqlx::query("UPDATE documents SET status = ?, error = NULL, updated_at = ? WHERE id = ?")
        .bind(DocumentStatus::Processing.as_str())
        .bind(db::now())
        .bind(document_id)
        .execute(pool)
        .await?;

    let bytes = blob.get(&document.uri).await?;
    let parsed = parse::extract_text(&bytes, &document.content_type)?;

    let passages = split_passages(
        &parsed.text,
        config.chunking.window_chars,
        config.chunking.overlap_chars,
    );

    let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
    let vectors = embedder.embed_passages(&texts).await?;
    if vectors.len() != passages.len() {
        return Err(PipelineError::EmbeddingMismatch {
            expected: passages.len(),
            actual: vectors.len(),
        }
        .into());
    }

    let metadata = document.metadata();
    let source_url = metadata
        .get("source_url")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Replace chunks atomically: the old set disappears with the new set
    // in the same transaction, never a partial update.
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    let now = db::now();
    for (passage, vector) in passages.iter().zip(vectors.iter()) {
        let chunk_metadata = match &source_url {
            Some(url) => serde_json::json!({ "source_url": url }).to_string(),
            None => "{}".to_string(),
        };
        sqlx::query(
            r#"
            INSERT INTO chunks
                (id, document_id, namespace_id, ordinal, text, headings_json,
                 token_count, embedding, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(&document.namespace_id)
        .bind(passage.ordinal)
        .bind(&passage.text)
        .bind(serde_json::to_string(&passage.headings)?)
        .bind(passage.token_estimate)
        .bind(vec_to_blob(vector))
        .bind(chunk_metadata)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    // Finalize: preview, chunk count, ingested status.
    let preview: String = parsed.text.chars().take(TEXT_PREVIEW_CHARS).collect();
    let mut metadata = document.metadata();
    let mut incoming = serde_json::Map::new();
    incoming.insert("chunk_count".to_string(), Value::from(passages.len()));
    merge_metadata(&mut metadata, incoming);

    let title = document.title.or(parsed.title);

    sqlx::query(
        r#"
        UPDATE documents
        SET status = ?, error = NULL, text_preview = ?, metadata_json = ?,
            title = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(DocumentStatus::Ingested.as_str())
    .bind(preview)
    .bind(Value::Object(metadata).to_string())
    .bind(title)
    .bind(db::now())
    .bind(document_id)
    .execute(pool)
    .await?;

    Ok(IngestOutcome::Completed {
        chunk_count: passages.len(),
    })
}

/// Best-effort failure mark in a fresh write; the original error wins
/// even if this bookkeeping write fails too.
async fn mark_document_failed(pool: &SqlitePool, document_id: &str, error: &str) {
    let truncated = truncate_error(error);
    let result =
        sqlx::query("UPDATE documents SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(DocumentStatus::Failed.as_str())
            .bind(&truncated)
            .bind(db::now())
            .bind(document_id)
            .execute(pool)
            .await;
    if let Err(e) = result {
        warn!(document_id, error = %e, "failed to record document failure");
    }
}

/// Human-readable errors are capped before they land in a row.
pub fn truncate_error(error: &str) -> String {
    error.chars().take(ERROR_TRUNCATE_CHARS).collect()
}

/// Soft-delete a document and drop its chunks. The row survives for
/// audit; retrieval filters it out via status and `deleted_at`.
pub async fn soft_delete_document(pool: &SqlitePool, document_id: &str) -> Result<bool> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(false);
    };
    let document = Document::from_row(&row);
    if document.is_deleted() {
        return Ok(false);
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE documents SET status = ?, error = NULL, text_preview = NULL, deleted_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(DocumentStatus::Deleted.as_str())
    .bind(db::now())
    .bind(db::now())
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}
