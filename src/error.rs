//! Failure taxonomy for the ingestion and retrieval pipeline.
//!
//! Per-URL and per-document failures are contained and recorded on the
//! owning row (CrawlResult, Document); only job bookkeeping failures
//! surface through the orchestrator, which marks the job `failed` rather
//! than crashing the worker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Content extraction failed for every applicable extractor.
    /// The owning document ends up in `failed` status.
    #[error("parse error: {0}")]
    Parse(String),

    /// The embedding provider returned a different number of vectors
    /// than passages submitted. Aborts the ingestion.
    #[error("embedding count mismatch: expected {expected}, got {actual}")]
    EmbeddingMismatch { expected: usize, actual: usize },

    /// Embedding provider call failed (network, bad response shape).
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Network-level fetch failure during a crawl. Recorded on the
    /// CrawlResult as `failed`; never aborts the crawl.
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The server answered with an error status (>= 400).
    #[error("HTTP {status} while fetching {url}")]
    HttpStatus { status: u16, url: String },

    /// Blob store round-trip failure.
    #[error("blob store error: {0}")]
    Blob(String),

    /// A document or job was asked to move along an edge the state
    /// machine does not allow.
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Cross-encoder scoring failed. Callers catch this and fall back
    /// to the prior ordering; it is never surfaced to the query caller.
    #[error("rerank error: {0}")]
    Rerank(String),
}
