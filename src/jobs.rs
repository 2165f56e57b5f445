//! Asynchronous job orchestration: `queued → running → succeeded | failed`.
//!
//! The `jobs` table is the dispatcher: enqueueing is an insert, the
//! handle is the row id, and a status-gated claim tolerates at-least-once
//! delivery. Workers drain queued jobs concurrently; a crawl job fans
//! out ingestion jobs that the same drain loop picks up on its next
//! poll. Failures are contained per job — marked on the row, logged,
//! never re-raised into the worker.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::crawl;
use crate::db;
use crate::embedding::Embedder;
use crate::ingest;
use crate::models::{Job, JobStatus, TaskType};

/// Create a `crawl` job. Depth is clamped into the supported bound at
/// enqueue time so the payload always reflects what will actually run.
pub async fn enqueue_crawl(
    pool: &SqlitePool,
    namespace_id: &str,
    url: &str,
    depth: u32,
) -> Result<String> {
    let depth = depth.min(crawl::MAX_DEPTH_BOUND);
    let payload = serde_json::json!({ "url": url, "depth": depth });
    insert_job(pool, namespace_id, TaskType::Crawl, &payload).await
}

/// Create a `document_ingest` job for one document.
pub async fn enqueue_ingest(
    pool: &SqlitePool,
    namespace_id: &str,
    document_id: &str,
) -> Result<String> {
    let payload = serde_json::json!({ "document_id": document_id });
    insert_job(pool, namespace_id, TaskType::DocumentIngest, &payload).await
}

async fn insert_job(
    pool: &SqlitePool,
    namespace_id: &str,
    task_type: TaskType,
    payload: &Value,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO jobs (id, namespace_id, task_type, status, payload_json, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(namespace_id)
    .bind(task_type.as_str())
    .bind(JobStatus::Queued.as_str())
    .bind(payload.to_string())
    .bind(db::now())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Background task executor shared by every worker.
pub struct JobRunner {
    pool: SqlitePool,
    blob: Arc<dyn BlobStore>,
    embedder: Arc<Embedder>,
    config: Config,
}

impl JobRunner {
    pub fn new(
        pool: SqlitePool,
        blob: Arc<dyn BlobStore>,
        embedder: Arc<Embedder>,
        config: Config,
    ) -> Self {
        Self {
            pool,
            blob,
            embedder,
            config,
        }
    }

    /// Drain the queue: claim and run queued jobs with the configured
    /// worker concurrency, re-polling until nothing is left (so jobs
    /// fanned out by a running crawl get picked up too). Returns the
    /// number of jobs executed.
    pub async fn run_pending(&self) -> Result<u64> {
        let mut executed = 0u64;
        loop {
            let ids: Vec<String> = sqlx::query_scalar(
                "SELECT id FROM jobs WHERE status = ? ORDER BY created_at ASC",
            )
            .bind(JobStatus::Queued.as_str())
            .fetch_all(&self.pool)
            .await?;

            if ids.is_empty() {
                return Ok(executed);
            }

            executed += ids.len() as u64;
            futures::stream::iter(ids)
                .for_each_concurrent(self.config.jobs.workers, |id| async move {
                    self.run_job(&id).await;
                })
                .await;
        }
    }

    /// Execute one job to completion. Never returns an error: a failure
    /// lands on the job row (and, for ingestion, the document) and is
    /// swallowed here so the worker does not retry indefinitely.
    pub async fn run_job(&self, job_id: &str) {
        let job = match self.claim(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return, // already claimed or finished elsewhere
            Err(e) => {
                error!(job_id, error = %e, "failed to claim job");
                return;
            }
        };

        let outcome = self.execute(&job).await;
        match outcome {
            Ok(final_payload) => {
                if let Err(e) = self.finish(job_id, final_payload).await {
                    error!(job_id, error = %e, "failed to record job success");
                }
            }
            Err(e) => {
                warn!(job_id, task_type = %job.task_type, error = %e, "job failed");
                self.mark_failed(job_id, &e.to_string()).await;
            }
        }
    }

    /// Status-gated claim: flips `queued` to `running` and clears any
    /// prior error. Zero rows affected means another worker won.
    async fn claim(&self, job_id: &str) -> Result<Option<Job>> {
        let claimed = sqlx::query(
            "UPDATE jobs SET status = ?, error = NULL, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Running.as_str())
        .bind(db::now())
        .bind(job_id)
        .bind(JobStatus::Queued.as_str())
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Job::from_row))
    }

    /// Dispatch by task type. Returns the payload to write back on
    /// success (`None` keeps the existing payload).
    async fn execute(&self, job: &Job) -> Result<Option<Value>> {
        let task_type = TaskType::parse(&job.task_type)
            .ok_or_else(|| anyhow!("unknown task type: {}", job.task_type))?;
        let payload = job.payload();

        match task_type {
            TaskType::Crawl => {
                let url = payload
                    .get("url")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("crawl job {} missing url", job.id))?;
                let depth = payload
                    .get("depth")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;

                info!(job_id = %job.id, url = %url, depth, "crawl started");
                let summary = crawl::run_crawl(
                    &self.pool,
                    self.blob.as_ref(),
                    &self.config.crawler,
                    &job.id,
                    &job.namespace_id,
                    url,
                    depth,
                )
                .await?;
                info!(
                    job_id = %job.id,
                    total = summary.total,
                    harvested = summary.harvested,
                    failed = summary.failed,
                    blocked = summary.blocked,
                    skipped = summary.skipped,
                    "crawl finished"
                );

                // The final payload is the summary alongside the request.
                Ok(Some(serde_json::json!({
                    "url": url,
                    "depth": depth,
                    "total": summary.total,
                    "harvested": summary.harvested,
                    "failed": summary.failed,
                    "blocked": summary.blocked,
                    "skipped": summary.skipped,
                })))
            }
            TaskType::DocumentIngest => {
                let document_id = payload
                    .get("document_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("ingest job {} missing document_id", job.id))?;

                ingest::ingest_document(
                    &self.pool,
                    self.blob.as_ref(),
                    &self.embedder,
                    &self.config,
                    document_id,
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn finish(&self, job_id: &str, payload: Option<Value>) -> Result<()> {
        match payload {
            Some(payload) => {
                sqlx::query(
                    "UPDATE jobs SET status = ?, error = NULL, payload_json = ?, updated_at = ? WHERE id = ?",
                )
                .bind(JobStatus::Succeeded.as_str())
                .bind(payload.to_string())
                .bind(db::now())
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE jobs SET status = ?, error = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(JobStatus::Succeeded.as_str())
                .bind(db::now())
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Fresh failure write after whatever the task half-did; already-
    /// harvested documents and fanned-out jobs stay untouched.
    async fn mark_failed(&self, job_id: &str, error: &str) {
        let truncated = ingest::truncate_error(error);
        let result =
            sqlx::query("UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
                .bind(JobStatus::Failed.as_str())
                .bind(&truncated)
                .bind(db::now())
                .bind(job_id)
                .execute(&self.pool)
                .await;
        if let Err(e) = result {
            error!(job_id, error = %e, "failed to record job failure");
        }
    }
}
