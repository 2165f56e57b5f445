//! Core data models for the ingestion and retrieval pipeline.
//!
//! Namespaces own documents, chunks, jobs, and conversations. Documents
//! own their chunks (cascade delete); jobs own their crawl results. A
//! crawl result references a document without owning it.

use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::PipelineError;

/// Document lifecycle: `uploading → uploaded → processing → ingested | failed`,
/// with `deleted` reachable from anywhere (soft delete). Re-ingestion
/// re-enters `processing` from `ingested` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Uploading,
    Uploaded,
    Processing,
    Ingested,
    Failed,
    Deleted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ingested => "ingested",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(DocumentStatus::Uploading),
            "uploaded" => Some(DocumentStatus::Uploaded),
            "processing" => Some(DocumentStatus::Processing),
            "ingested" => Some(DocumentStatus::Ingested),
            "failed" => Some(DocumentStatus::Failed),
            "deleted" => Some(DocumentStatus::Deleted),
            _ => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition(self, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        if to == Deleted {
            return true;
        }
        matches!(
            (self, to),
            (Uploading, Uploaded)
                | (Uploaded, Processing)
                | (Ingested, Processing)
                | (Failed, Processing)
                | (Processing, Ingested)
                | (Processing, Failed)
        )
    }

    /// Validated transition; errors carry both endpoints for the log.
    pub fn transition(self, to: DocumentStatus) -> Result<DocumentStatus, PipelineError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(PipelineError::InvalidTransition {
                entity: "document",
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

/// Job lifecycle: `queued → running → succeeded | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Kind of asynchronous work a job row drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Crawl,
    DocumentIngest,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Crawl => "crawl",
            TaskType::DocumentIngest => "document_ingest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crawl" => Some(TaskType::Crawl),
            "document_ingest" => Some(TaskType::DocumentIngest),
            _ => None,
        }
    }
}

/// Terminal outcome of one visited URL within a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    Pending,
    Harvested,
    Failed,
    Blocked,
    Skipped,
}

impl CrawlOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlOutcome::Pending => "pending",
            CrawlOutcome::Harvested => "harvested",
            CrawlOutcome::Failed => "failed",
            CrawlOutcome::Blocked => "blocked",
            CrawlOutcome::Skipped => "skipped",
        }
    }
}

/// Tenant boundary. Every document, chunk, job, and conversation belongs
/// to exactly one namespace.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
}

impl Namespace {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            slug: row.get("slug"),
            name: row.get("name"),
            description: row.get("description"),
            created_at: row.get("created_at"),
        }
    }
}

/// A source unit: an uploaded file or a crawl-harvested page. The `uri`
/// is the blob-store object key holding the raw bytes.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub namespace_id: String,
    pub uri: String,
    pub title: Option<String>,
    pub content_type: String,
    pub status: String,
    pub error: Option<String>,
    pub text_preview: Option<String>,
    pub metadata_json: String,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl Document {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            namespace_id: row.get("namespace_id"),
            uri: row.get("uri"),
            title: row.get("title"),
            content_type: row.get("content_type"),
            status: row.get("status"),
            error: row.get("error"),
            text_preview: row.get("text_preview"),
            metadata_json: row.get("metadata_json"),
            deleted_at: row.get("deleted_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub fn status_enum(&self) -> Option<DocumentStatus> {
        DocumentStatus::parse(&self.status)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some() || self.status == DocumentStatus::Deleted.as_str()
    }

    /// Parsed metadata object; malformed JSON degrades to an empty map.
    pub fn metadata(&self) -> Map<String, Value> {
        serde_json::from_str::<Value>(&self.metadata_json)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }
}

/// A retrievable passage derived from one document. Ordinals are
/// contiguous from 0 within the document; chunks are replaced wholesale
/// (delete-then-insert) on re-ingestion.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub namespace_id: String,
    pub ordinal: i64,
    pub text: String,
    pub headings_json: String,
    pub token_count: i64,
    pub metadata_json: String,
    pub created_at: i64,
}

impl Chunk {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            document_id: row.get("document_id"),
            namespace_id: row.get("namespace_id"),
            ordinal: row.get("ordinal"),
            text: row.get("text"),
            headings_json: row.get("headings_json"),
            token_count: row.get("token_count"),
            metadata_json: row.get("metadata_json"),
            created_at: row.get("created_at"),
        }
    }

    pub fn headings(&self) -> Vec<String> {
        serde_json::from_str(&self.headings_json).unwrap_or_default()
    }

    /// The chunk's source URL when it was harvested from the web.
    pub fn source_url(&self) -> Option<String> {
        serde_json::from_str::<Value>(&self.metadata_json)
            .ok()
            .and_then(|v| {
                v.get("source_url")
                    .and_then(|u| u.as_str())
                    .map(|u| u.to_string())
            })
    }
}

/// One asynchronous unit of work. A crawl job fans out into one
/// `document_ingest` job per harvested document.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub namespace_id: String,
    pub task_type: String,
    pub status: String,
    pub payload_json: String,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl Job {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            namespace_id: row.get("namespace_id"),
            task_type: row.get("task_type"),
            status: row.get("status"),
            payload_json: row.get("payload_json"),
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.payload_json).unwrap_or(Value::Null)
    }
}

/// Row-level record of one URL visited by a crawl job. Written once when
/// the URL is dequeued, then updated only to its terminal status.
#[derive(Debug, Clone)]
pub struct CrawlResult {
    pub id: String,
    pub job_id: String,
    pub url: String,
    pub depth: i64,
    pub status: String,
    pub content_type: Option<String>,
    pub document_id: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
}

impl CrawlResult {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            job_id: row.get("job_id"),
            url: row.get("url"),
            depth: row.get("depth"),
            status: row.get("status"),
            content_type: row.get("content_type"),
            document_id: row.get("document_id"),
            error: row.get("error"),
            created_at: row.get("created_at"),
        }
    }
}

/// Merge `incoming` keys into `base`, new keys overriding old. One merge
/// policy applies everywhere (uploads and crawl harvests alike).
pub fn merge_metadata(base: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (k, v) in incoming {
        base.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_transitions_follow_lifecycle() {
        use DocumentStatus::*;
        assert!(Uploading.can_transition(Uploaded));
        assert!(Uploaded.can_transition(Processing));
        assert!(Processing.can_transition(Ingested));
        assert!(Processing.can_transition(Failed));
        assert!(Failed.can_transition(Processing));
        assert!(Ingested.can_transition(Processing));

        assert!(!Uploading.can_transition(Ingested));
        assert!(!Uploaded.can_transition(Ingested));
        assert!(!Ingested.can_transition(Uploaded));
    }

    #[test]
    fn any_status_can_soft_delete() {
        use DocumentStatus::*;
        for status in [Uploading, Uploaded, Processing, Ingested, Failed] {
            assert!(status.can_transition(Deleted));
        }
    }

    #[test]
    fn invalid_transition_is_an_error() {
        let err = DocumentStatus::Uploading
            .transition(DocumentStatus::Ingested)
            .unwrap_err();
        assert!(err.to_string().contains("uploading -> ingested"));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            "uploading",
            "uploaded",
            "processing",
            "ingested",
            "failed",
            "deleted",
        ] {
            assert_eq!(DocumentStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
        assert!(DocumentStatus::parse("bogus").is_none());
    }

    #[test]
    fn metadata_merge_prefers_new_keys() {
        let mut base = Map::new();
        base.insert("a".into(), Value::from(1));
        base.insert("b".into(), Value::from("old"));

        let mut incoming = Map::new();
        incoming.insert("b".into(), Value::from("new"));
        incoming.insert("c".into(), Value::from(true));

        merge_metadata(&mut base, incoming);
        assert_eq!(base["a"], Value::from(1));
        assert_eq!(base["b"], Value::from("new"));
        assert_eq!(base["c"], Value::from(true));
    }
}
