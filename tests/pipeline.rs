//! End-to-end pipeline tests: upload ingestion, crawling against a mock
//! site, job orchestration, and retrieval isolation — all on in-memory
//! SQLite, a tempdir blob store, and the deterministic hash embedder.

use std::str::FromStr;
use std::sync::Arc;

use httpmock::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use quarry::blob::FsBlobStore;
use quarry::config::Config;
use quarry::embedding::{vec_to_blob, Embedder};
use quarry::ingest::ingest_document;
use quarry::jobs::{enqueue_crawl, enqueue_ingest, JobRunner};
use quarry::migrate::run_migrations;
use quarry::models::{DocumentStatus, JobStatus};
use quarry::retrieval::search_chunks;

async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    // One connection so every query sees the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

fn test_config(blob_root: &std::path::Path) -> Config {
    let mut config: Config = toml::from_str(
        r#"
        [db]
        path = ":memory:"

        [embedding]
        provider = "hash"
        dimension = 64

        [crawler]
        request_interval_ms = 1

        [jobs]
        workers = 2
        "#,
    )
    .unwrap();
    config.blob.root = blob_root.to_path_buf();
    config
}

async fn create_namespace(pool: &SqlitePool, slug: &str) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO namespaces (id, slug, name, created_at) VALUES (?, ?, ?, strftime('%s','now'))",
    )
    .bind(&id)
    .bind(slug)
    .bind(slug)
    .execute(pool)
    .await
    .unwrap();
    id
}

/// Create an `uploaded` document whose bytes live in the blob store.
async fn seed_uploaded_document(
    pool: &SqlitePool,
    blob: &FsBlobStore,
    namespace_id: &str,
    body: &str,
    content_type: &str,
) -> String {
    use quarry::blob::BlobStore;

    let document_id = Uuid::new_v4().to_string();
    let key = format!("uploads/{}/{}/file.txt", namespace_id, document_id);
    blob.ensure_bucket().await.unwrap();
    blob.put(&key, body.as_bytes(), content_type).await.unwrap();

    sqlx::query(
        r#"
        INSERT INTO documents (id, namespace_id, uri, content_type, status, created_at)
        VALUES (?, ?, ?, ?, ?, strftime('%s','now'))
        "#,
    )
    .bind(&document_id)
    .bind(namespace_id)
    .bind(&key)
    .bind(content_type)
    .bind(DocumentStatus::Uploaded.as_str())
    .execute(pool)
    .await
    .unwrap();
    document_id
}

#[tokio::test]
async fn upload_ingestion_produces_contiguous_chunks_and_ingested_status() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let blob = FsBlobStore::new(tmp.path().to_path_buf(), config.blob.bucket.clone());
    let namespace_id = create_namespace(&pool, "main").await;

    let body = format!(
        "GETTING STARTED\n{}\nNEXT STEPS\n{}",
        "alpha paragraph text. ".repeat(120),
        "beta paragraph text. ".repeat(120)
    );
    let document_id =
        seed_uploaded_document(&pool, &blob, &namespace_id, &body, "text/plain").await;

    let embedder = Embedder::new(config.embedding.clone());
    ingest_document(&pool, &blob, &embedder, &config, &document_id)
        .await
        .unwrap();

    let status: String = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "ingested");

    let rows = sqlx::query(
        "SELECT ordinal, text, embedding FROM chunks WHERE document_id = ? ORDER BY ordinal",
    )
    .bind(&document_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert!(rows.len() > 1);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.get::<i64, _>("ordinal"), i as i64);
        let blob_bytes: Vec<u8> = row.get("embedding");
        assert_eq!(blob_bytes.len(), 64 * 4);
        assert!(!row.get::<String, _>("text").trim().is_empty());
    }

    // chunk_count lands in the document metadata.
    let metadata: String = sqlx::query_scalar("SELECT metadata_json FROM documents WHERE id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
    assert_eq!(metadata["chunk_count"], serde_json::json!(rows.len()));
}

#[tokio::test]
async fn reingestion_replaces_chunks_wholesale() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let blob = FsBlobStore::new(tmp.path().to_path_buf(), config.blob.bucket.clone());
    let namespace_id = create_namespace(&pool, "main").await;

    let document_id = seed_uploaded_document(
        &pool,
        &blob,
        &namespace_id,
        &"first version text. ".repeat(200),
        "text/plain",
    )
    .await;

    let embedder = Embedder::new(config.embedding.clone());
    ingest_document(&pool, &blob, &embedder, &config, &document_id)
        .await
        .unwrap();
    let first_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(first_count > 0);

    // Shorter second version → fewer chunks, all fresh, still contiguous.
    use quarry::blob::BlobStore;
    let uri: String = sqlx::query_scalar("SELECT uri FROM documents WHERE id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    blob.put(&uri, b"short second version", "text/plain")
        .await
        .unwrap();

    ingest_document(&pool, &blob, &embedder, &config, &document_id)
        .await
        .unwrap();
    let rows = sqlx::query("SELECT ordinal FROM chunks WHERE document_id = ? ORDER BY ordinal")
        .bind(&document_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<i64, _>("ordinal"), 0);
}

#[tokio::test]
async fn failed_parse_marks_document_failed_with_error() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let blob = FsBlobStore::new(tmp.path().to_path_buf(), config.blob.bucket.clone());
    let namespace_id = create_namespace(&pool, "main").await;

    let document_id =
        seed_uploaded_document(&pool, &blob, &namespace_id, "not a pdf", "application/pdf").await;

    let embedder = Embedder::new(config.embedding.clone());
    let result = ingest_document(&pool, &blob, &embedder, &config, &document_id).await;
    assert!(result.is_err());

    let row = sqlx::query("SELECT status, error FROM documents WHERE id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "failed");
    let error: Option<String> = row.get("error");
    let error = error.unwrap();
    assert!(error.contains("PDF"));
    assert!(error.chars().count() <= 1000);
}

#[tokio::test]
async fn crawl_harvests_supported_pages_and_skips_unsupported() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let namespace_id = create_namespace(&pool, "crawlns").await;

    let server = MockServer::start_async().await;
    server.mock_async(|when, then| {
        when.method(GET).path("/robots.txt");
        then.status(404);
    }).await;
    server.mock_async(|when, then| {
        when.method(GET).path("/");
        then.status(200)
            .header("content-type", "text/html")
            .body(
                r#"<html><title>Root</title><body>
                <a href="/a">a</a> <a href="/a">a again</a> <a href="/a#section">a anchor</a>
                <a href="/b.xyz">b</a>
                <a href="https://elsewhere.example/x">off-host</a>
                <a href="mailto:root@example.com">mail</a>
                </body></html>"#,
            );
    }).await;
    server.mock_async(|when, then| {
        when.method(GET).path("/a");
        then.status(200)
            .header("content-type", "text/html")
            .body("<html><title>A</title><body><p>Supported page content.</p></body></html>");
    }).await;
    server.mock_async(|when, then| {
        when.method(GET).path("/b.xyz");
        then.status(200)
            .header("content-type", "application/octet-stream")
            .body("binary");
    }).await;

    let job_id = enqueue_crawl(&pool, &namespace_id, &server.url("/"), 1)
        .await
        .unwrap();

    let blob: Arc<FsBlobStore> = Arc::new(FsBlobStore::new(
        tmp.path().to_path_buf(),
        config.blob.bucket.clone(),
    ));
    let embedder = Arc::new(Embedder::new(config.embedding.clone()));
    let runner = JobRunner::new(pool.clone(), blob, embedder, config.clone());
    let executed = runner.run_pending().await.unwrap();
    // The crawl plus the two fanned-out ingestions.
    assert_eq!(executed, 3);

    let results = sqlx::query("SELECT url, depth, status FROM crawl_results WHERE job_id = ?")
        .bind(&job_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);

    let mut harvested = 0;
    let mut skipped = 0;
    for row in &results {
        let status: String = row.get("status");
        let depth: i64 = row.get("depth");
        assert!(depth <= 1);
        match status.as_str() {
            "harvested" => harvested += 1,
            "skipped" => skipped += 1,
            other => panic!("unexpected crawl result status: {}", other),
        }
    }
    assert_eq!(harvested, 2);
    assert_eq!(skipped, 1);

    // Final job payload carries the summary counters.
    let job_row = sqlx::query("SELECT status, payload_json FROM jobs WHERE id = ?")
        .bind(&job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(job_row.get::<String, _>("status"), "succeeded");
    let payload: serde_json::Value =
        serde_json::from_str(&job_row.get::<String, _>("payload_json")).unwrap();
    assert_eq!(payload["total"], serde_json::json!(3));
    assert_eq!(payload["harvested"], serde_json::json!(2));
    assert_eq!(payload["skipped"], serde_json::json!(1));
    assert_eq!(payload["failed"], serde_json::json!(0));
    assert_eq!(payload["blocked"], serde_json::json!(0));

    // Both harvested documents ingested to completion.
    let ingested: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM documents WHERE namespace_id = ? AND status = 'ingested'",
    )
    .bind(&namespace_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(ingested, 2);

    // Nothing left queued; a second drain is a no-op.
    assert_eq!(runner.run_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn robots_disallow_blocks_the_root() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let namespace_id = create_namespace(&pool, "robotsns").await;

    let server = MockServer::start_async().await;
    server.mock_async(|when, then| {
        when.method(GET).path("/robots.txt");
        then.status(200)
            .header("content-type", "text/plain")
            .body("User-agent: *\nDisallow: /\n");
    }).await;

    let job_id = enqueue_crawl(&pool, &namespace_id, &server.url("/"), 0)
        .await
        .unwrap();

    let blob = Arc::new(FsBlobStore::new(
        tmp.path().to_path_buf(),
        config.blob.bucket.clone(),
    ));
    let embedder = Arc::new(Embedder::new(config.embedding.clone()));
    let runner = JobRunner::new(pool.clone(), blob, embedder, config.clone());
    runner.run_pending().await.unwrap();

    let row = sqlx::query("SELECT status FROM crawl_results WHERE job_id = ?")
        .bind(&job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "blocked");

    let payload: serde_json::Value = serde_json::from_str(
        &sqlx::query_scalar::<_, String>("SELECT payload_json FROM jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&pool)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(payload["blocked"], serde_json::json!(1));
    assert_eq!(payload["harvested"], serde_json::json!(0));
}

#[tokio::test]
async fn invalid_crawl_root_fails_the_job_with_truncated_error() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let namespace_id = create_namespace(&pool, "badroot").await;

    let job_id = enqueue_crawl(&pool, &namespace_id, "ftp://example.com/", 1)
        .await
        .unwrap();

    let blob = Arc::new(FsBlobStore::new(
        tmp.path().to_path_buf(),
        config.blob.bucket.clone(),
    ));
    let embedder = Arc::new(Embedder::new(config.embedding.clone()));
    let runner = JobRunner::new(pool.clone(), blob, embedder, config.clone());
    runner.run_pending().await.unwrap();

    let row = sqlx::query("SELECT status, error FROM jobs WHERE id = ?")
        .bind(&job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), JobStatus::Failed.as_str());
    let error: Option<String> = row.get("error");
    let error = error.unwrap();
    assert!(!error.is_empty());
    assert!(error.chars().count() <= 1000);
}

#[tokio::test]
async fn retrieval_is_namespace_isolated() {
    let pool = memory_pool().await;
    let config = test_config(std::path::Path::new("/tmp"));
    let embedder = Embedder::new(config.embedding.clone());

    let ns_a = create_namespace(&pool, "tenant-a").await;
    let ns_b = create_namespace(&pool, "tenant-b").await;

    // Same text on both sides so similarity alone cannot separate them.
    for (namespace_id, marker) in [(&ns_a, "a"), (&ns_b, "b")] {
        for i in 0..4 {
            let document_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO documents (id, namespace_id, uri, content_type, status, created_at)
                 VALUES (?, ?, ?, 'text/plain', 'ingested', strftime('%s','now'))",
            )
            .bind(&document_id)
            .bind(namespace_id)
            .bind(format!("uploads/{}/{}", namespace_id, document_id))
            .execute(&pool)
            .await
            .unwrap();

            let text = format!("shared corpus text about printing {}", i);
            let vector = embedder.embed_passages(&[text.clone()]).await.unwrap();
            sqlx::query(
                "INSERT INTO chunks (id, document_id, namespace_id, ordinal, text, embedding, created_at)
                 VALUES (?, ?, ?, 0, ?, ?, strftime('%s','now'))",
            )
            .bind(format!("{}-{}-{}", marker, document_id, i))
            .bind(&document_id)
            .bind(namespace_id)
            .bind(&text)
            .bind(vec_to_blob(&vector[0]))
            .execute(&pool)
            .await
            .unwrap();
        }
    }

    let results = search_chunks(
        &pool,
        &embedder,
        &config.retrieval,
        None,
        &ns_a,
        "printing",
    )
    .await
    .unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.namespace_id == ns_a));
    assert!(results.iter().all(|r| r.chunk_id.starts_with("a-")));
}

#[tokio::test]
async fn deleted_documents_disappear_from_retrieval() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let blob = FsBlobStore::new(tmp.path().to_path_buf(), config.blob.bucket.clone());
    let namespace_id = create_namespace(&pool, "main").await;

    let document_id = seed_uploaded_document(
        &pool,
        &blob,
        &namespace_id,
        "unique retrievable sentence about telescopes",
        "text/plain",
    )
    .await;
    let embedder = Embedder::new(config.embedding.clone());
    ingest_document(&pool, &blob, &embedder, &config, &document_id)
        .await
        .unwrap();

    let before = search_chunks(
        &pool,
        &embedder,
        &config.retrieval,
        None,
        &namespace_id,
        "telescopes",
    )
    .await
    .unwrap();
    assert!(!before.is_empty());

    assert!(quarry::ingest::soft_delete_document(&pool, &document_id)
        .await
        .unwrap());

    let after = search_chunks(
        &pool,
        &embedder,
        &config.retrieval,
        None,
        &namespace_id,
        "telescopes",
    )
    .await
    .unwrap();
    assert!(after.is_empty());

    // The row itself survives as a soft-deleted record.
    let status: String = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "deleted");
}

#[tokio::test]
async fn blank_query_returns_no_results_not_an_error() {
    let pool = memory_pool().await;
    let config = test_config(std::path::Path::new("/tmp"));
    let embedder = Embedder::new(config.embedding.clone());
    let namespace_id = create_namespace(&pool, "main").await;

    let results = search_chunks(
        &pool,
        &embedder,
        &config.retrieval,
        None,
        &namespace_id,
        "   ",
    )
    .await
    .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn duplicate_ingest_jobs_are_idempotent() {
    let pool = memory_pool().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let blob = FsBlobStore::new(tmp.path().to_path_buf(), config.blob.bucket.clone());
    let namespace_id = create_namespace(&pool, "main").await;

    let document_id = seed_uploaded_document(
        &pool,
        &blob,
        &namespace_id,
        &"duplicated delivery test. ".repeat(100),
        "text/plain",
    )
    .await;

    // Two jobs for the same document, as an at-least-once dispatcher
    // might deliver.
    enqueue_ingest(&pool, &namespace_id, &document_id)
        .await
        .unwrap();
    enqueue_ingest(&pool, &namespace_id, &document_id)
        .await
        .unwrap();

    let blob = Arc::new(FsBlobStore::new(
        tmp.path().to_path_buf(),
        config.blob.bucket.clone(),
    ));
    let embedder = Arc::new(Embedder::new(config.embedding.clone()));
    let runner = JobRunner::new(pool.clone(), blob, embedder, config.clone());
    runner.run_pending().await.unwrap();

    // Ordinals contiguous exactly once.
    let rows = sqlx::query("SELECT ordinal FROM chunks WHERE document_id = ? ORDER BY ordinal")
        .bind(&document_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.get::<i64, _>("ordinal"), i as i64);
    }

    let jobs_succeeded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE namespace_id = ? AND status = 'succeeded'",
    )
    .bind(&namespace_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(jobs_succeeded, 2);
}
