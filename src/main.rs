//! # Quarry CLI
//!
//! Commands for database setup, namespaces, document upload, site
//! crawling, background job execution, and retrieval.
//!
//! ```bash
//! quarry init
//! quarry namespace add support "Support KB"
//! quarry upload handbook.pdf --namespace support
//! quarry crawl https://docs.example.com/ --namespace support --depth 2
//! quarry work
//! quarry search "vpn setup" --namespace support
//! quarry ask "how do I reset my password?" --namespace support
//! ```
//!
//! All commands accept a `--config` flag pointing to a TOML
//! configuration file.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use quarry::blob::build_blob_store;
use quarry::config::{load_config, Config};
use quarry::db;
use quarry::embedding::Embedder;
use quarry::jobs::{enqueue_crawl, enqueue_ingest, JobRunner};
use quarry::migrate;
use quarry::models::{Chunk, CrawlResult, Document, DocumentStatus, Job, Namespace, TaskType};
use quarry::rerank::build_reranker;
use quarry::retrieval::search_chunks;
use quarry::{answer, ingest};

#[derive(Parser)]
#[command(
    name = "quarry",
    about = "A multi-tenant document ingestion and retrieval pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage namespaces (tenant boundaries).
    Namespace {
        #[command(subcommand)]
        action: NamespaceAction,
    },

    /// Upload a local file into a namespace and enqueue its ingestion.
    Upload {
        /// Path to the file to upload.
        file: PathBuf,

        /// Namespace slug.
        #[arg(long)]
        namespace: String,

        /// Optional document title; defaults to the filename.
        #[arg(long)]
        title: Option<String>,
    },

    /// Start a crawl job for a site root.
    Crawl {
        /// Root URL (HTTP or HTTPS).
        url: String,

        /// Namespace slug.
        #[arg(long)]
        namespace: String,

        /// Link-following depth (0..=3); the root is depth 0.
        #[arg(long, default_value_t = 2)]
        depth: u32,
    },

    /// Run queued jobs (crawls and ingestions) until the queue drains.
    Work,

    /// List jobs and their status.
    Jobs {
        /// Filter by namespace slug.
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Similarity-search a namespace's passages.
    Search {
        /// The search query string.
        query: String,

        /// Namespace slug.
        #[arg(long)]
        namespace: String,

        /// Maximum number of passages to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ask a question: retrieve, ground, and stream a generated answer.
    Ask {
        /// The question.
        query: String,

        /// Namespace slug.
        #[arg(long)]
        namespace: String,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Show a document's metadata and stored passages.
    Get {
        /// Document UUID.
        document_id: String,
    },

    /// Soft-delete a document (chunks removed, row preserved).
    Delete {
        /// Document UUID.
        document_id: String,
    },
}

#[derive(Subcommand)]
enum NamespaceAction {
    /// Create a namespace.
    Add {
        /// URL-safe identifier (unique).
        slug: String,
        /// Display name.
        name: String,
        /// Optional description.
        #[arg(long)]
        description: Option<String>,
    },
    /// List namespaces.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let pool = db::connect(&config).await?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Namespace { action } => match action {
            NamespaceAction::Add {
                slug,
                name,
                description,
            } => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO namespaces (id, slug, name, description, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(&slug)
                .bind(&name)
                .bind(&description)
                .bind(db::now())
                .execute(&pool)
                .await?;
                println!("namespace {} ({})", slug, id);
            }
            NamespaceAction::List => {
                let rows = sqlx::query("SELECT * FROM namespaces ORDER BY slug")
                    .fetch_all(&pool)
                    .await?;
                for row in &rows {
                    let ns = Namespace::from_row(row);
                    println!("{}  {}  {}", ns.slug, ns.name, ns.id);
                }
            }
        },
        Commands::Upload {
            file,
            namespace,
            title,
        } => {
            let namespace_id = resolve_namespace(&pool, &namespace).await?;
            run_upload(&config, &pool, &namespace_id, &file, title).await?;
        }
        Commands::Crawl {
            url,
            namespace,
            depth,
        } => {
            if depth > 3 {
                bail!("depth must be in 0..=3");
            }
            let namespace_id = resolve_namespace(&pool, &namespace).await?;
            let job_id = enqueue_crawl(&pool, &namespace_id, &url, depth).await?;
            println!("crawl job {}", job_id);
            println!("run `quarry work` to execute it");
        }
        Commands::Work => {
            let blob = build_blob_store(&config.blob)?;
            let embedder = Arc::new(Embedder::new(config.embedding.clone()));
            let runner = JobRunner::new(pool.clone(), blob, embedder, config.clone());
            let executed = runner.run_pending().await?;
            println!("executed {} jobs", executed);
        }
        Commands::Jobs { namespace } => {
            run_jobs_list(&pool, namespace.as_deref()).await?;
        }
        Commands::Search {
            query,
            namespace,
            top_k,
        } => {
            let namespace_id = resolve_namespace(&pool, &namespace).await?;
            run_search(&config, &pool, &namespace_id, &query, top_k).await?;
        }
        Commands::Ask {
            query,
            namespace,
            conversation,
        } => {
            let namespace_id = resolve_namespace(&pool, &namespace).await?;
            answer::run_ask(&config, &pool, &namespace_id, &query, conversation.as_deref())
                .await?;
        }
        Commands::Get { document_id } => {
            run_get(&pool, &document_id).await?;
        }
        Commands::Delete { document_id } => {
            if ingest::soft_delete_document(&pool, &document_id).await? {
                println!("document {} deleted", document_id);
            } else {
                println!("document {} not found (or already deleted)", document_id);
            }
        }
    }

    pool.close().await;
    Ok(())
}

async fn resolve_namespace(pool: &sqlx::SqlitePool, slug: &str) -> Result<String> {
    let id: Option<String> = sqlx::query_scalar("SELECT id FROM namespaces WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    id.ok_or_else(|| anyhow::anyhow!("unknown namespace: {}", slug))
}

/// Store the file bytes, create the document (`uploading → uploaded`),
/// and enqueue its ingestion job.
async fn run_upload(
    config: &Config,
    pool: &sqlx::SqlitePool,
    namespace_id: &str,
    file: &PathBuf,
    title: Option<String>,
) -> Result<()> {
    let bytes = std::fs::read(file)?;
    let original_filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document")
        .to_string();
    let filename = normalize_filename(&original_filename);
    let content_type = infer_content_type(&filename);

    let document_id = Uuid::new_v4().to_string();
    let object_key = format!("uploads/{}/{}/{}", namespace_id, document_id, filename);
    let metadata = serde_json::json!({
        "original_filename": original_filename,
        "size_bytes": bytes.len(),
    });

    sqlx::query(
        r#"
        INSERT INTO documents
            (id, namespace_id, uri, title, content_type, status, metadata_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&document_id)
    .bind(namespace_id)
    .bind(&object_key)
    .bind(title.as_deref().unwrap_or(&original_filename))
    .bind(&content_type)
    .bind(DocumentStatus::Uploading.as_str())
    .bind(metadata.to_string())
    .bind(db::now())
    .execute(pool)
    .await?;

    let blob = build_blob_store(&config.blob)?;
    blob.ensure_bucket().await?;
    blob.put(&object_key, &bytes, &content_type).await?;

    sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ?")
        .bind(DocumentStatus::Uploaded.as_str())
        .bind(db::now())
        .bind(&document_id)
        .execute(pool)
        .await?;

    let job_id = enqueue_ingest(pool, namespace_id, &document_id).await?;
    println!("document {}", document_id);
    println!("ingest job {}", job_id);
    println!("run `quarry work` to execute it");
    Ok(())
}

async fn run_jobs_list(pool: &sqlx::SqlitePool, namespace: Option<&str>) -> Result<()> {
    let rows = match namespace {
        Some(slug) => {
            let namespace_id = resolve_namespace(pool, slug).await?;
            sqlx::query("SELECT * FROM jobs WHERE namespace_id = ? ORDER BY created_at DESC")
                .bind(namespace_id)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
                .fetch_all(pool)
                .await?
        }
    };

    for row in &rows {
        let job = Job::from_row(row);
        println!(
            "{}  {:<16} {:<10} {}",
            job.id, job.task_type, job.status, job.payload_json
        );
        if let Some(error) = &job.error {
            println!("    error: {}", error);
        }

        // Crawl jobs carry per-URL results worth surfacing.
        if job.task_type == TaskType::Crawl.as_str() {
            let result_rows = sqlx::query(
                "SELECT * FROM crawl_results WHERE job_id = ? ORDER BY created_at ASC",
            )
            .bind(&job.id)
            .fetch_all(pool)
            .await?;
            for result_row in &result_rows {
                let result = CrawlResult::from_row(result_row);
                print!(
                    "    [{}] depth={} {}",
                    result.status, result.depth, result.url
                );
                if let Some(document_id) = &result.document_id {
                    print!(" -> {}", document_id);
                }
                if let Some(error) = &result.error {
                    print!(" ({})", error);
                }
                println!();
            }
        }
    }
    if rows.is_empty() {
        println!("no jobs");
    }
    Ok(())
}

async fn run_get(pool: &sqlx::SqlitePool, document_id: &str) -> Result<()> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        bail!("document not found: {}", document_id);
    };
    let document = Document::from_row(&row);

    println!("id:           {}", document.id);
    println!("namespace:    {}", document.namespace_id);
    println!("uri:          {}", document.uri);
    println!("title:        {}", document.title.as_deref().unwrap_or("(untitled)"));
    println!("content-type: {}", document.content_type);
    println!("status:       {}", document.status);
    if let Some(error) = &document.error {
        println!("error:        {}", error);
    }
    println!("metadata:     {}", document.metadata_json);
    if let Some(preview) = &document.text_preview {
        println!("preview:      \"{}\"", preview.replace('\n', " "));
    }

    let chunk_rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY ordinal")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    println!("chunks:       {}", chunk_rows.len());
    for chunk_row in &chunk_rows {
        let chunk = Chunk::from_row(chunk_row);
        let excerpt: String = chunk.text.chars().take(120).collect();
        print!("  {:>3} ({} tokens)", chunk.ordinal, chunk.token_count);
        let headings = chunk.headings();
        if !headings.is_empty() {
            print!(" [{}]", headings.join(" > "));
        }
        println!(" \"{}\"", excerpt.replace('\n', " "));
    }
    Ok(())
}

async fn run_search(
    config: &Config,
    pool: &sqlx::SqlitePool,
    namespace_id: &str,
    query: &str,
    top_k: Option<usize>,
) -> Result<()> {
    let mut retrieval = config.retrieval.clone();
    if let Some(top_k) = top_k {
        retrieval.top_k = top_k;
    }

    let embedder = Embedder::new(config.embedding.clone());
    let reranker = build_reranker(&config.reranker)?;

    let results = search_chunks(
        pool,
        &embedder,
        &retrieval,
        reranker.as_ref(),
        namespace_id,
        query,
    )
    .await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, result.score, result.chunk_id);
        if !result.headings.is_empty() {
            println!("    headings: {}", result.headings.join(" > "));
        }
        if let Some(url) = &result.source_url {
            println!("    url: {}", url);
        }
        let excerpt: String = result.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
        println!();
    }
    Ok(())
}

fn normalize_filename(filename: &str) -> String {
    let mut out = String::with_capacity(filename.len());
    let mut last_was_sub = false;
    for c in filename.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_').to_string();
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed
    }
}

fn infer_content_type(filename: &str) -> String {
    match filename.rsplit('.').next().map(|e| e.to_lowercase()) {
        Some(ext) if ext == "pdf" => "application/pdf".to_string(),
        Some(ext) if ext == "docx" => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string()
        }
        Some(ext) if ext == "doc" => "application/msword".to_string(),
        Some(ext) if ext == "html" || ext == "htm" => "text/html".to_string(),
        Some(ext) if ext == "md" => "text/markdown".to_string(),
        _ => "text/plain".to_string(),
    }
}
