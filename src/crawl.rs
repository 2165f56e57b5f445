//! Breadth-first site crawler with politeness and dedup.
//!
//! One crawler instance drives one crawl job: a FIFO queue of
//! `(url, depth)` pairs seeded with the normalized root. Fetches within
//! a job are strictly sequential behind a minimum inter-request interval
//! (robots.txt fetches included); separate jobs run as independent tasks.
//!
//! Every dequeued URL gets exactly one CrawlResult row whose terminal
//! status is one of `blocked`, `failed`, `skipped`, or `harvested`.
//! Off-host and non-HTTP(S) links are invisible: never enqueued, never
//! recorded. Each row commits on its own, so partial crawl progress
//! survives a later failure.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::CrawlerConfig;
use crate::db;
use crate::error::PipelineError;
use crate::jobs;
use crate::models::{CrawlOutcome, DocumentStatus};
use crate::parse;
use crate::robots::RobotsPolicy;

/// Crawl depth is clamped to this bound regardless of the job payload.
pub const MAX_DEPTH_BOUND: u32 = 3;

/// Counters accumulated over one crawl and written into the job payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub total: u64,
    pub harvested: u64,
    pub failed: u64,
    pub blocked: u64,
    pub skipped: u64,
}

/// Execute one crawl job to completion and return its summary.
pub async fn run_crawl(
    pool: &SqlitePool,
    blob: &dyn BlobStore,
    config: &CrawlerConfig,
    job_id: &str,
    namespace_id: &str,
    root_url: &str,
    max_depth: u32,
) -> Result<CrawlSummary> {
    let mut crawler = Crawler::new(pool, blob, config, job_id, namespace_id, root_url, max_depth)?;
    crawler.run().await
}

struct Fetched {
    final_url: String,
    content_type_header: Option<String>,
    bytes: Vec<u8>,
}

struct Crawler<'a> {
    pool: &'a SqlitePool,
    blob: &'a dyn BlobStore,
    user_agent: String,
    job_id: String,
    namespace_id: String,
    root: Url,
    allowed_host: String,
    max_depth: u32,
    client: reqwest::Client,
    /// Bars a URL from being enqueued twice.
    seen: HashSet<String>,
    /// Bars a dequeued URL from being fetched twice (covers duplicate
    /// queue entries and redirect targets).
    visited: HashSet<String>,
    /// One robots.txt fetch per origin; `None` caches "unreachable".
    robots_cache: HashMap<String, Option<RobotsPolicy>>,
    last_request: Option<Instant>,
    min_interval: Duration,
    bucket_ready: bool,
    summary: CrawlSummary,
}

impl<'a> Crawler<'a> {
    fn new(
        pool: &'a SqlitePool,
        blob: &'a dyn BlobStore,
        config: &CrawlerConfig,
        job_id: &str,
        namespace_id: &str,
        root_url: &str,
        max_depth: u32,
    ) -> Result<Self> {
        let root = normalize_root(root_url)?;
        let allowed_host = authority(&root)
            .ok_or_else(|| anyhow!("crawl root {} has no host", root_url))?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            pool,
            blob,
            user_agent: config.user_agent.clone(),
            job_id: job_id.to_string(),
            namespace_id: namespace_id.to_string(),
            root,
            allowed_host,
            max_depth: max_depth.min(config.max_depth).min(MAX_DEPTH_BOUND),
            client,
            seen: HashSet::new(),
            visited: HashSet::new(),
            robots_cache: HashMap::new(),
            last_request: None,
            min_interval: Duration::from_millis(config.request_interval_ms),
            bucket_ready: false,
            summary: CrawlSummary::default(),
        })
    }

    async fn run(&mut self) -> Result<CrawlSummary> {
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        let root = self.root.to_string();
        queue.push_back((root.clone(), 0));
        self.seen.insert(root);

        while let Some((url, depth)) = queue.pop_front() {
            if self.visited.contains(&url) {
                continue;
            }
            self.visited.insert(url.clone());

            let result_id = self.insert_result(&url, depth).await?;
            self.summary.total += 1;

            if !self.is_allowed(&url).await {
                self.finish_result(&result_id, CrawlOutcome::Blocked, None, None)
                    .await?;
                self.summary.blocked += 1;
                continue;
            }

            let fetched = match self.fetch(&url).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(url = %url, error = %e, "fetch failed");
                    self.finish_result(
                        &result_id,
                        CrawlOutcome::Failed,
                        None,
                        Some(&e.to_string()),
                    )
                    .await?;
                    self.summary.failed += 1;
                    continue;
                }
            };

            // Redirects may land anywhere; the final URL must pass the
            // same normalization gate as a discovered link.
            let Some(final_url) = self.normalize_url(&fetched.final_url) else {
                self.finish_result(&result_id, CrawlOutcome::Skipped, None, None)
                    .await?;
                self.summary.skipped += 1;
                continue;
            };
            self.set_result_url(&result_id, &final_url).await?;
            self.visited.insert(final_url.clone());

            let content_type = detect_content_type(&fetched, &final_url);
            let is_html = parse::is_html_type(&content_type);

            if !parse::is_supported_type(&content_type) {
                self.finish_result(
                    &result_id,
                    CrawlOutcome::Skipped,
                    Some(&content_type),
                    None,
                )
                .await?;
                self.summary.skipped += 1;
                if is_html && depth < self.max_depth {
                    self.enqueue_links(&mut queue, &fetched.bytes, &final_url, depth + 1);
                }
                continue;
            }

            match self
                .harvest(&fetched, &final_url, depth, &content_type)
                .await
            {
                Ok(document_id) => {
                    self.finish_harvested(&result_id, &content_type, &document_id)
                        .await?;
                    self.summary.harvested += 1;
                }
                Err(e) => {
                    warn!(url = %final_url, error = %e, "harvest failed");
                    self.finish_result(
                        &result_id,
                        CrawlOutcome::Failed,
                        Some(&content_type),
                        Some(&e.to_string()),
                    )
                    .await?;
                    self.summary.failed += 1;
                    continue;
                }
            }

            if is_html && depth < self.max_depth {
                self.enqueue_links(&mut queue, &fetched.bytes, &final_url, depth + 1);
            }
        }

        Ok(self.summary.clone())
    }

    // ============ Politeness and robots ============

    /// Enforce the minimum spacing before every outbound request.
    async fn throttle(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }

    async fn is_allowed(&mut self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return true;
        };
        let origin = format!(
            "{}://{}",
            parsed.scheme(),
            authority(&parsed).unwrap_or_default()
        );

        if !self.robots_cache.contains_key(&origin) {
            let policy = self.fetch_robots(&origin).await;
            self.robots_cache.insert(origin.clone(), policy);
        }

        match self.robots_cache.get(&origin) {
            Some(Some(policy)) => policy.allows(&self.user_agent, parsed.path()),
            // Unreachable robots.txt permits the crawl.
            _ => true,
        }
    }

    async fn fetch_robots(&mut self, origin: &str) -> Option<RobotsPolicy> {
        self.throttle().await;
        let robots_url = format!("{}/robots.txt", origin);
        let resp = self.client.get(&robots_url).send().await.ok()?;
        if resp.status().as_u16() >= 400 {
            return None;
        }
        let text = resp.text().await.ok()?;
        debug!(origin, "robots.txt cached");
        Some(RobotsPolicy::parse(&text))
    }

    async fn fetch(&mut self, url: &str) -> Result<Fetched, PipelineError> {
        self.throttle().await;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(PipelineError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let final_url = resp.url().to_string();
        let content_type_header = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PipelineError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .to_vec();

        Ok(Fetched {
            final_url,
            content_type_header,
            bytes,
        })
    }

    // ============ Harvesting ============

    /// Store the response as a new document, enqueue its ingestion, and
    /// return the document id for the crawl result link.
    async fn harvest(
        &mut self,
        fetched: &Fetched,
        url: &str,
        depth: u32,
        content_type: &str,
    ) -> Result<String> {
        if !self.bucket_ready {
            self.blob.ensure_bucket().await?;
            self.bucket_ready = true;
        }

        let title = if parse::is_html_type(content_type) {
            let html = parse::decode_text(&fetched.bytes);
            parse::title_of(&scraper::Html::parse_document(&html))
        } else {
            None
        };

        let filename = derive_filename(url, content_type);
        let document_id = Uuid::new_v4().to_string();
        let object_key = format!(
            "crawl/{}/{}/{}",
            self.namespace_id, document_id, filename
        );

        let metadata = serde_json::json!({
            "source_url": url,
            "original_filename": filename,
            "crawl_job_id": self.job_id,
            "crawl_depth": depth,
        });

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, namespace_id, uri, title, content_type, status,
                 metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document_id)
        .bind(&self.namespace_id)
        .bind(&object_key)
        .bind(&title)
        .bind(content_type)
        .bind(DocumentStatus::Uploaded.as_str())
        .bind(metadata.to_string())
        .bind(db::now())
        .execute(self.pool)
        .await?;

        self.blob
            .put(&object_key, &fetched.bytes, content_type)
            .await?;

        sqlx::query("UPDATE documents SET updated_at = ? WHERE id = ?")
            .bind(db::now())
            .bind(&document_id)
            .execute(self.pool)
            .await?;

        jobs::enqueue_ingest(self.pool, &self.namespace_id, &document_id).await?;
        Ok(document_id)
    }

    // ============ Link discovery ============

    fn enqueue_links(
        &mut self,
        queue: &mut VecDeque<(String, u32)>,
        bytes: &[u8],
        base_url: &str,
        depth: u32,
    ) {
        if depth > self.max_depth {
            return;
        }
        let Ok(base) = Url::parse(base_url) else {
            return;
        };

        let html = parse::decode_text(bytes);
        let doc = scraper::Html::parse_document(&html);
        for href in parse::html_links(&doc) {
            let Ok(joined) = base.join(&href) else {
                continue;
            };
            let Some(normalized) = self.normalize_url(joined.as_str()) else {
                continue;
            };
            if self.seen.contains(&normalized) {
                continue;
            }
            self.seen.insert(normalized.clone());
            queue.push_back((normalized, depth));
        }
    }

    /// Resolve against the root, strip the fragment, and reject
    /// non-HTTP(S) schemes and off-host links. Rejected URLs are simply
    /// invisible to the crawl.
    fn normalize_url(&self, raw: &str) -> Option<String> {
        let mut resolved = self.root.join(raw).ok()?;
        resolved.set_fragment(None);
        if !matches!(resolved.scheme(), "http" | "https") {
            return None;
        }
        if authority(&resolved)? != self.allowed_host {
            return None;
        }
        Some(resolved.to_string())
    }

    // ============ CrawlResult bookkeeping ============

    async fn insert_result(&self, url: &str, depth: u32) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO crawl_results (id, job_id, url, depth, status, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&self.job_id)
        .bind(url)
        .bind(depth as i64)
        .bind(CrawlOutcome::Pending.as_str())
        .bind(db::now())
        .execute(self.pool)
        .await?;
        Ok(id)
    }

    async fn set_result_url(&self, result_id: &str, url: &str) -> Result<()> {
        sqlx::query("UPDATE crawl_results SET url = ? WHERE id = ?")
            .bind(url)
            .bind(result_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    async fn finish_result(
        &self,
        result_id: &str,
        outcome: CrawlOutcome,
        content_type: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawl_results SET status = ?, content_type = COALESCE(?, content_type), error = ? WHERE id = ?",
        )
        .bind(outcome.as_str())
        .bind(content_type)
        .bind(error)
        .bind(result_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    async fn finish_harvested(
        &self,
        result_id: &str,
        content_type: &str,
        document_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawl_results SET status = ?, content_type = ?, document_id = ? WHERE id = ?",
        )
        .bind(CrawlOutcome::Harvested.as_str())
        .bind(content_type)
        .bind(document_id)
        .bind(result_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}

// ============ URL helpers ============

/// Host plus explicit port, lowercased — the crawl's allow-list key.
fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

fn normalize_root(root_url: &str) -> Result<Url> {
    let mut url = Url::parse(root_url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!("crawl root must be HTTP or HTTPS"));
    }
    url.set_fragment(None);
    Ok(url)
}

/// Content type from the response header, else an extension sniff on the
/// final URL; anything unrecognized is treated as HTML.
fn detect_content_type(fetched: &Fetched, url: &str) -> String {
    if let Some(header) = &fetched.content_type_header {
        let mime = parse::normalize_mime(header);
        if !mime.is_empty() {
            return mime;
        }
    }
    let path = Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    if path.ends_with(".pdf") {
        parse::MIME_PDF.to_string()
    } else if path.ends_with(".docx") {
        parse::MIME_DOCX.to_string()
    } else if path.ends_with(".doc") {
        parse::MIME_DOC.to_string()
    } else {
        parse::MIME_HTML.to_string()
    }
}

/// Object filename derived from the URL path, cleaned down to
/// `[A-Za-z0-9._-]` with an extension matching the content type.
fn derive_filename(url: &str, content_type: &str) -> String {
    let is_html = parse::is_html_type(content_type);
    let name = Url::parse(url)
        .ok()
        .map(|u| {
            u.path()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .unwrap_or_default();

    let mut base = if name.is_empty() {
        if is_html {
            "index.html".to_string()
        } else {
            "document".to_string()
        }
    } else {
        name
    };

    if !base.contains('.') {
        let extension = if is_html {
            ".html"
        } else if content_type == parse::MIME_PDF {
            ".pdf"
        } else if content_type == parse::MIME_DOCX || content_type == parse::MIME_DOC {
            ".docx"
        } else {
            ""
        };
        base.push_str(extension);
    }

    let cleaned = clean_filename(&base);
    if !cleaned.is_empty() {
        return cleaned;
    }

    if is_html {
        "document.html".to_string()
    } else if content_type == parse::MIME_PDF {
        "document.pdf".to_string()
    } else if content_type == parse::MIME_DOCX || content_type == parse::MIME_DOC {
        "document.docx".to_string()
    } else {
        "document.bin".to_string()
    }
}

/// Replace runs of disallowed characters with a single underscore and
/// trim leading/trailing separators.
fn clean_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sub = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    out.trim_matches(|c| c == '.' || c == '_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crawler_root(root: &str) -> (Url, String) {
        let url = normalize_root(root).unwrap();
        let host = authority(&url).unwrap();
        (url, host)
    }

    fn normalize(root: &str, raw: &str) -> Option<String> {
        let (root, allowed_host) = crawler_root(root);
        let mut resolved = root.join(raw).ok()?;
        resolved.set_fragment(None);
        if !matches!(resolved.scheme(), "http" | "https") {
            return None;
        }
        if authority(&resolved)? != allowed_host {
            return None;
        }
        Some(resolved.to_string())
    }

    #[test]
    fn relative_links_resolve_against_root() {
        assert_eq!(
            normalize("https://example.com/docs/", "../a/b"),
            Some("https://example.com/a/b".to_string())
        );
    }

    #[test]
    fn fragments_are_stripped() {
        assert_eq!(
            normalize("https://example.com/", "/page#section-2"),
            Some("https://example.com/page".to_string())
        );
    }

    #[test]
    fn off_host_and_non_http_links_are_invisible() {
        assert!(normalize("https://example.com/", "https://other.example/x").is_none());
        assert!(normalize("https://example.com/", "mailto:someone@example.com").is_none());
        assert!(normalize("https://example.com/", "ftp://example.com/file").is_none());
        // Same host, different port: different authority.
        assert!(normalize("https://example.com/", "https://example.com:8443/x").is_none());
    }

    #[test]
    fn root_scheme_is_validated() {
        assert!(normalize_root("ftp://example.com/").is_err());
        assert!(normalize_root("https://example.com").is_ok());
    }

    #[test]
    fn content_type_prefers_header_then_extension() {
        let with_header = Fetched {
            final_url: "https://example.com/x".into(),
            content_type_header: Some("Application/PDF; charset=binary".into()),
            bytes: Vec::new(),
        };
        assert_eq!(
            detect_content_type(&with_header, "https://example.com/x"),
            parse::MIME_PDF
        );

        let no_header = Fetched {
            final_url: "https://example.com/report.docx".into(),
            content_type_header: None,
            bytes: Vec::new(),
        };
        assert_eq!(
            detect_content_type(&no_header, "https://example.com/report.docx"),
            parse::MIME_DOCX
        );
        assert_eq!(
            detect_content_type(&no_header, "https://example.com/page"),
            parse::MIME_HTML
        );
    }

    #[test]
    fn filenames_are_derived_and_cleaned() {
        assert_eq!(
            derive_filename(
                "https://example.com/files/report(final).pdf",
                parse::MIME_PDF
            ),
            "report_final_.pdf"
        );
        assert_eq!(
            derive_filename("https://example.com/", parse::MIME_HTML),
            "index.html"
        );
        assert_eq!(
            derive_filename("https://example.com/about", parse::MIME_HTML),
            "about.html"
        );
        assert_eq!(
            derive_filename("https://example.com/???", parse::MIME_PDF),
            "document.pdf"
        );
    }

    #[test]
    fn filename_cleaner_collapses_runs() {
        assert_eq!(clean_filename("a  b!!c.pdf"), "a_b_c.pdf");
        assert_eq!(clean_filename("..hidden.."), "hidden");
        assert_eq!(clean_filename("???"), "");
    }
}
