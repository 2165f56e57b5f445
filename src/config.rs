use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    /// `fs` (directory-backed) or `s3` (SigV4-signed S3-compatible API).
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the `fs` backend.
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,
    /// Custom endpoint for the `s3` backend (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            bucket: default_bucket(),
            root: default_blob_root(),
            endpoint_url: None,
            region: default_region(),
        }
    }
}

fn default_blob_backend() -> String {
    "fs".to_string()
}
fn default_bucket() -> String {
    "quarry-data".to_string()
}
fn default_blob_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Hard cap on crawl depth; per-job depth is clamped to this (0..=3).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Minimum spacing between outbound requests, robots.txt included.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_depth: default_max_depth(),
            request_interval_ms: default_request_interval_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_user_agent() -> String {
    "quarry-crawler/0.1".to_string()
}
fn default_max_depth() -> u32 {
    2
}
fn default_request_interval_ms() -> u64 {
    700
}
fn default_fetch_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_window_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash` (deterministic local) or `ollama` (HTTP).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_ollama_host")]
    pub host: String,
    /// Every stored/query vector is forced to exactly this many
    /// components (truncated or zero-padded).
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            host: default_ollama_host(),
            dimension: default_dimension(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embedding_model() -> String {
    "paraphrase-multilingual".to_string()
}
fn default_ollama_host() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_dimension() -> usize {
    384
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `disabled`, `lexical` (term-overlap scoring) or `http`.
    #[serde(default = "default_reranker_provider")]
    pub provider: String,
    #[serde(default = "default_reranker_model")]
    pub model: String,
    #[serde(default = "default_ollama_host")]
    pub host: String,
    /// Final candidate count after the cross-encoder pass.
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_reranker_provider(),
            model: default_reranker_model(),
            host: default_ollama_host(),
            top_k: default_rerank_top_k(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_reranker_provider() -> String {
    "lexical".to_string()
}
fn default_reranker_model() -> String {
    "bge-reranker-v2-m3".to_string()
}
fn default_rerank_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// ANN pool widens to `top_k * candidate_multiplier` when reranking.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_max_unique_urls")]
    pub max_unique_urls: usize,
    #[serde(default = "default_token_hit_limit")]
    pub token_hit_limit: usize,
    /// Literal phrases mapped to source URLs; a phrase match promotes
    /// those URLs' chunks ahead of vector results.
    #[serde(default)]
    pub keyword_map: HashMap<String, Vec<String>>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            max_unique_urls: default_max_unique_urls(),
            token_hit_limit: default_token_hit_limit(),
            keyword_map: HashMap::new(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_max_unique_urls() -> usize {
    5
}
fn default_token_hit_limit() -> usize {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_ollama_host")]
    pub host: String,
    /// Optional secondary endpoint; a failed connection to the primary
    /// is retried once against this host.
    #[serde(default)]
    pub fallback_host: Option<String>,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            host: default_ollama_host(),
            fallback_host: None,
            model: default_generation_model(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_model() -> String {
    "gemma3:27b".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// Concurrent job workers; jobs are independent, so ordering between
    /// them is not guaranteed.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.window_chars == 0 {
        anyhow::bail!("chunking.window_chars must be > 0");
    }

    if config.embedding.dimension == 0 {
        anyhow::bail!("embedding.dimension must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or ollama.",
            other
        ),
    }

    match config.reranker.provider.as_str() {
        "disabled" | "lexical" | "http" => {}
        other => anyhow::bail!(
            "Unknown reranker provider: '{}'. Must be disabled, lexical, or http.",
            other
        ),
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier < 1 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }

    if config.crawler.max_depth > 3 {
        anyhow::bail!("crawler.max_depth must be in 0..=3");
    }

    match config.blob.backend.as_str() {
        "fs" | "s3" => {}
        other => anyhow::bail!("Unknown blob backend: '{}'. Must be fs or s3.", other),
    }

    if config.jobs.workers == 0 {
        anyhow::bail!("jobs.workers must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            [db]
            path = "./data/quarry.sqlite"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply_for_missing_sections() {
        let cfg = minimal();
        assert_eq!(cfg.chunking.window_chars, 1000);
        assert_eq!(cfg.chunking.overlap_chars, 200);
        assert_eq!(cfg.crawler.max_depth, 2);
        assert_eq!(cfg.crawler.request_interval_ms, 700);
        assert_eq!(cfg.retrieval.top_k, 8);
        assert_eq!(cfg.reranker.top_k, 3);
        assert_eq!(cfg.embedding.provider, "hash");
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn depth_above_three_rejected() {
        let mut cfg = minimal();
        cfg.crawler.max_depth = 4;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn unknown_providers_rejected() {
        let mut cfg = minimal();
        cfg.embedding.provider = "bert".into();
        assert!(validate(&cfg).is_err());

        let mut cfg = minimal();
        cfg.reranker.provider = "onnx".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn zero_window_rejected() {
        let mut cfg = minimal();
        cfg.chunking.window_chars = 0;
        assert!(validate(&cfg).is_err());
    }
}
