//! Hybrid retrieval chain: a cascade of composable stages, each wrapping
//! the previous one.
//!
//! Innermost first: vector search → history-aware query composition →
//! unique-source-URL filter → keyword/URL fallback → cross-encoder
//! rerank. Every stage implements [`Retriever`] and is independently
//! testable; [`build_chain`] wires the production cascade.
//!
//! Stages record what they actually did (composed query, token list,
//! per-candidate scores) behind locks; those traces are read-only
//! observability hooks, not part of the retrieval contract.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use url::Url;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::models::DocumentStatus;
use crate::rerank::Reranker;
use crate::retrieval::{search_chunks, ScoredChunk};

/// Conversational context supplied alongside the query.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    /// Recent same-language user turns, formatted for display.
    pub history: String,
    /// Raw recent user text, mined for hint keywords.
    pub user_context: String,
}

impl QueryContext {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, context: &QueryContext) -> Result<Vec<ScoredChunk>>;
}

// ============ Stage 0: vector search ============

/// Innermost stage: plain namespace-scoped similarity search. The chain
/// applies its own cross-encoder pass, so no inner rerank here.
pub struct VectorStage {
    pool: SqlitePool,
    embedder: Arc<Embedder>,
    config: RetrievalConfig,
    namespace_id: String,
}

impl VectorStage {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<Embedder>,
        config: RetrievalConfig,
        namespace_id: String,
    ) -> Self {
        Self {
            pool,
            embedder,
            config,
            namespace_id,
        }
    }
}

#[async_trait]
impl Retriever for VectorStage {
    async fn retrieve(&self, query: &str, _context: &QueryContext) -> Result<Vec<ScoredChunk>> {
        search_chunks(
            &self.pool,
            &self.embedder,
            &self.config,
            None,
            &self.namespace_id,
            query,
        )
        .await
    }
}

// ============ Stage 1: history-aware query composer ============

const QUERY_KEYWORD_LIMIT: usize = 4;
const CONTEXT_KEYWORD_LIMIT: usize = 6;
const HINT_LIMIT: usize = 6;

/// Builds the actual search string: the query plus up to six content
/// keywords as a `topic:` suffix. A pronoun-only query draws all its
/// keywords from the conversational context.
pub struct HistoryAwareStage {
    inner: Arc<dyn Retriever>,
    trace: Mutex<String>,
}

impl HistoryAwareStage {
    pub fn new(inner: Arc<dyn Retriever>) -> Self {
        Self {
            inner,
            trace: Mutex::new(String::new()),
        }
    }

    /// The exact search string the last retrieval used.
    pub fn last_query(&self) -> String {
        self.trace.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn compose(&self, query: &str, user_context: &str) -> String {
        let query_keywords = extract_hint_keywords(query, QUERY_KEYWORD_LIMIT);
        let context_keywords = extract_hint_keywords(user_context, CONTEXT_KEYWORD_LIMIT);

        let hints: Vec<String> = if pronoun_only(query) || query_keywords.is_empty() {
            context_keywords.into_iter().take(HINT_LIMIT).collect()
        } else {
            // Current-query keywords first, context fills remaining slots.
            let mut seen = HashSet::new();
            let mut merged = Vec::new();
            for keyword in query_keywords.into_iter().chain(context_keywords) {
                if seen.insert(keyword.clone()) {
                    merged.push(keyword);
                }
                if merged.len() >= HINT_LIMIT {
                    break;
                }
            }
            merged
        };

        if hints.is_empty() {
            query.trim().to_string()
        } else {
            format!("{} topic:{}", query.trim(), hints.join(" "))
        }
    }
}

#[async_trait]
impl Retriever for HistoryAwareStage {
    async fn retrieve(&self, query: &str, context: &QueryContext) -> Result<Vec<ScoredChunk>> {
        let composed = self.compose(query, &context.user_context);
        if let Ok(mut trace) = self.trace.lock() {
            *trace = composed.clone();
        }
        self.inner.retrieve(&composed, context).await
    }
}

// ============ Stage 2: unique-URL filter ============

/// Deduplicates candidates by source URL, first occurrence wins, capped
/// at a configured number of distinct sources. Chunks without a source
/// URL key on their document instead.
pub struct UniqueUrlStage {
    inner: Arc<dyn Retriever>,
    max_unique: usize,
}

impl UniqueUrlStage {
    pub fn new(inner: Arc<dyn Retriever>, max_unique: usize) -> Self {
        Self { inner, max_unique }
    }
}

#[async_trait]
impl Retriever for UniqueUrlStage {
    async fn retrieve(&self, query: &str, context: &QueryContext) -> Result<Vec<ScoredChunk>> {
        let candidates = self.inner.retrieve(query, context).await?;
        Ok(dedup_by_source(candidates, self.max_unique))
    }
}

fn source_key(candidate: &ScoredChunk) -> String {
    candidate
        .source_url
        .as_ref()
        .and_then(|u| normalize_candidate_url(u))
        .unwrap_or_else(|| format!("doc:{}", candidate.document_id))
}

fn dedup_by_source(candidates: Vec<ScoredChunk>, cap: usize) -> Vec<ScoredChunk> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        if seen.insert(source_key(&candidate)) {
            out.push(candidate);
        }
        if out.len() >= cap {
            break;
        }
    }
    out
}

// ============ Stage 3: keyword/URL fallback ============

/// Lexical lookup structures over a namespace's ingested chunks: exact
/// source URLs, an inverted token index, and configured keyword
/// promotions.
pub struct KeywordIndex {
    chunks: Vec<ScoredChunk>,
    url_map: HashMap<String, Vec<usize>>,
    token_index: HashMap<String, Vec<usize>>,
    keyword_map: HashMap<String, Vec<usize>>,
}

impl KeywordIndex {
    pub async fn load(
        pool: &SqlitePool,
        namespace_id: &str,
        keyword_map_config: &HashMap<String, Vec<String>>,
    ) -> Result<Self> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.document_id, c.namespace_id, c.ordinal,
                   c.text, c.headings_json, c.metadata_json
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.namespace_id = ?
              AND d.status = ?
              AND d.deleted_at IS NULL
            ORDER BY c.document_id, c.ordinal
            "#,
        )
        .bind(namespace_id)
        .bind(DocumentStatus::Ingested.as_str())
        .fetch_all(pool)
        .await?;

        let chunks: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
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
                    score: 0.0,
                }
            })
            .collect();

        Ok(Self::build(chunks, keyword_map_config))
    }

    /// Build the lookup structures from an in-memory chunk set.
    pub fn build(
        chunks: Vec<ScoredChunk>,
        keyword_map_config: &HashMap<String, Vec<String>>,
    ) -> Self {
        let mut url_map: HashMap<String, Vec<usize>> = HashMap::new();
        let mut token_index: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, chunk) in chunks.iter().enumerate() {
            if let Some(url) = chunk
                .source_url
                .as_ref()
                .and_then(|u| normalize_candidate_url(u))
            {
                url_map.entry(url).or_default().push(idx);
            }
            let mut chunk_tokens: Vec<String> = letter_tokens(&chunk.text, 3, false);
            chunk_tokens.sort();
            chunk_tokens.dedup();
            for token in chunk_tokens {
                token_index.entry(token).or_default().push(idx);
            }
        }

        // Configured phrase → URLs, resolved down to chunk indices.
        let mut keyword_map: HashMap<String, Vec<usize>> = HashMap::new();
        for (phrase, urls) in keyword_map_config {
            let mut indices = Vec::new();
            for url in urls {
                if let Some(normalized) = normalize_candidate_url(url) {
                    if let Some(matched) = url_map.get(&normalized) {
                        indices.extend(matched.iter().copied());
                    }
                }
            }
            if !indices.is_empty() {
                keyword_map.insert(phrase.to_lowercase(), indices);
            }
        }

        Self {
            chunks,
            url_map,
            token_index,
            keyword_map,
        }
    }
}

/// Diagnostics snapshot of the last fallback evaluation.
#[derive(Debug, Clone, Default)]
pub struct FallbackTrace {
    pub tokens: Vec<String>,
    pub priority_urls: Vec<String>,
    pub combined_sources: Vec<String>,
    pub url_shortcut: bool,
}

/// Exact-URL shortcut, keyword promotions, and inverted-token hits
/// merged ahead of the primary retriever's results.
pub struct KeywordFallbackStage {
    primary: Arc<dyn Retriever>,
    index: KeywordIndex,
    token_hit_limit: usize,
    url_pattern: Regex,
    trace: Mutex<FallbackTrace>,
}

impl KeywordFallbackStage {
    pub fn new(
        primary: Arc<dyn Retriever>,
        index: KeywordIndex,
        token_hit_limit: usize,
    ) -> Result<Self> {
        Ok(Self {
            primary,
            index,
            token_hit_limit,
            url_pattern: Regex::new(r"https?://[^\s]+")?,
            trace: Mutex::new(FallbackTrace::default()),
        })
    }

    pub fn last_trace(&self) -> FallbackTrace {
        self.trace.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn set_trace(&self, trace: FallbackTrace) {
        if let Ok(mut slot) = self.trace.lock() {
            *slot = trace;
        }
    }
}

#[async_trait]
impl Retriever for KeywordFallbackStage {
    async fn retrieve(&self, query: &str, context: &QueryContext) -> Result<Vec<ScoredChunk>> {
        let combined_text = format!(
            "{}\n{}\n{}",
            context.user_context, context.history, query
        )
        .to_lowercase();

        // An exact indexed URL in the conversation wins outright: only
        // that URL's chunks come back, vector search is bypassed.
        for url_match in self.url_pattern.find_iter(&combined_text) {
            if let Some(normalized) = normalize_candidate_url(url_match.as_str()) {
                if let Some(indices) = self.index.url_map.get(&normalized) {
                    let chunks: Vec<ScoredChunk> = indices
                        .iter()
                        .map(|&i| self.index.chunks[i].clone())
                        .collect();
                    self.set_trace(FallbackTrace {
                        tokens: Vec::new(),
                        priority_urls: vec![normalized.clone()],
                        combined_sources: vec![normalized],
                        url_shortcut: true,
                    });
                    return Ok(chunks);
                }
            }
        }

        // Keyword promotions: literal phrase containment.
        let mut priority: Vec<ScoredChunk> = Vec::new();
        let mut priority_urls: Vec<String> = Vec::new();
        for (phrase, indices) in &self.index.keyword_map {
            if combined_text.contains(phrase.as_str()) {
                for &i in indices {
                    let chunk = &self.index.chunks[i];
                    if let Some(url) = &chunk.source_url {
                        priority_urls.push(url.clone());
                    }
                    priority.push(chunk.clone());
                }
            }
        }

        // Inverted-index hits for content tokens, capped.
        let tokens = content_query_tokens(&combined_text);
        let mut token_hits: Vec<ScoredChunk> = Vec::new();
        let mut token_seen: HashSet<usize> = HashSet::new();
        'outer: for token in &tokens {
            if let Some(indices) = self.index.token_index.get(token) {
                for &i in indices {
                    if token_seen.insert(i) {
                        token_hits.push(self.index.chunks[i].clone());
                    }
                    if token_hits.len() >= self.token_hit_limit {
                        break 'outer;
                    }
                }
            }
        }

        let primary_results = self.primary.retrieve(query, context).await?;

        // priority + token hits + vector results, one chunk per source.
        let mut combined = priority;
        combined.extend(token_hits);
        combined.extend(primary_results);
        let deduped = dedup_by_source(combined, usize::MAX);

        self.set_trace(FallbackTrace {
            tokens,
            priority_urls,
            combined_sources: deduped.iter().map(source_key).collect(),
            url_shortcut: false,
        });
        Ok(deduped)
    }
}

// ============ Stage 4: cross-encoder rerank ============

/// Diagnostics snapshot of the last rerank pass.
#[derive(Debug, Clone, Default)]
pub struct RerankTrace {
    pub query: String,
    /// `(source, score)` pairs, best first.
    pub candidates: Vec<(String, f32)>,
}

/// Scores every `(query, passage)` pair and keeps the top K. Scoring
/// failures keep the incoming order — this stage can narrow the result,
/// never empty it.
pub struct CrossEncoderStage {
    inner: Arc<dyn Retriever>,
    reranker: Arc<Reranker>,
    trace: Mutex<RerankTrace>,
}

impl CrossEncoderStage {
    pub fn new(inner: Arc<dyn Retriever>, reranker: Arc<Reranker>) -> Self {
        Self {
            inner,
            reranker,
            trace: Mutex::new(RerankTrace::default()),
        }
    }

    pub fn last_trace(&self) -> RerankTrace {
        self.trace.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Retriever for CrossEncoderStage {
    async fn retrieve(&self, query: &str, context: &QueryContext) -> Result<Vec<ScoredChunk>> {
        let mut candidates = self.inner.retrieve(query, context).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let top_k = self.reranker.top_k;
        let passages: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        match self.reranker.score(query, &passages).await {
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
                warn!(error = %e, "cross-encoder failed; keeping prior order");
            }
        }
        candidates.truncate(top_k);

        if let Ok(mut trace) = self.trace.lock() {
            *trace = RerankTrace {
                query: query.to_string(),
                candidates: candidates
                    .iter()
                    .map(|c| (source_key(c), c.score))
                    .collect(),
            };
        }
        Ok(candidates)
    }
}

// ============ Chain assembly ============

/// The production cascade with handles onto each stage's diagnostics.
pub struct RetrievalChain {
    top: Arc<CrossEncoderStage>,
    pub composer: Arc<HistoryAwareStage>,
    pub fallback: Arc<KeywordFallbackStage>,
}

impl RetrievalChain {
    pub async fn retrieve(
        &self,
        query: &str,
        context: &QueryContext,
    ) -> Result<Vec<ScoredChunk>> {
        self.top.retrieve(query, context).await
    }

    pub fn composer_query(&self) -> String {
        self.composer.last_query()
    }

    pub fn fallback_trace(&self) -> FallbackTrace {
        self.fallback.last_trace()
    }

    pub fn rerank_trace(&self) -> RerankTrace {
        self.top.last_trace()
    }
}

/// Wire the four stages for one namespace.
pub async fn build_chain(
    pool: SqlitePool,
    embedder: Arc<Embedder>,
    reranker: Arc<Reranker>,
    config: &RetrievalConfig,
    namespace_id: &str,
) -> Result<RetrievalChain> {
    let vector = Arc::new(VectorStage::new(
        pool.clone(),
        embedder,
        config.clone(),
        namespace_id.to_string(),
    ));
    let composer = Arc::new(HistoryAwareStage::new(vector));
    let unique = Arc::new(UniqueUrlStage::new(
        composer.clone(),
        config.max_unique_urls,
    ));

    let index = KeywordIndex::load(&pool, namespace_id, &config.keyword_map).await?;
    let fallback = Arc::new(KeywordFallbackStage::new(
        unique,
        index,
        config.token_hit_limit,
    )?);

    let top = Arc::new(CrossEncoderStage::new(fallback.clone(), reranker));

    Ok(RetrievalChain {
        top,
        composer,
        fallback,
    })
}

// ============ Query understanding helpers ============

/// German + English stopwords for keyword extraction.
const STOPWORDS: &[&str] = &[
    "der", "die", "das", "und", "ist", "nicht", "sie", "ich", "du", "wir", "ihr", "es", "ein",
    "eine", "den", "dem", "des", "wie", "was", "wo", "warum", "wann", "zum", "zur", "für", "mit",
    "ohne", "auf", "im", "in", "an", "am", "oder", "auch", "dass", "so", "nur", "bitte", "noch",
    "danke", "frage", "the", "and", "is", "are", "was", "were", "be", "to", "of", "on", "for",
    "a", "an", "it", "this", "that", "how", "what", "why", "when", "or", "also", "please",
    "thanks", "thank", "you", "your", "my", "our", "their",
];

const PRONOUNS: &[&str] = &[
    "it", "this", "that", "these", "those", "they", "them", "es", "das", "dies", "diese",
    "dieses", "jenes", "sie",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Contiguous letter runs (optionally with hyphens) of at least
/// `min_len` characters, lowercased, in order of appearance.
fn letter_tokens(text: &str, min_len: usize, allow_hyphen: bool) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphabetic() || (allow_hyphen && c == '-') {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
        .into_iter()
        .filter(|t| t.chars().count() >= min_len)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Up to `limit` content keywords: ≥3 letters, stopwords removed,
/// first-seen-wins dedup.
pub fn extract_hint_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in letter_tokens(text, 3, true) {
        if is_stopword(&token) {
            continue;
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
        if out.len() >= limit {
            break;
        }
    }
    out
}

/// Tokens used against the inverted index: ≥4 letters, stopwords
/// removed, deduplicated in order.
fn content_query_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in letter_tokens(text, 4, false) {
        if is_stopword(&token) {
            continue;
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out
}

/// A query is pronoun-only when it has no content tokens, or every
/// content token is a pronoun.
pub fn pronoun_only(query: &str) -> bool {
    let tokens: Vec<String> = letter_tokens(query, 3, true)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect();
    tokens.is_empty() || tokens.iter().all(|t| PRONOUNS.contains(&t.as_str()))
}

fn content_token_set(text: &str) -> HashSet<String> {
    letter_tokens(text, 3, true)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect()
}

/// Jaccard overlap of content tokens; 0.0 when either side is empty.
pub fn topic_overlap(a: &str, b: &str) -> f64 {
    let set_a = content_token_set(a);
    let set_b = content_token_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// Cheap language sniff: umlauts/ß or common German function words.
pub fn is_german(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if lowered.chars().any(|c| matches!(c, 'ä' | 'ö' | 'ü' | 'ß')) {
        return true;
    }
    const MARKERS: &[&str] = &[
        "der", "die", "das", "und", "ist", "nicht", "wie", "wo", "sie", "ich",
    ];
    lowered
        .split(|c: char| !c.is_alphabetic())
        .any(|w| MARKERS.contains(&w))
}

/// One turn of conversation history.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

const HISTORY_MAX_TURNS: usize = 3;
const HISTORY_MAX_CHARS: usize = 600;
const TOPIC_OVERLAP_THRESHOLD: f64 = 0.25;

/// Recent user turns joined for keyword mining.
pub fn recent_user_text(history: &[ChatTurn], max_turns: usize) -> String {
    let users: Vec<String> = history
        .iter()
        .filter(|t| t.role == "user")
        .map(|t| t.content.replace('\n', " ").trim().to_string())
        .collect();
    let start = users.len().saturating_sub(max_turns);
    users[start..].join(" | ")
}

/// Recent user turns in the same language as the current query,
/// formatted and capped in length (most recent kept).
pub fn format_user_history_same_lang(history: &[ChatTurn], current: &str) -> String {
    let current_german = is_german(current);
    let mut parts: Vec<String> = Vec::new();
    for turn in history.iter().rev() {
        if turn.role != "user" {
            continue;
        }
        let text = turn.content.replace('\n', " ").trim().to_string();
        if text.is_empty() || is_german(&text) != current_german {
            continue;
        }
        parts.push(format!("User: {}", text));
        if parts.len() >= HISTORY_MAX_TURNS {
            break;
        }
    }
    parts.reverse();
    let joined = parts.join("\n");
    if joined.chars().count() > HISTORY_MAX_CHARS {
        let skip = joined.chars().count() - HISTORY_MAX_CHARS;
        joined.chars().skip(skip).collect()
    } else {
        joined
    }
}

/// Topic-switch gate: the context resets unless the query stays on the
/// previous topic or leans on pronouns to refer back to it.
pub fn compose_context(history: &[ChatTurn], current: &str) -> QueryContext {
    let current_german = is_german(current);
    let last_same_lang = history
        .iter()
        .rev()
        .find(|t| t.role == "user" && is_german(&t.content) == current_german)
        .map(|t| t.content.clone())
        .unwrap_or_default();

    if topic_overlap(current, &last_same_lang) < TOPIC_OVERLAP_THRESHOLD && !pronoun_only(current)
    {
        QueryContext::empty()
    } else {
        QueryContext {
            history: format_user_history_same_lang(history, current),
            user_context: recent_user_text(history, HISTORY_MAX_TURNS),
        }
    }
}

/// Normalize a URL for exact-source matching: scheme, lowercased
/// authority, path without its trailing slash; query and fragment drop.
pub fn normalize_candidate_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_lowercase();
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    };
    let path = url.path().trim_end_matches('/');
    Some(format!("{}://{}{}", url.scheme(), authority, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, doc: &str, text: &str, url: Option<&str>) -> ScoredChunk {
        ScoredChunk {
            chunk_id: id.to_string(),
            document_id: doc.to_string(),
            namespace_id: "ns".to_string(),
            ordinal: 0,
            text: text.to_string(),
            headings: Vec::new(),
            source_url: url.map(|u| u.to_string()),
            score: 0.0,
        }
    }

    struct FixedRetriever {
        results: Vec<ScoredChunk>,
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(
            &self,
            _query: &str,
            _context: &QueryContext,
        ) -> Result<Vec<ScoredChunk>> {
            Ok(self.results.clone())
        }
    }

    #[test]
    fn keyword_extraction_caps_and_dedups() {
        let keywords = extract_hint_keywords(
            "How do I reset reset my VPN password for the VPN portal?",
            4,
        );
        assert_eq!(keywords, vec!["reset", "vpn", "password", "portal"]);
    }

    #[test]
    fn stopwords_never_become_keywords() {
        assert!(extract_hint_keywords("the and for with", 6).is_empty());
        let german = extract_hint_keywords("wie ist das mit der Anmeldung", 6);
        assert_eq!(german, vec!["anmeldung"]);
    }

    #[test]
    fn pronoun_only_detection() {
        assert!(pronoun_only("them?"));
        assert!(pronoun_only("and these?"));
        assert!(pronoun_only("und das?"));
        assert!(pronoun_only(""));
        assert!(!pronoun_only("what about the deadline?"));
    }

    #[test]
    fn composer_prefers_query_keywords() {
        let stage = HistoryAwareStage::new(Arc::new(FixedRetriever { results: vec![] }));
        let composed = stage.compose(
            "eduroam setup on linux",
            "vpn certificate enrollment problems yesterday",
        );
        assert!(composed.starts_with("eduroam setup on linux topic:"));
        let hints = composed.split("topic:").nth(1).unwrap();
        let hint_list: Vec<&str> = hints.split_whitespace().collect();
        assert_eq!(hint_list.len(), 6);
        assert_eq!(&hint_list[..3], &["eduroam", "setup", "linux"]);
    }

    #[test]
    fn composer_falls_back_to_context_for_pronouns() {
        let stage = HistoryAwareStage::new(Arc::new(FixedRetriever { results: vec![] }));
        let composed = stage.compose("und das?", "printer quota exhausted");
        assert_eq!(composed, "und das? topic:printer quota exhausted");
    }

    #[tokio::test]
    async fn unique_url_stage_caps_distinct_sources() {
        let inner = Arc::new(FixedRetriever {
            results: vec![
                chunk("c1", "d1", "a", Some("https://ex.com/a")),
                chunk("c2", "d1", "a again", Some("https://ex.com/a/")),
                chunk("c3", "d2", "b", Some("https://ex.com/b")),
                chunk("c4", "d3", "no url", None),
                chunk("c5", "d3", "no url again", None),
                chunk("c6", "d4", "c", Some("https://ex.com/c")),
            ],
        });
        let stage = UniqueUrlStage::new(inner, 3);
        let out = stage
            .retrieve("q", &QueryContext::empty())
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].chunk_id, "c1");
        assert_eq!(out[1].chunk_id, "c3");
        assert_eq!(out[2].chunk_id, "c4");
    }

    #[tokio::test]
    async fn exact_url_bypasses_vector_search() {
        let indexed = vec![
            chunk("c1", "d1", "alpha passage", Some("https://ex.com/docs/alpha")),
            chunk("c2", "d1", "alpha passage two", Some("https://ex.com/docs/alpha")),
            chunk("c3", "d2", "beta passage", Some("https://ex.com/docs/beta")),
        ];
        let index = KeywordIndex::build(indexed, &HashMap::new());
        // Primary would return beta; the URL shortcut must win.
        let primary = Arc::new(FixedRetriever {
            results: vec![chunk("c3", "d2", "beta passage", Some("https://ex.com/docs/beta"))],
        });
        let stage = KeywordFallbackStage::new(primary, index, 8).unwrap();

        let out = stage
            .retrieve(
                "totally unrelated text https://ex.com/docs/alpha please",
                &QueryContext::empty(),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.source_url.as_deref()
            == Some("https://ex.com/docs/alpha")));
        assert!(stage.last_trace().url_shortcut);
    }

    #[tokio::test]
    async fn token_hits_merge_ahead_of_primary() {
        let indexed = vec![
            chunk("c1", "d1", "the eduroam wireless guide", Some("https://ex.com/a")),
            chunk("c2", "d2", "cafeteria menu", Some("https://ex.com/b")),
        ];
        let index = KeywordIndex::build(indexed, &HashMap::new());
        let primary = Arc::new(FixedRetriever {
            results: vec![chunk("c2", "d2", "cafeteria menu", Some("https://ex.com/b"))],
        });
        let stage = KeywordFallbackStage::new(primary, index, 8).unwrap();

        let out = stage
            .retrieve("eduroam broken", &QueryContext::empty())
            .await
            .unwrap();
        // Token hit (eduroam) first, then the primary result.
        assert_eq!(out[0].chunk_id, "c1");
        assert_eq!(out[1].chunk_id, "c2");
        assert!(stage
            .last_trace()
            .tokens
            .contains(&"eduroam".to_string()));
    }

    #[tokio::test]
    async fn configured_keywords_promote_their_urls() {
        let indexed = vec![
            chunk("c1", "d1", "print quota rules", Some("https://ex.com/print")),
            chunk("c2", "d2", "other things", Some("https://ex.com/other")),
        ];
        let mut keyword_map = HashMap::new();
        keyword_map.insert(
            "drucken".to_string(),
            vec!["https://ex.com/print".to_string()],
        );
        let index = KeywordIndex::build(indexed, &keyword_map);
        let primary = Arc::new(FixedRetriever { results: vec![] });
        let stage = KeywordFallbackStage::new(primary, index, 8).unwrap();

        let out = stage
            .retrieve("wo kann ich drucken?", &QueryContext::empty())
            .await
            .unwrap();
        assert_eq!(out[0].chunk_id, "c1");
        assert_eq!(
            stage.last_trace().priority_urls,
            vec!["https://ex.com/print".to_string()]
        );
    }

    #[tokio::test]
    async fn failing_reranker_keeps_ann_order() {
        use crate::error::PipelineError;
        use crate::rerank::CrossEncoder;

        struct AlwaysFails;
        #[async_trait]
        impl CrossEncoder for AlwaysFails {
            async fn score_pairs(
                &self,
                _query: &str,
                _passages: &[String],
            ) -> Result<Vec<f32>, PipelineError> {
                Err(PipelineError::Rerank("model exploded".into()))
            }
        }

        let inner = Arc::new(FixedRetriever {
            results: vec![
                chunk("c1", "d1", "first", Some("https://ex.com/1")),
                chunk("c2", "d2", "second", Some("https://ex.com/2")),
                chunk("c3", "d3", "third", Some("https://ex.com/3")),
                chunk("c4", "d4", "fourth", Some("https://ex.com/4")),
            ],
        });
        let reranker = Arc::new(Reranker::new(Arc::new(AlwaysFails), 3));
        let stage = CrossEncoderStage::new(inner, reranker);

        let out = stage
            .retrieve("anything", &QueryContext::empty())
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].chunk_id, "c1");
        assert_eq!(out[1].chunk_id, "c2");
        assert_eq!(out[2].chunk_id, "c3");
    }

    #[tokio::test]
    async fn reranker_sorts_by_score_desc() {
        let inner = Arc::new(FixedRetriever {
            results: vec![
                chunk("c1", "d1", "nothing relevant here", Some("https://ex.com/1")),
                chunk(
                    "c2",
                    "d2",
                    "password reset instructions",
                    Some("https://ex.com/2"),
                ),
            ],
        });
        let reranker = Arc::new(Reranker::new(
            Arc::new(crate::rerank::LexicalCrossEncoder),
            3,
        ));
        let stage = CrossEncoderStage::new(inner, reranker);

        let out = stage
            .retrieve("password reset", &QueryContext::empty())
            .await
            .unwrap();
        assert_eq!(out[0].chunk_id, "c2");
        let trace = stage.last_trace();
        assert_eq!(trace.query, "password reset");
        assert_eq!(trace.candidates.len(), 2);
    }

    #[test]
    fn topic_overlap_and_context_gate() {
        let history = vec![
            ChatTurn {
                role: "user".into(),
                content: "how do I configure eduroam on android".into(),
            },
            ChatTurn {
                role: "assistant".into(),
                content: "Open the eduroam app…".into(),
            },
        ];

        // Same topic keeps context.
        let ctx = compose_context(&history, "eduroam certificate expired android");
        assert!(!ctx.user_context.is_empty());

        // Pronoun-only keeps context.
        let ctx = compose_context(&history, "and these?");
        assert!(!ctx.user_context.is_empty());

        // Topic switch resets it.
        let ctx = compose_context(&history, "cafeteria opening hours");
        assert!(ctx.user_context.is_empty());
        assert!(ctx.history.is_empty());
    }

    #[test]
    fn same_language_history_filtering() {
        let history = vec![
            ChatTurn {
                role: "user".into(),
                content: "Wie drucke ich ein Poster?".into(),
            },
            ChatTurn {
                role: "user".into(),
                content: "How do I print a poster?".into(),
            },
        ];
        let formatted = format_user_history_same_lang(&history, "And in color?");
        assert!(formatted.contains("How do I print a poster?"));
        assert!(!formatted.contains("Wie drucke"));
    }

    #[test]
    fn url_normalization_for_matching() {
        assert_eq!(
            normalize_candidate_url("https://Ex.com/docs/page/?utm=1#top"),
            Some("https://ex.com/docs/page".to_string())
        );
        assert_eq!(
            normalize_candidate_url("http://ex.com:8080/a"),
            Some("http://ex.com:8080/a".to_string())
        );
        assert!(normalize_candidate_url("not a url").is_none());
    }
}
