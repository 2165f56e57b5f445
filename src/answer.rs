//! Grounded answering: retrieval-chain candidates → prompt → streamed
//! generation.
//!
//! The generation service is an external collaborator consumed as a
//! token stream with a terminal `done` marker. A failed **connection**
//! to the primary host is retried once against the configured fallback
//! host; any later stream error propagates to the caller.

use anyhow::{anyhow, Result};
use futures::StreamExt;
use sqlx::{Row, SqlitePool};
use std::io::Write;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chain::{self, ChatTurn};
use crate::config::{Config, GenerationConfig};
use crate::db;
use crate::embedding::Embedder;
use crate::rerank::{build_reranker, LexicalCrossEncoder, Reranker};
use crate::retrieval::ScoredChunk;

const HISTORY_LIMIT: i64 = 5;

// ============ Generation client ============

pub struct GenerationClient {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl GenerationClient {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    async fn post(&self, host: &str, prompt: &str) -> Result<reqwest::Response, reqwest::Error> {
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": true,
        });
        self.client
            .post(format!("{}/api/generate", host.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
    }

    /// Stream generated tokens for a prompt. Yields each token as it
    /// arrives and ends when the service signals `done`.
    pub async fn stream_generate(
        &self,
        prompt: &str,
    ) -> Result<impl futures::Stream<Item = Result<String>>> {
        let resp = match self.post(&self.config.host, prompt).await {
            Ok(resp) => resp,
            Err(primary_err) => match &self.config.fallback_host {
                // One retry against the secondary endpoint, connection
                // failures only.
                Some(fallback) => {
                    warn!(error = %primary_err, fallback = %fallback, "primary generation host unreachable");
                    self.post(fallback, prompt).await.map_err(|e| {
                        anyhow!("generation hosts unreachable: {}; fallback: {}", primary_err, e)
                    })?
                }
                None => return Err(primary_err.into()),
            },
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("generation API error {}: {}", status, text));
        }

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<String>>();
        let mut bytes = resp.bytes_stream();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.unbounded_send(Err(e.into()));
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&c| c == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(line) {
                        Ok(value) => {
                            if let Some(token) =
                                value.get("response").and_then(|t| t.as_str())
                            {
                                if !token.is_empty()
                                    && tx.unbounded_send(Ok(token.to_string())).is_err()
                                {
                                    return;
                                }
                            }
                            if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .unbounded_send(Err(anyhow!("bad generation frame: {}", e)));
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

// ============ Prompt assembly ============

/// Context-constrained prompt over the retrieved passages.
pub fn build_prompt(query: &str, candidates: &[ScoredChunk]) -> String {
    let context = candidates
        .iter()
        .map(|c| {
            if c.headings.is_empty() {
                c.text.clone()
            } else {
                format!("[{}]\n{}", c.headings.join(" > "), c.text)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Answer using ONLY the context below. If the context is insufficient, say so.\n\nContext:\n{}\n\nQuestion:\n{}",
        context, query
    )
}

/// Distinct source URLs in candidate order.
pub fn citations(candidates: &[ScoredChunk]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        if let Some(url) = &candidate.source_url {
            if seen.insert(url.clone()) {
                out.push(url.clone());
            }
        }
    }
    out
}

/// Relative-threshold gate deciding whether the retrieved context was
/// actually used: a clearly-best candidate or a strong top-3 band.
pub fn used_context_meaningfully(candidates: &[ScoredChunk]) -> bool {
    if candidates.is_empty() {
        return false;
    }
    let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let spread = if (max - min).abs() < f32::EPSILON {
        1.0
    } else {
        max - min
    };
    let top1_norm = (scores[0] - min) / spread;
    let top3: Vec<f32> = scores.iter().take(3).cloned().collect();
    let top3_mean_norm = (top3.iter().sum::<f32>() / top3.len() as f32 - min) / spread;
    top1_norm >= 0.65 || top3_mean_norm >= 0.55
}

fn library_empty_message(german: bool) -> &'static str {
    if german {
        "Es befinden sich noch keine Dokumente in der Wissensbibliothek. \
         Bitte laden Sie Dateien hoch oder fügen Sie Website-Inhalte hinzu."
    } else {
        "There are no documents in the knowledge library yet. \
         Please upload files or add website content so I can assist you."
    }
}

// ============ Conversation persistence ============

pub async fn ensure_conversation(
    pool: &SqlitePool,
    namespace_id: &str,
    conversation_id: Option<&str>,
) -> Result<String> {
    if let Some(id) = conversation_id {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = ? AND namespace_id = ?")
                .bind(id)
                .bind(namespace_id)
                .fetch_optional(pool)
                .await?;
        if let Some(id) = exists {
            return Ok(id);
        }
    }

    let id = conversation_id
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    sqlx::query("INSERT INTO conversations (id, namespace_id, created_at) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(namespace_id)
        .bind(db::now())
        .execute(pool)
        .await?;
    Ok(id)
}

pub async fn add_message(
    pool: &SqlitePool,
    conversation_id: &str,
    role: &str,
    content: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(conversation_id)
    .bind(role)
    .bind(content)
    .bind(db::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_history(pool: &SqlitePool, conversation_id: &str) -> Result<Vec<ChatTurn>> {
    let rows = sqlx::query(
        "SELECT role, content FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(conversation_id)
    .bind(HISTORY_LIMIT)
    .fetch_all(pool)
    .await?;

    let mut turns: Vec<ChatTurn> = rows
        .iter()
        .map(|row| ChatTurn {
            role: row.get("role"),
            content: row.get("content"),
        })
        .collect();
    turns.reverse();
    Ok(turns)
}

// ============ CLI flow ============

/// Retrieve, prompt, stream the answer to stdout, and record the turn.
pub async fn run_ask(
    config: &Config,
    pool: &SqlitePool,
    namespace_id: &str,
    query: &str,
    conversation_id: Option<&str>,
) -> Result<()> {
    let german = chain::is_german(query);

    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE namespace_id = ?")
            .bind(namespace_id)
            .fetch_one(pool)
            .await?;
    if chunk_count == 0 {
        println!("{}", library_empty_message(german));
        return Ok(());
    }

    let conversation_id = ensure_conversation(pool, namespace_id, conversation_id).await?;
    let history = load_history(pool, &conversation_id).await?;
    let context = chain::compose_context(&history, query);

    let embedder = std::sync::Arc::new(Embedder::new(config.embedding.clone()));
    let reranker = std::sync::Arc::new(match build_reranker(&config.reranker)? {
        Some(reranker) => reranker,
        // The chain always ends in a cross-encoder pass; fall back to
        // the lexical scorer when no provider is configured.
        None => Reranker::new(
            std::sync::Arc::new(LexicalCrossEncoder),
            config.reranker.top_k,
        ),
    });

    let retrieval_chain = chain::build_chain(
        pool.clone(),
        embedder,
        reranker,
        &config.retrieval,
        namespace_id,
    )
    .await?;

    let candidates = retrieval_chain.retrieve(query, &context).await?;
    debug!(
        composed_query = %retrieval_chain.composer_query(),
        tokens = ?retrieval_chain.fallback_trace().tokens,
        rerank = ?retrieval_chain.rerank_trace().candidates,
        "retrieval diagnostics"
    );
    let prompt = build_prompt(query, &candidates);

    let client = GenerationClient::new(config.generation.clone())?;
    let mut stream = client.stream_generate(&prompt).await?;

    let mut answer = String::new();
    while let Some(token) = stream.next().await {
        let token = token?;
        print!("{}", token);
        std::io::stdout().flush().ok();
        answer.push_str(&token);
    }
    println!();

    let sources = citations(&candidates);
    if !sources.is_empty() && used_context_meaningfully(&candidates) {
        let header = if german { "Quellen" } else { "Sources" };
        println!("\n{}:", header);
        for url in &sources {
            println!("- {}", url);
        }
    }

    add_message(pool, &conversation_id, "user", query).await?;
    add_message(pool, &conversation_id, "assistant", &answer).await?;
    println!("\nconversation: {}", conversation_id);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, url: Option<&str>, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk_id: Uuid::new_v4().to_string(),
            document_id: "d".to_string(),
            namespace_id: "ns".to_string(),
            ordinal: 0,
            text: text.to_string(),
            headings: Vec::new(),
            source_url: url.map(|u| u.to_string()),
            score,
        }
    }

    #[test]
    fn prompt_contains_context_and_question() {
        let prompt = build_prompt(
            "how do I print?",
            &[candidate("Printing works via quota.", None, 1.0)],
        );
        assert!(prompt.contains("Printing works via quota."));
        assert!(prompt.contains("how do I print?"));
        assert!(prompt.starts_with("Answer using ONLY the context below."));
    }

    #[test]
    fn prompt_includes_heading_breadcrumbs() {
        let mut c = candidate("Body text.", None, 1.0);
        c.headings = vec!["Manual".into(), "Printing".into()];
        let prompt = build_prompt("q", &[c]);
        assert!(prompt.contains("[Manual > Printing]"));
    }

    #[test]
    fn citations_dedup_in_order() {
        let candidates = vec![
            candidate("a", Some("https://ex.com/1"), 1.0),
            candidate("b", Some("https://ex.com/2"), 0.9),
            candidate("c", Some("https://ex.com/1"), 0.8),
            candidate("d", None, 0.7),
        ];
        assert_eq!(
            citations(&candidates),
            vec!["https://ex.com/1", "https://ex.com/2"]
        );
    }

    #[test]
    fn meaningfulness_gate_relative_scores() {
        // Clear winner → meaningful.
        let strong = vec![
            candidate("a", None, 9.0),
            candidate("b", None, 1.0),
            candidate("c", None, 0.5),
        ];
        assert!(used_context_meaningfully(&strong));

        // Empty → not meaningful.
        assert!(!used_context_meaningfully(&[]));

        // Flat scores normalize to a full band → meaningful.
        let flat = vec![candidate("a", None, 2.0), candidate("b", None, 2.0)];
        assert!(used_context_meaningfully(&flat));
    }
}
