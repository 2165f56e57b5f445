//! # Quarry
//!
//! A multi-tenant document ingestion and retrieval pipeline. Quarry
//! harvests documents (file uploads and crawled web pages) into a blob
//! store, turns them into embedded passages in SQLite, and answers
//! questions by composing a hybrid retrieval chain whose output grounds
//! a streaming language-model answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────┐   ┌───────────┐
//! │ Crawler  │──▶│ Parse+Chunk+Embed  │──▶│  SQLite    │
//! │ Uploads  │   │ (ingestion jobs)   │   │ + blobs    │
//! └──────────┘   └────────────────────┘   └─────┬─────┘
//!                                               │
//!                      ┌────────────────────────┤
//!                      ▼                        ▼
//!               ┌─────────────┐          ┌────────────┐
//!               │ Hybrid chain │         │ Generation  │
//!               │ + reranker   │────────▶│ (streamed)  │
//!               └─────────────┘          └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and state machines |
//! | [`parse`] | PDF/DOCX/HTML/plain-text extraction |
//! | [`chunk`] | Sliding-window splitting with heading breadcrumbs |
//! | [`embedding`] | Embedding providers and vector codecs |
//! | [`crawl`] | Breadth-first site crawler |
//! | [`robots`] | robots.txt evaluation |
//! | [`blob`] | Blob storage (filesystem, S3) |
//! | [`ingest`] | Per-document ingestion pipeline |
//! | [`retrieval`] | Namespace-scoped vector search |
//! | [`chain`] | Hybrid retrieval chain |
//! | [`rerank`] | Cross-encoder reranking |
//! | [`jobs`] | Job orchestration and workers |
//! | [`answer`] | Grounded prompt assembly and generation client |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod blob;
pub mod chain;
pub mod chunk;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod rerank;
pub mod retrieval;
pub mod robots;
