//! # docchat
//!
//! Upload a document, ask questions about it, get answers grounded in
//! retrieved passages with page citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────┐
//! │  upload  │──▶│ Ingestion        │──▶│ Vector index │
//! │          │   │ extract/chunk/   │   │ (SQLite)     │
//! └──────────┘   │ embed/commit     │   └──────┬───────┘
//!                └────────┬─────────┘          │
//!                         ▼                    ▼
//!                ┌──────────────────┐   ┌──────────────┐   ┌─────┐
//!  poll ────────▶│ Status tracker   │   │ Answer       │──▶│ LLM │
//!                └──────────────────┘   │ composer     │   └─────┘
//!                                       └──────┬───────┘
//!                                              ▼
//!                                       ┌──────────────┐
//!                                       │ Chat context │
//!                                       │ cache (LRU)  │
//!                                       └──────────────┘
//! ```
//!
//! Pure logic (models, chunking, ranking, cache, prompt assembly) lives in
//! the `docchat-core` crate; this crate adds I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and codes |
//! | [`retry`] | Timeouts and bounded retry for provider calls |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`objects`] | Original document bytes |
//! | [`extract`] | Per-page text extraction |
//! | [`embedding`] | Embedding provider clients |
//! | [`llm`] | Chat-completion provider clients |
//! | [`status`] | Processing status tracker |
//! | [`ingest`] | Ingestion pipeline |
//! | [`composer`] | RAG answer composer |
//! | [`app`] | Service wiring |
//! | [`server`] | HTTP server |
//! | [`cli`] | CLI command implementations |

pub mod app;
pub mod cli;
pub mod composer;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod objects;
pub mod retry;
pub mod server;
pub mod sqlite_store;
pub mod status;
