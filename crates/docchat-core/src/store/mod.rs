//! Storage abstraction for docchat.
//!
//! Three traits cover everything the pipeline and composer persist:
//!
//! | Trait | Holds |
//! |-------|-------|
//! | [`VectorIndex`] | chunk embeddings, answers document-scoped similarity queries |
//! | [`DocumentStore`] | document rows and their processing state |
//! | [`MessageStore`] | chat sessions and the durable message history |
//!
//! Backends: [`memory::InMemoryStore`] here, `SqliteStore` in the app
//! crate. Implementations must be `Send + Sync` to work with async
//! runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChatSession, Chunk, Document, ScoredChunk, Turn};

/// Chunk embeddings, searchable one document at a time.
///
/// # Invariants
///
/// - Every stored embedding has the same dimension.
/// - `search` never returns a chunk whose `document_id` differs from the
///   requested one.
/// - `replace_chunks` is atomic: searches see either the old set or the new
///   set for a document, never a mixture.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or update a single embedded chunk.
    async fn index(&self, chunk: &Chunk) -> Result<()>;

    /// Replace every chunk of `document_id` with `chunks` in one step.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of `document_id` with similarity ≥ `threshold`, best first,
    /// ties by ascending `chunk_index`, at most `top_k`.
    async fn search(
        &self,
        document_id: &str,
        query_vec: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>>;

    /// Number of chunks currently visible for `document_id`.
    async fn chunk_count(&self, document_id: &str) -> Result<usize>;
}

/// Document rows.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Persist status, page/chunk counts, readiness and error message.
    async fn update_document(&self, doc: &Document) -> Result<()>;
}

/// Durable chat history. The chat context cache is derived from this.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Return the session, creating it on first use.
    async fn ensure_session(
        &self,
        chat_id: &str,
        owner_id: &str,
        document_id: Option<&str>,
    ) -> Result<ChatSession>;

    async fn get_session(&self, chat_id: &str) -> Result<Option<ChatSession>>;

    /// Append both messages of a turn atomically.
    async fn append_turn(&self, turn: &Turn) -> Result<()>;

    /// The most recent `limit` turns, oldest first.
    async fn recent_turns(&self, chat_id: &str, limit: usize) -> Result<Vec<Turn>>;
}
