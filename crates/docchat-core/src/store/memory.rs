//! In-memory store for tests and embedded use.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Chunks are kept in one
//! vector per document, so replacing a document's chunk set is a single
//! map insert under the write lock and searches only ever scan the
//! requested document. Vector search is brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::models::{ChatSession, Chunk, Document, Message, ScoredChunk, Turn};
use crate::search::rank;

use super::{DocumentStore, MessageStore, VectorIndex};

#[derive(Default)]
struct ChunkTable {
    by_document: HashMap<String, Vec<Chunk>>,
    /// Fixed by the first embedding ever stored.
    dims: Option<usize>,
}

impl ChunkTable {
    fn check_dims(&self, chunks: &[Chunk]) -> Result<Option<usize>> {
        let mut dims = self.dims;
        for c in chunks {
            if c.embedding.is_empty() {
                bail!("chunk {} has no embedding", c.chunk_index);
            }
            match dims {
                Some(d) if d != c.embedding.len() => bail!(
                    "embedding dimension mismatch for chunk {}: expected {}, got {}",
                    c.chunk_index,
                    d,
                    c.embedding.len()
                ),
                Some(_) => {}
                None => dims = Some(c.embedding.len()),
            }
        }
        Ok(dims)
    }
}

#[derive(Default)]
struct SessionRecord {
    session: Option<ChatSession>,
    messages: Vec<Message>,
}

/// In-memory implementation of every storage trait.
#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<ChunkTable>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl VectorIndex for InMemoryStore {
    async fn index(&self, chunk: &Chunk) -> Result<()> {
        let mut table = write(&self.chunks)?;
        table.dims = table.check_dims(std::slice::from_ref(chunk))?;
        let entries = table
            .by_document
            .entry(chunk.document_id.clone())
            .or_default();
        entries.retain(|c| c.id != chunk.id && c.chunk_index != chunk.chunk_index);
        entries.push(chunk.clone());
        entries.sort_by_key(|c| c.chunk_index);
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        if let Some(stray) = chunks.iter().find(|c| c.document_id != document_id) {
            bail!(
                "chunk {} belongs to document {}, not {}",
                stray.chunk_index,
                stray.document_id,
                document_id
            );
        }
        let mut table = write(&self.chunks)?;
        table.dims = table.check_dims(chunks)?;
        let mut fresh = chunks.to_vec();
        fresh.sort_by_key(|c| c.chunk_index);
        if fresh.windows(2).any(|w| w[0].chunk_index == w[1].chunk_index) {
            bail!("duplicate chunk_index in chunk set for {}", document_id);
        }
        table.by_document.insert(document_id.to_string(), fresh);
        Ok(())
    }

    async fn search(
        &self,
        document_id: &str,
        query_vec: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>> {
        let table = read(&self.chunks)?;
        let candidates: Vec<ScoredChunk> = table
            .by_document
            .get(document_id)
            .map(|chunks| {
                chunks
                    .iter()
                    .map(|c| ScoredChunk {
                        chunk_id: c.id.clone(),
                        document_id: c.document_id.clone(),
                        page: c.page,
                        chunk_index: c.chunk_index,
                        text: c.text.clone(),
                        section: c.section.clone(),
                        similarity: cosine_similarity(query_vec, &c.embedding),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rank(candidates, top_k, threshold))
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        let table = read(&self.chunks)?;
        Ok(table.by_document.get(document_id).map_or(0, Vec::len))
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut docs = write(&self.docs)?;
        if docs.contains_key(&doc.id) {
            bail!("document {} already exists", doc.id);
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(read(&self.docs)?.get(id).cloned())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let mut docs = write(&self.docs)?;
        match docs.get_mut(&doc.id) {
            Some(existing) => {
                *existing = doc.clone();
                Ok(())
            }
            None => bail!("document {} not found", doc.id),
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn ensure_session(
        &self,
        chat_id: &str,
        owner_id: &str,
        document_id: Option<&str>,
    ) -> Result<ChatSession> {
        let mut sessions = write(&self.sessions)?;
        let record = sessions.entry(chat_id.to_string()).or_default();
        let session = record.session.get_or_insert_with(|| {
            let now = Utc::now();
            ChatSession {
                id: chat_id.to_string(),
                owner_id: owner_id.to_string(),
                document_id: document_id.map(str::to_string),
                created_at: now,
                updated_at: now,
            }
        });
        Ok(session.clone())
    }

    async fn get_session(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        Ok(read(&self.sessions)?
            .get(chat_id)
            .and_then(|r| r.session.clone()))
    }

    async fn append_turn(&self, turn: &Turn) -> Result<()> {
        let mut sessions = write(&self.sessions)?;
        let record = sessions
            .get_mut(&turn.user.session_id)
            .ok_or_else(|| anyhow!("chat session {} not found", turn.user.session_id))?;
        record.messages.push(turn.user.clone());
        record.messages.push(turn.assistant.clone());
        if let Some(session) = record.session.as_mut() {
            session.updated_at = turn.assistant.created_at;
        }
        Ok(())
    }

    async fn recent_turns(&self, chat_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let sessions = read(&self.sessions)?;
        let Some(record) = sessions.get(chat_id) else {
            return Ok(Vec::new());
        };
        let turns: Vec<Turn> = record
            .messages
            .chunks_exact(2)
            .map(|pair| Turn::new(pair[0].clone(), pair[1].clone()))
            .collect();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn chunk(doc: &str, index: i64, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: format!("{}-{}", doc, index),
            document_id: doc.to_string(),
            page: 1,
            chunk_index: index,
            text: format!("chunk {} of {}", index, doc),
            hash: String::new(),
            section: None,
            embedding,
        }
    }

    #[tokio::test]
    async fn search_never_leaks_other_documents() {
        let store = InMemoryStore::new();
        store
            .replace_chunks("a", &[chunk("a", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .replace_chunks("b", &[chunk("b", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        let results = store.search("a", &[1.0, 0.0], 10, -1.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.iter().all(|r| r.document_id == "a"));
    }

    #[tokio::test]
    async fn identical_embeddings_tie_break_on_chunk_index() {
        let store = InMemoryStore::new();
        store
            .replace_chunks(
                "a",
                &[chunk("a", 5, vec![0.6, 0.8]), chunk("a", 3, vec![0.6, 0.8])],
            )
            .await
            .unwrap();
        let results = store.search("a", &[0.6, 0.8], 10, 0.0).await.unwrap();
        assert_eq!(results[0].chunk_index, 3);
        assert_eq!(results[1].chunk_index, 5);
    }

    #[tokio::test]
    async fn replace_swaps_whole_set() {
        let store = InMemoryStore::new();
        store
            .replace_chunks(
                "a",
                &[chunk("a", 0, vec![1.0, 0.0]), chunk("a", 1, vec![0.0, 1.0])],
            )
            .await
            .unwrap();
        store
            .replace_chunks("a", &[chunk("a", 0, vec![1.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.chunk_count("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_dimension_mismatch() {
        let store = InMemoryStore::new();
        store.index(&chunk("a", 0, vec![1.0, 0.0])).await.unwrap();
        let err = store
            .replace_chunks("b", &[chunk("b", 0, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension"));
        assert_eq!(store.chunk_count("b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_turns_are_bounded_and_ordered() {
        let store = InMemoryStore::new();
        store.ensure_session("chat", "owner", None).await.unwrap();
        for i in 0..4 {
            let user = Message::new("chat", Role::User, format!("q{}", i));
            let assistant = Message::new("chat", Role::Assistant, format!("a{}", i));
            store.append_turn(&Turn::new(user, assistant)).await.unwrap();
        }
        let turns = store.recent_turns("chat", 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user.content, "q2");
        assert_eq!(turns[1].assistant.content, "a3");
    }
}
