//! SQLite backend for the core storage traits.
//!
//! Chunk embeddings are stored as little-endian `f32` BLOBs next to their
//! text. Similarity search loads only the requested document's rows (the
//! `WHERE document_id = ?` filter is the isolation boundary) and ranks them
//! in Rust with the shared core ranking rules.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use docchat_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docchat_core::models::{
    ChatSession, Chunk, Citation, Document, DocumentStatus, Message, Role, ScoredChunk, Turn,
};
use docchat_core::search::rank;
use docchat_core::store::{DocumentStore, MessageStore, VectorIndex};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let byte_size: i64 = row.get("byte_size");
    let total_pages: i64 = row.get("total_pages");
    let chunk_count: i64 = row.get("chunk_count");
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        display_name: row.get("display_name"),
        content_type: row.get("content_type"),
        byte_size: byte_size as u64,
        content_hash: row.get("content_hash"),
        uploaded_at: from_millis(row.get("uploaded_at")),
        status: status.parse::<DocumentStatus>()?,
        total_pages: total_pages as u32,
        chunk_count: chunk_count as u32,
        is_ready: row.get::<i64, _>("is_ready") != 0,
        error_message: row.get("error_message"),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.get("role");
    let citations_json: String = row.get("citations_json");
    let citations: Vec<Citation> = serde_json::from_str(&citations_json)?;
    Ok(Message {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role: role.parse::<Role>()?,
        content: row.get("content"),
        created_at: from_millis(row.get("created_at")),
        citations,
    })
}

async fn insert_chunk(conn: &mut SqliteConnection, chunk: &Chunk, now: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO chunks (id, document_id, page, chunk_index, text, hash, section, embedding, dims, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.page as i64)
    .bind(chunk.chunk_index)
    .bind(&chunk.text)
    .bind(&chunk.hash)
    .bind(&chunk.section)
    .bind(vec_to_blob(&chunk.embedding))
    .bind(chunk.embedding.len() as i64)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

fn check_dims(chunks: &[Chunk], existing: Option<i64>) -> Result<()> {
    let mut expected = existing.map(|d| d as usize);
    for c in chunks {
        if c.embedding.is_empty() {
            bail!("chunk {} has no embedding", c.chunk_index);
        }
        match expected {
            Some(d) if d != c.embedding.len() => bail!(
                "embedding dimension mismatch for chunk {}: expected {}, got {}",
                c.chunk_index,
                d,
                c.embedding.len()
            ),
            Some(_) => {}
            None => expected = Some(c.embedding.len()),
        }
    }
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn index(&self, chunk: &Chunk) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT dims FROM chunks WHERE NOT (document_id = ? AND chunk_index = ?) LIMIT 1",
        )
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .fetch_optional(&mut *tx)
        .await?;
        check_dims(std::slice::from_ref(chunk), existing)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ? AND (chunk_index = ? OR id = ?)")
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;
        insert_chunk(&mut *tx, chunk, to_millis(Utc::now())).await?;
        tx.commit().await?;
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

        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM chunks WHERE document_id != ? LIMIT 1")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await?;
        check_dims(chunks, existing)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let now = to_millis(Utc::now());
        for chunk in chunks {
            insert_chunk(&mut *tx, chunk, now).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        document_id: &str,
        query_vec: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, page, chunk_index, text, section, embedding \
             FROM chunks WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let page: i64 = row.get("page");
                ScoredChunk {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    page: page as u32,
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    section: row.get("section"),
                    similarity: cosine_similarity(query_vec, &blob_to_vec(&blob)),
                }
            })
            .collect();

        Ok(rank(candidates, top_k, threshold))
    }

    async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, display_name, content_type, byte_size,
                content_hash, uploaded_at, status, total_pages, chunk_count, is_ready, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.display_name)
        .bind(&doc.content_type)
        .bind(doc.byte_size as i64)
        .bind(&doc.content_hash)
        .bind(to_millis(doc.uploaded_at))
        .bind(doc.status.as_str())
        .bind(doc.total_pages as i64)
        .bind(doc.chunk_count as i64)
        .bind(doc.is_ready as i64)
        .bind(&doc.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, total_pages = ?, chunk_count = ?, is_ready = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(doc.status.as_str())
        .bind(doc.total_pages as i64)
        .bind(doc.chunk_count as i64)
        .bind(doc.is_ready as i64)
        .bind(&doc.error_message)
        .bind(&doc.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("document {} not found", doc.id);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn ensure_session(
        &self,
        chat_id: &str,
        owner_id: &str,
        document_id: Option<&str>,
    ) -> Result<ChatSession> {
        let now = to_millis(Utc::now());
        sqlx::query(
            "INSERT INTO chat_sessions (id, owner_id, document_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(chat_id)
        .bind(owner_id)
        .bind(document_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_session(chat_id)
            .await?
            .ok_or_else(|| anyhow!("chat session {} vanished after insert", chat_id))
    }

    async fn get_session(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| ChatSession {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            document_id: row.get("document_id"),
            created_at: from_millis(row.get("created_at")),
            updated_at: from_millis(row.get("updated_at")),
        }))
    }

    async fn append_turn(&self, turn: &Turn) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in [&turn.user, &turn.assistant] {
            sqlx::query(
                "INSERT INTO messages (id, session_id, role, content, citations_json, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&message.id)
            .bind(&message.session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(serde_json::to_string(&message.citations)?)
            .bind(to_millis(message.created_at))
            .execute(&mut *tx)
            .await?;
        }
        let updated = sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
            .bind(to_millis(turn.assistant.created_at))
            .bind(&turn.user.session_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            bail!("chat session {} not found", turn.user.session_id);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn recent_turns(&self, chat_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(chat_id)
        .bind((limit * 2) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();

        // Turns are written as user/assistant pairs; skip a dangling head.
        let start = messages
            .iter()
            .position(|m| m.role == Role::User)
            .unwrap_or(messages.len());
        Ok(messages[start..]
            .chunks_exact(2)
            .map(|pair| Turn::new(pair[0].clone(), pair[1].clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn chunk(doc: &str, index: i64, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: format!("{}-{}", doc, index),
            document_id: doc.to_string(),
            page: 1,
            chunk_index: index,
            text: format!("text {}", index),
            hash: String::new(),
            section: None,
            embedding,
        }
    }

    async fn with_doc(store: &SqliteStore, id: &str) {
        store
            .insert_document(&Document::queued(id, "owner", "f.txt", "text/plain", 3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn document_round_trip() {
        let store = store().await;
        let mut doc = Document::queued("d1", "owner", "report.pdf", "application/pdf", 42)
            .with_content_hash("abc");
        store.insert_document(&doc).await.unwrap();

        doc.status = DocumentStatus::Failed;
        doc.error_message = Some("bad pdf".into());
        store.update_document(&doc).await.unwrap();

        let loaded = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("bad pdf"));
        assert_eq!(loaded.content_hash, "abc");
        assert!(store.get_document("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_is_scoped_and_ordered() {
        let store = store().await;
        with_doc(&store, "a").await;
        with_doc(&store, "b").await;
        store
            .replace_chunks(
                "a",
                &[chunk("a", 5, vec![0.6, 0.8]), chunk("a", 3, vec![0.6, 0.8])],
            )
            .await
            .unwrap();
        store
            .replace_chunks("b", &[chunk("b", 0, vec![0.6, 0.8])])
            .await
            .unwrap();

        let results = store.search("a", &[0.6, 0.8], 10, 0.5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.document_id == "a"));
        assert_eq!(results[0].chunk_index, 3);
        assert_eq!(results[1].chunk_index, 5);
    }

    #[tokio::test]
    async fn replace_leaves_no_residue() {
        let store = store().await;
        with_doc(&store, "a").await;
        let first: Vec<Chunk> = (0..4).map(|i| chunk("a", i, vec![1.0, 0.0])).collect();
        store.replace_chunks("a", &first).await.unwrap();
        let second = vec![Chunk {
            id: "fresh".into(),
            ..chunk("a", 0, vec![0.0, 1.0])
        }];
        store.replace_chunks("a", &second).await.unwrap();

        assert_eq!(store.chunk_count("a").await.unwrap(), 1);
        let results = store.search("a", &[1.0, 0.0], 10, -1.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "fresh");
    }

    #[tokio::test]
    async fn failed_replace_keeps_previous_set() {
        let store = store().await;
        with_doc(&store, "a").await;
        with_doc(&store, "b").await;
        store
            .replace_chunks("a", &[chunk("a", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .replace_chunks("b", &[chunk("b", 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let err = store
            .replace_chunks("b", &[chunk("b", 0, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension"));
        assert_eq!(store.chunk_count("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn turns_round_trip_with_citations() {
        let store = store().await;
        let session = store.ensure_session("chat", "owner", None).await.unwrap();
        assert_eq!(session.owner_id, "owner");
        let again = store.ensure_session("chat", "other", None).await.unwrap();
        assert_eq!(again.owner_id, "owner");

        for i in 0..3 {
            let user = Message::new("chat", Role::User, format!("q{}", i));
            let assistant = Message::new("chat", Role::Assistant, format!("a{}", i))
                .with_citations(vec![Citation {
                    chunk_id: "c".into(),
                    page: 2,
                    chunk_index: i,
                    snippet: "s".into(),
                    similarity: 0.75,
                }]);
            store.append_turn(&Turn::new(user, assistant)).await.unwrap();
        }

        let turns = store.recent_turns("chat", 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user.content, "q1");
        assert_eq!(turns[1].assistant.content, "a2");
        assert_eq!(turns[1].assistant.citations[0].chunk_index, 2);
    }
}
