//! Core data models shared by the ingestion pipeline, vector index, chat
//! cache and answer composer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processing state of an uploaded document.
///
/// Runs move forward only: `queued → processing → {completed | failed}`.
/// A terminal document re-enters `queued`/`processing` only through an
/// explicit new ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// `new_run` marks the start of an explicit ingestion run, which is the
    /// only way out of a terminal state.
    pub fn can_advance_to(&self, next: DocumentStatus, new_run: bool) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (Queued, Processing) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            (Queued, Failed) => true,
            (Completed, Queued) | (Failed, Queued) => new_run,
            (Completed, Processing) | (Failed, Processing) => new_run,
            _ => false,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DocumentStatus::Queued),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => anyhow::bail!("unknown document status: {}", other),
        }
    }
}

/// An uploaded document and its pipeline bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub display_name: String,
    pub content_type: String,
    pub byte_size: u64,
    /// SHA-256 of the uploaded bytes, hex encoded.
    pub content_hash: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
    pub total_pages: u32,
    pub chunk_count: u32,
    pub is_ready: bool,
    /// Reason for the last permanent failure, if any.
    pub error_message: Option<String>,
}

impl Document {
    /// A freshly uploaded document, waiting for its first run.
    pub fn queued(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        display_name: impl Into<String>,
        content_type: impl Into<String>,
        byte_size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            display_name: display_name.into(),
            content_type: content_type.into(),
            byte_size,
            content_hash: String::new(),
            uploaded_at: Utc::now(),
            status: DocumentStatus::Queued,
            total_pages: 0,
            chunk_count: 0,
            is_ready: false,
            error_message: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = hash.into();
        self
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            document_id: self.id.clone(),
            status: self.status,
            total_pages: self.total_pages,
            chunk_count: self.chunk_count,
            is_ready: self.is_ready,
            error_message: self.error_message.clone(),
        }
    }
}

/// Read-only view of a document's pipeline state, as returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub document_id: String,
    pub status: DocumentStatus,
    pub total_pages: u32,
    pub chunk_count: u32,
    pub is_ready: bool,
    pub error_message: Option<String>,
}

/// A bounded span of one page's text with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// 1-based page the text came from.
    pub page: u32,
    /// Contiguous from 0 across the whole document.
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub section: Option<String>,
    /// Empty until the embedding step fills it in.
    pub embedding: Vec<f32>,
}

/// A chunk returned by similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub page: u32,
    pub chunk_index: i64,
    pub text: String,
    pub section: Option<String>,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub similarity: f32,
}

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => anyhow::bail!("unknown message role: {}", other),
        }
    }
}

/// Reference from an answer back to the chunk that supports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub page: u32,
    pub chunk_index: i64,
    pub snippet: String,
    /// Cosine similarity of the cited chunk, 0–1 decimal for relevant hits.
    pub similarity: f32,
}

/// One immutable chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl Message {
    pub fn new(session_id: &str, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            citations: Vec::new(),
        }
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }
}

/// A user question and the assistant answer that followed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub user: Message,
    pub assistant: Message,
}

impl Turn {
    /// Pair two messages, clamping the answer's timestamp so that
    /// timestamps within a session never decrease.
    pub fn new(user: Message, mut assistant: Message) -> Self {
        if assistant.created_at < user.created_at {
            assistant.created_at = user.created_at;
        }
        Self { user, assistant }
    }
}

/// A conversation, optionally pinned to one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub id: String,
    pub owner_id: String,
    pub document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_only_transitions() {
        use DocumentStatus::*;
        assert!(Queued.can_advance_to(Processing, false));
        assert!(Processing.can_advance_to(Completed, false));
        assert!(Processing.can_advance_to(Failed, false));
        assert!(!Completed.can_advance_to(Processing, false));
        assert!(!Failed.can_advance_to(Queued, false));
        assert!(!Processing.can_advance_to(Queued, true));
        assert!(!Completed.can_advance_to(Failed, false));
    }

    #[test]
    fn new_run_leaves_terminal_state() {
        use DocumentStatus::*;
        assert!(Completed.can_advance_to(Processing, true));
        assert!(Failed.can_advance_to(Queued, true));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ["queued", "processing", "completed", "failed"] {
            assert_eq!(s.parse::<DocumentStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn turn_timestamps_never_decrease() {
        let mut user = Message::new("s1", Role::User, "hi");
        let mut assistant = Message::new("s1", Role::Assistant, "hello");
        assistant.created_at = user.created_at - chrono::Duration::seconds(5);
        user.created_at = Utc::now();
        let turn = Turn::new(user, assistant);
        assert!(turn.assistant.created_at >= turn.user.created_at);
    }
}
