//! RAG answer composer.
//!
//! One call to [`AnswerComposer::answer`] runs:
//!
//! 1. ownership checks, session creation on first message
//! 2. query embedding + document-scoped search (only with a ready document)
//! 3. history from the chat context cache, or the durable store on a miss
//! 4. budgeted prompt assembly
//! 5. the LLM call, with retry and timeout
//! 6. citation parsing
//! 7. durable append, then cache update
//!
//! Provider failures in steps 2 and 5 turn into [`FALLBACK_ANSWER`] with no
//! citations. A fallback is never written to the durable store or the cache.
//!
//! Step 7 runs under a per-chat lock, so turns are stamped, persisted and
//! cached in the same order. The lock is never held across a provider call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use docchat_core::cache::ChatContextCache;
use docchat_core::embedding::Embedder;
use docchat_core::models::{ChatSession, Citation, Message, Role, ScoredChunk, Turn};
use docchat_core::prompt::{assemble, parse_citations, PromptInput};
use docchat_core::search::{search, SearchRequest};
use docchat_core::store::{DocumentStore, MessageStore, VectorIndex};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::retry::{with_retry, RetryPolicy};

pub const FALLBACK_ANSWER: &str =
    "Sorry, I couldn't generate an answer right now. Please try again in a moment.";

/// Maximum accepted question length, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct ComposerSettings {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub prompt_budget_chars: usize,
    pub history_turns: usize,
    pub embed_retry: RetryPolicy,
    pub llm_retry: RetryPolicy,
}

impl ComposerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            similarity_threshold: config.retrieval.similarity_threshold,
            prompt_budget_chars: config.retrieval.prompt_budget_chars,
            history_turns: config.retrieval.history_turns,
            embed_retry: config.embedding_retry(),
            llm_retry: config.llm_retry(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    /// True when a provider failed and `text` is [`FALLBACK_ANSWER`].
    pub fallback: bool,
}

impl Answer {
    fn fallback() -> Self {
        Self {
            text: FALLBACK_ANSWER.to_string(),
            citations: Vec::new(),
            fallback: true,
        }
    }
}

pub struct AnswerComposer {
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    messages: Arc<dyn MessageStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    cache: Arc<ChatContextCache>,
    settings: ComposerSettings,
    commit_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AnswerComposer {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        messages: Arc<dyn MessageStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        cache: Arc<ChatContextCache>,
        settings: ComposerSettings,
    ) -> Self {
        Self {
            documents,
            index,
            messages,
            embedder,
            llm,
            cache,
            settings,
            commit_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &ChatContextCache {
        &self.cache
    }

    pub async fn answer(
        &self,
        chat_id: &str,
        owner_id: &str,
        message: &str,
        document_id: Option<&str>,
    ) -> Result<Answer> {
        let question = message.trim();
        if chat_id.trim().is_empty() {
            return Err(Error::validation("chat_id must not be empty"));
        }
        if question.is_empty() {
            return Err(Error::validation("message must not be empty"));
        }
        if question.chars().count() > MAX_MESSAGE_CHARS {
            return Err(Error::validation(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        let document = match document_id {
            Some(id) => {
                let doc = self
                    .documents
                    .get_document(id)
                    .await?
                    .filter(|d| d.owner_id == owner_id)
                    .ok_or_else(|| Error::document_not_found(id))?;
                Some(doc)
            }
            None => None,
        };

        let session = self
            .messages
            .ensure_session(chat_id, owner_id, document_id)
            .await?;
        if session.owner_id != owner_id {
            return Err(Error::chat_not_found(chat_id));
        }
        check_session_document(&session, document_id)?;

        let chunks = match &document {
            Some(doc) if doc.is_ready => match self.retrieve(&doc.id, question).await? {
                Some(chunks) => chunks,
                None => return Ok(Answer::fallback()),
            },
            Some(doc) => {
                tracing::info!(chat_id, document_id = %doc.id, status = %doc.status, "document not ready, answering without passages");
                Vec::new()
            }
            None => Vec::new(),
        };

        let history = self.history(chat_id).await?;
        let prompt = assemble(
            PromptInput {
                chunks: &chunks,
                history: &history,
                question,
                has_document: document.is_some(),
            },
            self.settings.prompt_budget_chars,
        );
        if prompt.dropped_turns > 0 || prompt.dropped_chunks > 0 {
            tracing::debug!(
                chat_id,
                dropped_turns = prompt.dropped_turns,
                dropped_chunks = prompt.dropped_chunks,
                "prompt trimmed to budget"
            );
        }

        let llm = &self.llm;
        let text = match with_retry("llm", &self.settings.llm_retry, || {
            llm.complete(&prompt.messages)
        })
        .await
        {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(chat_id, error = %err, "llm failed, returning fallback answer");
                return Ok(Answer::fallback());
            }
        };

        let citations = parse_citations(&text, &prompt.included);
        self.commit_turn(chat_id, question, &text, &citations).await?;

        tracing::info!(
            chat_id,
            passages = prompt.included.len(),
            citations = citations.len(),
            cache_hit_rate = self.cache.metrics().hit_rate(),
            "answer composed"
        );
        Ok(Answer {
            text,
            citations,
            fallback: false,
        })
    }

    /// Stamp, persist and cache one turn while holding the chat's commit
    /// lock. A durable write failure is logged and leaves the cache alone.
    async fn commit_turn(
        &self,
        chat_id: &str,
        question: &str,
        text: &str,
        citations: &[Citation],
    ) -> Result<()> {
        let lock = self.commit_lock(chat_id)?;
        {
            let _held = lock.lock().await;
            let turn = Turn::new(
                Message::new(chat_id, Role::User, question),
                Message::new(chat_id, Role::Assistant, text).with_citations(citations.to_vec()),
            );
            match self.messages.append_turn(&turn).await {
                Ok(()) => {
                    let ctx = self.cache.add_turn(chat_id, turn.user, turn.assistant);
                    tracing::debug!(chat_id, turns = ctx.turns.len(), "chat context updated");
                }
                Err(err) => {
                    tracing::error!(chat_id, error = %err, "could not persist turn, cache left unchanged");
                }
            }
        }
        self.release_commit_lock(chat_id, lock)
    }

    fn commit_lock(&self, chat_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .commit_locks
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("commit lock map poisoned")))?;
        Ok(locks.entry(chat_id.to_string()).or_default().clone())
    }

    /// Drop the map entry once no other answer for this chat holds it.
    fn release_commit_lock(&self, chat_id: &str, lock: Arc<tokio::sync::Mutex<()>>) -> Result<()> {
        let mut locks = self
            .commit_locks
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("commit lock map poisoned")))?;
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(chat_id);
        }
        Ok(())
    }

    /// Embed the question and search one document. `None` means the
    /// embedding provider failed and the caller should fall back.
    async fn retrieve(&self, document_id: &str, question: &str) -> Result<Option<Vec<ScoredChunk>>> {
        let embedder = &self.embedder;
        let texts = [question.to_string()];
        let query_vec = match with_retry("embedding", &self.settings.embed_retry, || {
            embedder.embed(&texts)
        })
        .await
        {
            Ok(mut vectors) if vectors.len() == 1 => vectors.remove(0),
            Ok(vectors) => {
                tracing::warn!(document_id, got = vectors.len(), "expected one query embedding");
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!(document_id, error = %err, "query embedding failed, returning fallback answer");
                return Ok(None);
            }
        };

        let chunks = search(
            self.index.as_ref(),
            &SearchRequest {
                document_id,
                query_vec: &query_vec,
                top_k: self.settings.top_k,
                similarity_threshold: self.settings.similarity_threshold,
            },
        )
        .await?;
        if chunks.is_empty() {
            tracing::info!(document_id, "no chunk cleared the similarity threshold");
        }
        Ok(Some(chunks))
    }

    /// Recent turns, oldest first, at most `history_turns`.
    async fn history(&self, chat_id: &str) -> Result<Vec<Turn>> {
        let turns: Vec<Turn> = match self.cache.get_context(chat_id) {
            Some(ctx) => ctx.turns.into_iter().collect(),
            None => {
                let turns = self
                    .messages
                    .recent_turns(chat_id, self.cache.max_turns())
                    .await?;
                self.cache.prime(chat_id, turns).turns.into_iter().collect()
            }
        };
        let skip = turns.len().saturating_sub(self.settings.history_turns);
        Ok(turns.into_iter().skip(skip).collect())
    }
}

/// A chat stays bound to the document it was opened with; naming another
/// document on a later message is rejected rather than mixing histories.
fn check_session_document(session: &ChatSession, document_id: Option<&str>) -> Result<()> {
    match document_id {
        Some(requested) if session.document_id.as_deref() != Some(requested) => {
            Err(Error::validation(format!(
                "chat {} is not about document {}",
                session.id, requested
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docchat_core::embedding::ProviderError;
    use docchat_core::models::{Chunk, Document};
    use docchat_core::prompt::PromptMessage;
    use docchat_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.0.len()
        }
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    /// Echoes a fixed reply, or fails permanently when `reply` is `None`.
    struct ScriptedLlm {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _messages: &[PromptMessage]) -> std::result::Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .ok_or_else(|| ProviderError::Permanent("model offline".into()))
        }
    }

    fn settings() -> ComposerSettings {
        let policy = RetryPolicy::new(0, Duration::from_secs(5), Duration::from_millis(1));
        ComposerSettings {
            top_k: 3,
            similarity_threshold: 0.5,
            prompt_budget_chars: 10_000,
            history_turns: 4,
            embed_retry: policy,
            llm_retry: policy,
        }
    }

    async fn ready_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let mut doc = Document::queued("d1", "alice", "guide.txt", "text/plain", 10);
        doc.is_ready = true;
        doc.chunk_count = 1;
        store.insert_document(&doc).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[Chunk {
                    id: "c0".into(),
                    document_id: "d1".into(),
                    page: 2,
                    chunk_index: 0,
                    text: "The warranty lasts two years.".into(),
                    hash: "h".into(),
                    section: None,
                    embedding: vec![1.0, 0.0],
                }],
            )
            .await
            .unwrap();
        store
    }

    fn composer(store: Arc<InMemoryStore>, query: Vec<f32>, reply: Option<&str>) -> (AnswerComposer, Arc<ScriptedLlm>) {
        let llm = Arc::new(ScriptedLlm {
            reply: reply.map(str::to_string),
            calls: AtomicUsize::new(0),
        });
        let composer = AnswerComposer::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(FixedEmbedder(query)),
            llm.clone(),
            Arc::new(ChatContextCache::new(8, 4).unwrap()),
            settings(),
        );
        (composer, llm)
    }

    #[tokio::test]
    async fn cited_answer_updates_store_and_cache() {
        let store = ready_store().await;
        let (composer, _) = composer(store.clone(), vec![1.0, 0.0], Some("Two years [C0]."));

        let answer = composer
            .answer("chat-1", "alice", "How long is the warranty?", Some("d1"))
            .await
            .unwrap();
        assert!(!answer.fallback);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].page, 2);

        let ctx = composer.cache().get_context("chat-1").unwrap();
        assert_eq!(ctx.last_turn().unwrap().assistant.content, "Two years [C0].");
        assert_eq!(store.recent_turns("chat-1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn llm_failure_returns_fallback_without_caching() {
        let store = ready_store().await;
        let (composer, llm) = composer(store.clone(), vec![1.0, 0.0], None);

        let answer = composer
            .answer("chat-1", "alice", "How long is the warranty?", Some("d1"))
            .await
            .unwrap();
        assert!(answer.fallback);
        assert_eq!(answer.text, FALLBACK_ANSWER);
        assert!(answer.citations.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

        let ctx = composer.cache().get_context("chat-1").unwrap();
        assert!(ctx.turns.is_empty());
        assert!(store.recent_turns("chat-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nothing_above_threshold_still_answers() {
        let store = ready_store().await;
        let (composer, _) = composer(store, vec![0.0, 1.0], Some("I could not find that in the document."));

        let answer = composer
            .answer("chat-1", "alice", "Who wrote it?", Some("d1"))
            .await
            .unwrap();
        assert!(!answer.fallback);
        assert!(answer.citations.is_empty());
    }

    #[tokio::test]
    async fn foreign_document_and_chat_are_not_found() {
        let store = ready_store().await;
        let (composer, _) = composer(store, vec![1.0, 0.0], Some("ok"));

        let err = composer
            .answer("chat-1", "mallory", "hi", Some("d1"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "not_found");

        composer.answer("chat-2", "alice", "hi", None).await.unwrap();
        let err = composer.answer("chat-2", "mallory", "hi", None).await.unwrap_err();
        assert_eq!(err.error_code(), "not_found");
    }

    #[tokio::test]
    async fn history_is_rebuilt_from_the_store_on_a_miss() {
        let store = ready_store().await;
        let (first, _) = composer(store.clone(), vec![1.0, 0.0], Some("Two years [C0]."));
        first
            .answer("chat-1", "alice", "How long is the warranty?", Some("d1"))
            .await
            .unwrap();

        // Fresh cache, same durable store.
        let (second, _) = composer(store, vec![1.0, 0.0], Some("Yes [C0]."));
        second
            .answer("chat-1", "alice", "Is that from purchase?", Some("d1"))
            .await
            .unwrap();
        let ctx = second.cache().get_context("chat-1").unwrap();
        assert_eq!(ctx.turns.len(), 2);
        assert_eq!(ctx.turns[0].assistant.content, "Two years [C0].");
    }

    #[tokio::test]
    async fn chat_cannot_switch_documents() {
        let store = ready_store().await;
        store
            .insert_document(&Document::queued("d2", "alice", "other.txt", "text/plain", 10))
            .await
            .unwrap();
        let (composer, llm) = composer(store, vec![1.0, 0.0], Some("Two years [C0]."));

        composer
            .answer("chat-1", "alice", "How long is the warranty?", Some("d1"))
            .await
            .unwrap();
        let err = composer
            .answer("chat-1", "alice", "And this one?", Some("d2"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "bad_request");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

        // Omitting the document keeps the conversation going.
        composer.answer("chat-1", "alice", "Thanks", None).await.unwrap();
        assert_eq!(composer.cache().get_context("chat-1").unwrap().turns.len(), 2);
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let (composer, _) = composer(Arc::new(InMemoryStore::new()), vec![1.0], Some("ok"));
        let err = composer.answer("chat-1", "alice", "   ", None).await.unwrap_err();
        assert_eq!(err.error_code(), "bad_request");
    }
}
