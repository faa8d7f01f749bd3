//! Ingestion pipeline: upload, extract, chunk, embed, commit.
//!
//! ```text
//! upload ──▶ object store + queued row
//!               │
//! ingest ──▶ claim (single-flight) ──▶ processing
//!               │
//!               ├─ extract pages   (spawn_blocking, timeout)
//!               ├─ chunk pages     (page-aware, overlapping)
//!               ├─ embed batches   (buffer_unordered × workers, with retry)
//!               └─ replace_chunks  (one atomic swap)
//!                       │
//!                       ▼
//!              completed | failed
//! ```
//!
//! Nothing is written to the vector index until every chunk has an
//! embedding, so a failed run leaves the previous chunk set (if any)
//! untouched and searchable.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};

use docchat_core::chunk::{chunk_pages, ChunkingParams};
use docchat_core::embedding::{validate_vector, Embedder};
use docchat_core::models::{Chunk, Document, StatusSnapshot};
use docchat_core::store::{DocumentStore, VectorIndex};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::{normalize_content_type, resolve_content_type, ExtractError, TextExtractor};
use crate::objects::{content_hash, ObjectStore};
use crate::retry::{with_retry, RetryPolicy};
use crate::status::StatusTracker;

/// Tunables for the pipeline, taken from `[upload]`, `[chunking]`,
/// `[embedding]` and `[ingest]`.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub max_bytes: u64,
    pub allowed_types: Vec<String>,
    pub chunking: ChunkingParams,
    pub batch_size: usize,
    pub workers: usize,
    pub embed_retry: RetryPolicy,
    pub extract_timeout: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bytes: config.upload.max_bytes,
            allowed_types: config
                .upload
                .allowed_types
                .iter()
                .map(|t| normalize_content_type(t))
                .collect(),
            chunking: ChunkingParams::new(
                config.chunking.max_tokens,
                config.chunking.overlap_tokens,
            ),
            batch_size: config.embedding.batch_size.max(1),
            workers: config.embedding.workers.max(1),
            embed_retry: config.embedding_retry(),
            extract_timeout: config.extract_timeout(),
        }
    }
}

type InFlight = Arc<Mutex<HashSet<String>>>;

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Proof that the holder is the only run for a document. Released on drop.
pub struct IngestGuard {
    document_id: String,
    in_flight: InFlight,
}

impl IngestGuard {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.document_id);
    }
}

pub struct IngestPipeline {
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    tracker: Arc<StatusTracker>,
    settings: IngestSettings,
    in_flight: InFlight,
}

impl IngestPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        tracker: Arc<StatusTracker>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            documents,
            index,
            objects,
            extractor,
            embedder,
            tracker,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Validate and store an upload, creating a `queued` document.
    ///
    /// Bytes go to object storage before the document row exists, so a
    /// document is never visible without its content.
    pub async fn upload(
        &self,
        owner_id: &str,
        display_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<Document> {
        if owner_id.trim().is_empty() {
            return Err(Error::validation("owner id must not be empty"));
        }
        let content_type = self.check_upload(content_type, bytes)?;

        let id = uuid::Uuid::new_v4().to_string();
        let name = if display_name.trim().is_empty() {
            id.as_str()
        } else {
            display_name.trim()
        };
        let doc = Document::queued(&id, owner_id, name, content_type, bytes.len() as u64)
            .with_content_hash(content_hash(bytes));

        self.objects.put(&id, bytes).await?;
        self.documents.insert_document(&doc).await?;
        self.tracker.publish(&doc)?;

        tracing::info!(
            document_id = %doc.id,
            owner_id,
            content_type,
            bytes = doc.byte_size,
            "document uploaded"
        );
        Ok(doc)
    }

    /// Reserve the single ingestion slot for `document_id`.
    pub fn claim(&self, document_id: &str) -> Result<IngestGuard> {
        let mut in_flight = lock(&self.in_flight);
        if !in_flight.insert(document_id.to_string()) {
            tracing::warn!(document_id, "ingestion already in flight");
            return Err(Error::ConcurrencyConflict(document_id.to_string()));
        }
        Ok(IngestGuard {
            document_id: document_id.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_in_flight(&self, document_id: &str) -> bool {
        lock(&self.in_flight).contains(document_id)
    }

    /// Run ingestion for `document_id` to completion.
    ///
    /// Rejected with `ConcurrencyConflict` while another run for the same
    /// document is in flight. Running again after a terminal state replaces
    /// the previous chunk set.
    pub async fn ingest(
        &self,
        document_id: &str,
        bytes: &[u8],
        owner_id: &str,
    ) -> Result<StatusSnapshot> {
        let guard = self.claim(document_id)?;
        self.run(&guard, bytes, owner_id).await
    }

    /// Re-run ingestion from the bytes held in object storage.
    pub async fn reprocess(&self, document_id: &str, owner_id: &str) -> Result<StatusSnapshot> {
        let guard = self.claim(document_id)?;
        let bytes = self.load_for_rerun(&guard, owner_id).await?;
        self.run(&guard, &bytes, owner_id).await
    }

    /// Claim, requeue and run ingestion in a background task.
    ///
    /// Conflicts and ownership errors are reported before anything is
    /// spawned; the returned snapshot is the `queued` state.
    pub async fn spawn_reprocess(
        self: &Arc<Self>,
        document_id: &str,
        owner_id: &str,
    ) -> Result<StatusSnapshot> {
        let guard = self.claim(document_id)?;
        let doc = self.owned(document_id, owner_id).await?;
        let doc = if doc.status.is_terminal() {
            self.tracker.requeue(document_id).await?
        } else {
            doc
        };

        let pipeline = Arc::clone(self);
        let owner = owner_id.to_string();
        tokio::spawn(async move {
            let outcome = match pipeline.load_for_rerun(&guard, &owner).await {
                Ok(bytes) => pipeline.run(&guard, &bytes, &owner).await,
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                tracing::warn!(document_id = guard.document_id(), error = %err, "background reprocess failed");
            }
        });
        Ok(doc.snapshot())
    }

    /// Run ingestion for a freshly uploaded document in a background task.
    pub fn spawn_ingest(self: &Arc<Self>, doc: &Document, bytes: Vec<u8>) -> Result<()> {
        let guard = self.claim(&doc.id)?;
        let pipeline = Arc::clone(self);
        let owner = doc.owner_id.clone();
        tokio::spawn(async move {
            if let Err(err) = pipeline.run(&guard, &bytes, &owner).await {
                tracing::warn!(document_id = guard.document_id(), error = %err, "background ingestion failed");
            }
        });
        Ok(())
    }

    async fn owned(&self, document_id: &str, owner_id: &str) -> Result<Document> {
        let doc = self.tracker.current(document_id).await?;
        if doc.owner_id != owner_id {
            return Err(Error::document_not_found(document_id));
        }
        Ok(doc)
    }

    /// Read the stored bytes back. A failure to read them fails the run.
    async fn load_for_rerun(&self, guard: &IngestGuard, owner_id: &str) -> Result<Vec<u8>> {
        let document_id = guard.document_id();
        self.owned(document_id, owner_id).await?;
        match self.objects.get(document_id).await {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                let failure = Error::Processing(format!("stored content unavailable: {}", err));
                self.record_failure(document_id, &failure).await;
                Err(failure)
            }
        }
    }

    async fn run(
        &self,
        guard: &IngestGuard,
        bytes: &[u8],
        owner_id: &str,
    ) -> Result<StatusSnapshot> {
        let document_id = guard.document_id();
        let doc = self.owned(document_id, owner_id).await?;
        self.tracker.begin_run(document_id).await?;
        tracing::info!(document_id, bytes = bytes.len(), "ingestion started");

        match self.process(&doc, bytes).await {
            Ok((total_pages, chunk_count)) => {
                let done = self
                    .tracker
                    .complete(document_id, total_pages, chunk_count)
                    .await?;
                tracing::info!(
                    document_id,
                    pages = total_pages,
                    chunks = chunk_count,
                    "ingestion completed"
                );
                Ok(done.snapshot())
            }
            Err(err) => {
                self.record_failure(document_id, &err).await;
                Err(err)
            }
        }
    }

    async fn record_failure(&self, document_id: &str, err: &Error) {
        tracing::error!(document_id, error = %err, "ingestion failed");
        let current = match self.tracker.current(document_id).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(document_id, error = %e, "could not load document to record failure");
                return;
            }
        };
        // A stored-bytes failure can hit a queued document before its run begins.
        if current.status.is_terminal() {
            if let Err(e) = self.tracker.begin_run(document_id).await {
                tracing::error!(document_id, error = %e, "could not restart run to record failure");
                return;
            }
        }
        if let Err(e) = self.tracker.fail(document_id, &err.user_message()).await {
            tracing::error!(document_id, error = %e, "could not record failure");
        }
    }

    /// Extract, chunk, embed and commit. Returns `(total_pages, chunk_count)`.
    async fn process(&self, doc: &Document, bytes: &[u8]) -> Result<(u32, u32)> {
        if !doc.content_hash.is_empty() && content_hash(bytes) != doc.content_hash {
            return Err(Error::Processing(
                "content does not match the uploaded document".to_string(),
            ));
        }
        self.check_upload(&doc.content_type, bytes)?;

        let pages = self.extract(bytes, &doc.content_type).await?;
        let total_pages = pages.len() as u32;
        let empty = pages.iter().filter(|p| p.trim().is_empty()).count();
        tracing::debug!(document_id = %doc.id, pages = total_pages, empty, "text extracted");

        let mut chunks = chunk_pages(&doc.id, &pages, &self.settings.chunking);
        self.embed(&doc.id, &mut chunks).await?;

        self.index.replace_chunks(&doc.id, &chunks).await?;
        Ok((total_pages, chunks.len() as u32))
    }

    /// Size, emptiness and type checks shared by upload and each run.
    fn check_upload(&self, content_type: &str, bytes: &[u8]) -> Result<&'static str> {
        if bytes.is_empty() {
            return Err(Error::validation("document is empty"));
        }
        if bytes.len() as u64 > self.settings.max_bytes {
            return Err(Error::validation(format!(
                "document is {} bytes, limit is {}",
                bytes.len(),
                self.settings.max_bytes
            )));
        }
        let resolved = resolve_content_type(content_type, bytes)
            .map_err(|e| Error::validation(e.to_string()))?;
        if !self.settings.allowed_types.iter().any(|t| t == resolved) {
            return Err(Error::validation(format!(
                "content type {} is not allowed",
                resolved
            )));
        }
        Ok(resolved)
    }

    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>> {
        let extractor = Arc::clone(&self.extractor);
        let data = bytes.to_vec();
        let content_type = content_type.to_string();
        let task = tokio::task::spawn_blocking(move || extractor.extract_pages(&data, &content_type));

        let timeout = self.settings.extract_timeout;
        match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(Error::Processing(format!(
                "text extraction timed out after {}s",
                timeout.as_secs()
            ))),
            Ok(Err(join)) => Err(Error::Processing(format!("text extraction aborted: {}", join))),
            Ok(Ok(Err(err))) => Err(extract_error(err)),
            Ok(Ok(Ok(pages))) => Ok(pages),
        }
    }

    /// Fill in every chunk's embedding, or fail without touching any store.
    async fn embed(&self, document_id: &str, chunks: &mut [Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let batch_size = self.settings.batch_size;
        let policy = self.settings.embed_retry;
        let embedder = &self.embedder;

        let batches: Vec<(usize, Vec<String>)> = chunks
            .chunks(batch_size)
            .enumerate()
            .map(|(i, batch)| (i, batch.iter().map(|c| c.text.clone()).collect()))
            .collect();
        let batch_count = batches.len();

        let results: Vec<(usize, Vec<Vec<f32>>)> = stream::iter(batches)
            .map(|(i, texts)| async move {
                let vectors = with_retry("embedding", &policy, || embedder.embed(&texts)).await?;
                if vectors.len() != texts.len() {
                    return Err(Error::Processing(format!(
                        "embedding provider returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    )));
                }
                Ok((i, vectors))
            })
            .buffer_unordered(self.settings.workers)
            .try_collect()
            .await
            .map_err(|err| match err {
                Error::Upstream { message, .. } => {
                    Error::Processing(format!("embedding failed: {}", message))
                }
                other => other,
            })?;

        let dims = self.embedder.dims();
        for (i, vectors) in results {
            for (offset, vector) in vectors.into_iter().enumerate() {
                let chunk = &mut chunks[i * batch_size + offset];
                validate_vector(&vector, dims).map_err(|e| {
                    Error::Processing(format!("chunk {}: {}", chunk.chunk_index, e))
                })?;
                chunk.embedding = vector;
            }
        }
        tracing::debug!(
            document_id,
            chunks = chunks.len(),
            batches = batch_count,
            "chunks embedded"
        );
        Ok(())
    }
}

fn extract_error(err: ExtractError) -> Error {
    if err.is_validation() {
        Error::validation(err.to_string())
    } else {
        Error::Processing(err.to_string())
    }
}
