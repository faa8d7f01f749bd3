//! Processing status tracker.
//!
//! Transitions are written through: the document row is persisted first,
//! then the committed state is published to an in-memory snapshot map.
//! [`StatusTracker::get_status`] reads only that map (falling back to a
//! single row read on a miss), so polling never waits on an ingestion run
//! and always sees the last committed state.
//!
//! ```text
//! queued ──▶ processing ──▶ completed
//!    │            │
//!    └────────────┴───────▶ failed
//! ```
//!
//! A terminal document only re-enters `queued`/`processing` through an
//! explicit new run ([`StatusTracker::requeue`] / [`StatusTracker::begin_run`]).
//! During a re-run the previous `chunk_count` and `is_ready` stay visible,
//! because the previous chunk set stays searchable until the atomic swap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::anyhow;

use docchat_core::models::{Document, DocumentStatus, StatusSnapshot};
use docchat_core::store::DocumentStore;

use crate::error::{Error, Result};

pub struct StatusTracker {
    documents: Arc<dyn DocumentStore>,
    snapshots: RwLock<HashMap<String, Document>>,
}

impl StatusTracker {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Last committed snapshot of `document_id`, as seen by `owner_id`.
    ///
    /// A document owned by someone else is reported as not found.
    pub async fn get_status(&self, document_id: &str, owner_id: &str) -> Result<StatusSnapshot> {
        let doc = self.current(document_id).await?;
        if doc.owner_id != owner_id {
            return Err(Error::document_not_found(document_id));
        }
        Ok(doc.snapshot())
    }

    /// The committed document row, from the snapshot map or the store.
    pub async fn current(&self, document_id: &str) -> Result<Document> {
        if let Some(doc) = self.cached(document_id)? {
            return Ok(doc);
        }
        let doc = self
            .documents
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::document_not_found(document_id))?;
        // A concurrent transition may have published a newer row meanwhile.
        let mut snapshots = self.write_snapshots()?;
        let doc = snapshots
            .entry(document_id.to_string())
            .or_insert(doc)
            .clone();
        Ok(doc)
    }

    /// Make an already-persisted document visible to pollers.
    pub fn publish(&self, doc: &Document) -> Result<()> {
        self.write_snapshots()?.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    /// Put a terminal document back in the queue for a new run.
    pub async fn requeue(&self, document_id: &str) -> Result<Document> {
        self.advance(document_id, DocumentStatus::Queued, true, |doc| {
            doc.error_message = None;
        })
        .await
    }

    /// Enter `processing` for a new run.
    pub async fn begin_run(&self, document_id: &str) -> Result<Document> {
        self.advance(document_id, DocumentStatus::Processing, true, |doc| {
            doc.error_message = None;
        })
        .await
    }

    /// Record a successful run. The new chunk set is already committed;
    /// a document with no chunks completes but is not ready for retrieval.
    pub async fn complete(
        &self,
        document_id: &str,
        total_pages: u32,
        chunk_count: u32,
    ) -> Result<Document> {
        self.advance(document_id, DocumentStatus::Completed, false, |doc| {
            doc.total_pages = total_pages;
            doc.chunk_count = chunk_count;
            doc.is_ready = chunk_count > 0;
            doc.error_message = None;
        })
        .await
    }

    /// Record a permanent failure. Counts and readiness of any previous
    /// successful run are kept.
    pub async fn fail(&self, document_id: &str, error_message: &str) -> Result<Document> {
        let message = error_message.to_string();
        self.advance(document_id, DocumentStatus::Failed, false, move |doc| {
            doc.error_message = Some(message);
        })
        .await
    }

    async fn advance(
        &self,
        document_id: &str,
        next: DocumentStatus,
        new_run: bool,
        apply: impl FnOnce(&mut Document),
    ) -> Result<Document> {
        let mut doc = self.current(document_id).await?;
        let from = doc.status;
        if !from.can_advance_to(next, new_run) {
            return Err(Error::Internal(anyhow!(
                "illegal status transition for document {}: {} -> {}",
                document_id,
                from,
                next
            )));
        }

        doc.status = next;
        apply(&mut doc);
        self.documents.update_document(&doc).await?;
        self.publish(&doc)?;

        tracing::info!(
            document_id,
            from = %from,
            to = %next,
            chunks = doc.chunk_count,
            "document status changed"
        );
        Ok(doc)
    }

    fn cached(&self, document_id: &str) -> Result<Option<Document>> {
        Ok(self
            .snapshots
            .read()
            .map_err(|_| anyhow!("status snapshot lock poisoned"))?
            .get(document_id)
            .cloned())
    }

    fn write_snapshots(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Document>>> {
        Ok(self
            .snapshots
            .write()
            .map_err(|_| anyhow!("status snapshot lock poisoned"))?)
    }
}
