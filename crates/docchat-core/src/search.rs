//! Document-scoped similarity search.
//!
//! The ranking rules live here so every [`VectorIndex`] backend orders its
//! results identically:
//!
//! 1. Drop candidates whose similarity is below the threshold.
//! 2. Sort by similarity, descending.
//! 3. Break ties by ascending `chunk_index`.
//! 4. Truncate to `top_k`.
//!
//! [`search`] is the entry point callers use. It validates the request,
//! delegates to the backend, and re-checks that no chunk from another
//! document slipped through.

use anyhow::{bail, Result};
use std::cmp::Ordering;

use crate::models::ScoredChunk;
use crate::store::VectorIndex;

/// Inputs for one similarity search.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    /// Only chunks of this document are eligible.
    pub document_id: &'a str,
    /// Pre-computed query embedding.
    pub query_vec: &'a [f32],
    /// Maximum results to return.
    pub top_k: usize,
    /// Minimum cosine similarity for a chunk to qualify.
    pub similarity_threshold: f32,
}

/// Run a similarity search against a [`VectorIndex`] backend.
///
/// Returns at most `top_k` chunks of `document_id`, ranked as described in
/// the module docs. No qualifying chunks is an empty list, not an error.
pub async fn search<I: VectorIndex + ?Sized>(
    index: &I,
    req: &SearchRequest<'_>,
) -> Result<Vec<ScoredChunk>> {
    if req.document_id.trim().is_empty() {
        bail!("document_id must not be empty");
    }
    if req.query_vec.is_empty() {
        bail!("query embedding must not be empty");
    }
    if !(-1.0..=1.0).contains(&req.similarity_threshold) {
        bail!(
            "similarity_threshold must be in [-1.0, 1.0], got {}",
            req.similarity_threshold
        );
    }
    if req.top_k == 0 {
        return Ok(Vec::new());
    }

    let mut results = index
        .search(
            req.document_id,
            req.query_vec,
            req.top_k,
            req.similarity_threshold,
        )
        .await?;

    let before = results.len();
    results.retain(|r| r.document_id == req.document_id);
    if results.len() != before {
        tracing::error!(
            document_id = req.document_id,
            leaked = before - results.len(),
            "vector index returned chunks from other documents"
        );
    }

    Ok(rank(results, req.top_k, req.similarity_threshold))
}

/// Filter, order, and truncate candidates.
pub fn rank(mut candidates: Vec<ScoredChunk>, top_k: usize, threshold: f32) -> Vec<ScoredChunk> {
    candidates.retain(|c| c.similarity >= threshold);
    candidates.sort_by(compare_ranked);
    candidates.truncate(top_k);
    candidates
}

/// Similarity descending, then `chunk_index` ascending.
pub fn compare_ranked(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then(a.chunk_index.cmp(&b.chunk_index))
}
