//! Embedding provider trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that every embedding backend implements,
//! the [`ProviderError`] classification shared by all external model
//! calls, and pure helpers for vector serialization and similarity.
//!
//! Concrete providers (OpenAI, Ollama) live in the `docchat` app crate.

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by an external model provider.
///
/// Callers retry [`ProviderError::Transient`] with backoff and give up on
/// [`ProviderError::Permanent`] immediately.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Rate limiting, 5xx responses, network errors.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Bad request, auth failure, malformed response, disabled provider.
    #[error("provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Trait for embedding providers.
///
/// Implementations turn texts into fixed-dimension vectors, one per input,
/// in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use docchat_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

/// Check that a vector has the expected dimension and only finite values.
pub fn validate_vector(vec: &[f32], dims: usize) -> Result<(), String> {
    if vec.len() != dims {
        return Err(format!(
            "dimension mismatch: expected {}, got {}",
            dims,
            vec.len()
        ));
    }
    if vec.iter().any(|v| !v.is_finite()) {
        return Err("vector contains NaN or infinite values".to_string());
    }
    Ok(())
}
