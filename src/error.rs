//! Error taxonomy for docchat operations.
//!
//! Storage and extraction plumbing report `anyhow::Error`; the pipeline,
//! tracker and composer convert failures into [`Error`] at their boundary
//! so the HTTP layer and CLI can map them to stable codes.

use thiserror::Error;

use docchat_core::embedding::ProviderError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad file type or size, malformed request.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown document or chat, or one owned by someone else.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Extraction or embedding failed during ingestion.
    #[error("processing failed: {0}")]
    Processing(String),

    /// Embedding or LLM provider failure, including timeouts.
    #[error("{service} request failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
        transient: bool,
    },

    /// Another ingestion run for the same document is in flight.
    #[error("ingestion already in progress for document {0}")]
    ConcurrencyConflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn document_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "document",
            id: id.into(),
        }
    }

    pub fn chat_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "chat",
            id: id.into(),
        }
    }

    pub fn upstream(service: &'static str, err: &ProviderError) -> Self {
        Error::Upstream {
            service,
            message: err.to_string(),
            transient: err.is_transient(),
        }
    }

    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "bad_request",
            Error::NotFound { .. } => "not_found",
            Error::Processing(_) => "processing_failed",
            Error::Upstream { .. } => "upstream_error",
            Error::ConcurrencyConflict(_) => "conflict",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Upstream {
                transient: true,
                ..
            }
        )
    }

    /// Message safe to show an end user. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Error::Internal(_) => "internal error".to_string(),
            Error::Upstream { service, .. } => {
                format!("the {} service is unavailable, try again later", service)
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::validation("x").error_code(), "bad_request");
        assert_eq!(Error::document_not_found("d").error_code(), "not_found");
        assert_eq!(
            Error::ConcurrencyConflict("d".into()).error_code(),
            "conflict"
        );
        assert_eq!(
            Error::Internal(anyhow::anyhow!("boom")).error_code(),
            "internal"
        );
    }

    #[test]
    fn only_transient_upstream_is_retryable() {
        let transient = Error::upstream("embedding", &ProviderError::Transient("429".into()));
        let permanent = Error::upstream("embedding", &ProviderError::Permanent("401".into()));
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!Error::Processing("bad pdf".into()).is_retryable());
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = Error::Internal(anyhow::anyhow!("database is locked"));
        assert_eq!(err.user_message(), "internal error");
        assert_eq!(
            Error::document_not_found("abc").user_message(),
            "document not found: abc"
        );
    }
}
