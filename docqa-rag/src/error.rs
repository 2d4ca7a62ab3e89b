//! Error types for the `docqa-rag` crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in retrieval operations.
///
/// There is deliberately no "user not found" variant: unknown users get an
/// empty index on first access.
#[derive(Debug, Error)]
pub enum RagError {
    /// The document text could not be chunked (malformed or unreadable text,
    /// or an unusable chunker configuration). Fatal to that document.
    #[error("Chunking error: {0}")]
    Chunking(String),

    /// The embedding backend failed.
    #[error("Embedding error ({provider}){}: {message}", format_index(.index))]
    Embedding {
        /// The embedding provider that produced the error.
        provider: String,
        /// Position of the failing input within the call, when known.
        index: Option<usize>,
        /// A description of the failure.
        message: String,
    },

    /// Stored embeddings and new embeddings disagree on dimension or model.
    /// The user's documents must be re-indexed.
    #[error("Index corruption for user '{user_id}': expected {expected}, found {found}")]
    IndexCorruption {
        /// Owner of the affected index.
        user_id: String,
        /// What the index holds.
        expected: String,
        /// What was offered.
        found: String,
    },

    /// The persistent backing store failed.
    #[error("Index store error ({backend}): {message}")]
    Store {
        /// The store backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller passed an argument the core cannot act on.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Ingestion exceeded the configured timeout. Nothing was stored.
    #[error("Ingest of document '{document_id}' timed out after {timeout:?}")]
    IngestTimeout {
        /// The document that was being ingested.
        document_id: String,
        /// The configured limit.
        timeout: Duration,
    },
}

fn format_index(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" at input {i}"),
        None => String::new(),
    }
}

/// Stable discriminant of a [`RagError`], for mapping to API status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Chunking,
    Embedding,
    IndexCorruption,
    Store,
    Config,
    InvalidInput,
    Timeout,
}

impl RagError {
    /// Return the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Chunking(_) => ErrorKind::Chunking,
            Self::Embedding { .. } => ErrorKind::Embedding,
            Self::IndexCorruption { .. } => ErrorKind::IndexCorruption,
            Self::Store { .. } => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::IngestTimeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Embedding | ErrorKind::Store | ErrorKind::Timeout)
    }

    pub(crate) fn embedding(
        provider: impl Into<String>,
        index: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self::Embedding { provider: provider.into(), index, message: message.into() }
    }

    pub(crate) fn store(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store { backend: backend.into(), message: message.into() }
    }
}

/// A convenience result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_error_names_failing_index() {
        let err = RagError::embedding("Hashing", Some(3), "input too long");
        assert_eq!(err.to_string(), "Embedding error (Hashing) at input 3: input too long");
        assert_eq!(err.kind(), ErrorKind::Embedding);
        assert!(err.is_retryable());
    }

    #[test]
    fn embedding_error_without_index() {
        let err = RagError::embedding("OpenAI", None, "request failed");
        assert_eq!(err.to_string(), "Embedding error (OpenAI): request failed");
    }

    #[test]
    fn chunking_and_corruption_are_not_retryable() {
        assert!(!RagError::Chunking("bad".into()).is_retryable());
        let err = RagError::IndexCorruption {
            user_id: "alice".into(),
            expected: "hash/8".into(),
            found: "hash/16".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::IndexCorruption);
    }
}
