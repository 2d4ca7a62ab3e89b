//! Data types for users, documents, chunks, and search results.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RagError, Result};

/// Identifier of the user (or session) that owns an index.
///
/// Always non-empty and trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Create a user id.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidInput`] if the id is empty or whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(RagError::InvalidInput("user id must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = RagError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// An uploaded document. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique identifier for the document.
    pub id: String,
    /// The user that uploaded the document.
    pub owner: UserId,
    /// The extracted text content.
    pub text: String,
    /// When the document was uploaded.
    pub uploaded_at: DateTime<Utc>,
    /// Display name, typically the uploaded file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Key-value metadata copied onto every chunk.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Document {
    /// Create a document with a fresh random id, uploaded now.
    pub fn new(owner: UserId, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner,
            text: text.into(),
            uploaded_at: Utc::now(),
            title: None,
            metadata: HashMap::new(),
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the display title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A contiguous span of a [`Document`]'s text.
///
/// `start` and `end` are byte offsets into the source text and always fall on
/// character boundaries, so `&source[start..end] == text`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// `{document_id}_{index}`.
    pub id: String,
    /// The ID of the parent [`Document`].
    pub document_id: String,
    /// Position of this chunk within its document.
    pub index: usize,
    /// The text content of the chunk.
    pub text: String,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// Metadata inherited from the parent document plus `chunk_index`.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A retrieved [`Chunk`] paired with its cosine similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// The retrieved chunk.
    pub chunk: Chunk,
    /// The similarity score (higher is more relevant).
    pub score: f32,
}

/// Ranked search results, most similar first.
pub type QueryResult = Vec<SearchResult>;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_stored: usize,
}

/// Per-user counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStats {
    pub chunk_count: usize,
    pub document_count: usize,
}

/// One stored document as seen from its user's index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSummary {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub chunk_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_is_trimmed_and_non_empty() {
        assert_eq!(UserId::new("  alice ").unwrap().as_str(), "alice");
        assert!(UserId::new("   ").is_err());
        assert!(UserId::new("").is_err());
    }

    #[test]
    fn user_id_rejects_empty_on_deserialize() {
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
        let id: UserId = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(id.to_string(), "bob");
    }

    #[test]
    fn new_documents_get_distinct_ids() {
        let owner = UserId::new("alice").unwrap();
        let a = Document::new(owner.clone(), "one");
        let b = Document::new(owner, "two");
        assert_ne!(a.id, b.id);
    }
}
