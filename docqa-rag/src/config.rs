//! Configuration for the retrieval pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunking::{ChunkerConfig, Splitter};
use crate::error::{RagError, Result};

/// Configuration parameters for the retrieval pipeline.
///
/// Missing fields take their defaults when deserializing, so a config file
/// only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Number of characters shared between consecutive chunks.
    pub chunk_overlap: usize,
    /// Preferred chunk boundary.
    pub splitter: Splitter,
    /// Number of results returned when the caller does not pass `k`.
    pub top_k: usize,
    /// Results scoring below this are filtered out when the caller does not
    /// pass a threshold.
    pub similarity_threshold: f32,
    /// Character budget for assembled context.
    pub max_context_length: usize,
    /// Maximum number of texts sent to the embedding backend in one call.
    pub embed_batch_size: usize,
    /// Maximum number of embedding calls in flight for one ingest.
    pub embed_concurrency: usize,
    /// Whole-document ingest deadline, in milliseconds.
    pub ingest_timeout_ms: Option<u64>,
    /// Re-embed a user's chunks automatically when the embedding model changed.
    pub auto_reindex: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            splitter: Splitter::Sentence,
            top_k: 4,
            similarity_threshold: 0.0,
            max_context_length: 4000,
            embed_batch_size: 64,
            embed_concurrency: 4,
            ingest_timeout_ms: None,
            auto_reindex: true,
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// The chunking part of this configuration.
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            splitter: self.splitter,
        }
    }

    /// The ingest deadline, if any.
    pub fn ingest_timeout(&self) -> Option<Duration> {
        self.ingest_timeout_ms.map(Duration::from_millis)
    }

    /// Check that the parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if:
    /// - `chunk_size == 0` or `chunk_overlap >= chunk_size`
    /// - `top_k == 0`
    /// - `embed_batch_size == 0` or `embed_concurrency == 0`
    /// - `similarity_threshold` is outside `[-1, 1]`
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Config("chunk_size must be greater than zero".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Config(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(RagError::Config("top_k must be greater than zero".to_string()));
        }
        if self.embed_batch_size == 0 {
            return Err(RagError::Config("embed_batch_size must be greater than zero".to_string()));
        }
        if self.embed_concurrency == 0 {
            return Err(RagError::Config("embed_concurrency must be greater than zero".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(RagError::Config(format!(
                "similarity_threshold ({}) must be within [-1, 1]",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the maximum chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the preferred chunk boundary.
    pub fn splitter(mut self, splitter: Splitter) -> Self {
        self.config.splitter = splitter;
        self
    }

    /// Set the default number of results.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the default minimum similarity.
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.similarity_threshold = threshold;
        self
    }

    /// Set the context budget in characters.
    pub fn max_context_length(mut self, length: usize) -> Self {
        self.config.max_context_length = length;
        self
    }

    /// Set the embedding batch size.
    pub fn embed_batch_size(mut self, size: usize) -> Self {
        self.config.embed_batch_size = size;
        self
    }

    /// Set how many embedding batches may run at once.
    pub fn embed_concurrency(mut self, concurrency: usize) -> Self {
        self.config.embed_concurrency = concurrency;
        self
    }

    /// Fail an ingest that takes longer than `timeout`.
    pub fn ingest_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.config.ingest_timeout_ms = Some(millis);
        self
    }

    /// Enable or disable automatic re-embedding on model change.
    pub fn auto_reindex(mut self, enabled: bool) -> Self {
        self.config.auto_reindex = enabled;
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// See [`RagConfig::validate`].
    pub fn build(self) -> Result<RagConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RagConfig::default().validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let err = RagConfig::builder().chunk_size(100).chunk_overlap(100).build().unwrap_err();
        assert!(err.to_string().contains("chunk_overlap (100)"));
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(RagConfig::builder().top_k(0).build().is_err());
        assert!(RagConfig::builder().embed_batch_size(0).build().is_err());
        assert!(RagConfig::builder().embed_concurrency(0).build().is_err());
        assert!(RagConfig::builder().chunk_size(0).chunk_overlap(0).build().is_err());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        assert!(RagConfig::builder().similarity_threshold(1.5).build().is_err());
        assert!(RagConfig::builder().similarity_threshold(-0.5).build().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: RagConfig =
            serde_json::from_str(r#"{ "chunk_size": 300, "splitter": "paragraph" }"#).unwrap();
        assert_eq!(config.chunk_size, 300);
        assert_eq!(config.splitter, Splitter::Paragraph);
        assert_eq!(config.chunk_overlap, 200);
        assert!(config.auto_reindex);
    }

    #[test]
    fn ingest_timeout_keeps_millisecond_precision() {
        let config =
            RagConfig::builder().ingest_timeout(Duration::from_millis(250)).build().unwrap();
        assert_eq!(config.ingest_timeout_ms, Some(250));
        assert_eq!(config.ingest_timeout(), Some(Duration::from_millis(250)));

        let config: RagConfig = serde_json::from_str(r#"{ "ingest_timeout_ms": 1500 }"#).unwrap();
        assert_eq!(config.ingest_timeout(), Some(Duration::from_millis(1500)));
    }
}
