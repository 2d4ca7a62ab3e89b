//! Offline embedding provider based on feature hashing.
//!
//! Each lowercase word unigram and adjacent-word bigram is hashed (FNV-1a,
//! stable across platforms and releases) into one of `dimensions` buckets
//! with a hash-derived sign, and the result is L2-normalised. Texts that
//! share vocabulary land close together, which is enough for keyword-heavy
//! retrieval, tests and demos without any network access.

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

const MODEL_NAME: &str = "feature-hash-v1";
const DEFAULT_MAX_INPUT_CHARS: usize = 100_000;
const BIGRAM_WEIGHT: f32 = 0.5;

/// A deterministic, dependency-free [`EmbeddingProvider`].
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    max_input_chars: usize,
}

impl HashingEmbedder {
    /// Create an embedder producing vectors of `dimensions` components.
    ///
    /// A dimension of zero is bumped to one.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1), max_input_chars: DEFAULT_MAX_INPUT_CHARS }
    }

    /// Reject inputs longer than `max` characters.
    pub fn with_max_input_chars(mut self, max: usize) -> Self {
        self.max_input_chars = max;
        self
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            self.accumulate(&mut vector, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes(), BIGRAM_WEIGHT);
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let chars = text.chars().count();
                if chars > self.max_input_chars {
                    return Err(RagError::embedding(
                        MODEL_NAME,
                        Some(i),
                        format!("input has {chars} characters, limit is {}", self.max_input_chars),
                    ));
                }
                Ok(self.embed_text(text))
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        MODEL_NAME
    }
}
