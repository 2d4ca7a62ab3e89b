//! Embedding provider trait and the batching front end the pipeline uses.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{RagError, Result};

/// A provider that generates vector embeddings from text input.
///
/// Implementations wrap specific embedding backends behind a unified async
/// interface. The embedding of a text must not depend on the other texts in
/// the same batch.
///
/// When one input cannot be embedded the whole call fails with
/// [`RagError::Embedding`], whose `index` names the failing position.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::EmbeddingProvider;
///
/// let provider = HashingEmbedder::new(256);
/// let vectors = provider.embed_batch(&["hello", "world"]).await?;
/// assert_eq!(vectors[0].len(), provider.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding vectors for a batch of text inputs, in order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text]).await?;
        vectors.pop().ok_or_else(|| {
            RagError::embedding(self.model(), Some(0), "provider returned no embedding")
        })
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// Return the name of the model behind this provider.
    fn model(&self) -> &str;

    /// The identity stored alongside every index built with this provider.
    fn signature(&self) -> EmbeddingSignature {
        EmbeddingSignature { model: self.model().to_string(), dimensions: self.dimensions() }
    }
}

/// Model name and dimension an index was built with.
///
/// Two signatures that differ mean the stored embeddings are not comparable
/// with new ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingSignature {
    pub model: String,
    pub dimensions: usize,
}

impl fmt::Display for EmbeddingSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.dimensions)
    }
}

/// Splits large embedding requests into bounded batches.
///
/// At most `concurrency` batches are in flight at once and each holds at
/// most `batch_size` texts, which caps memory during large ingests. Every
/// returned vector is checked against the provider's declared dimension.
#[derive(Clone)]
pub struct BatchEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    concurrency: usize,
}

impl BatchEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, concurrency: usize) -> Self {
        Self { provider, batch_size: batch_size.max(1), concurrency: concurrency.max(1) }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn signature(&self) -> EmbeddingSignature {
        self.provider.signature()
    }

    /// Embed every text, one vector per input, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Embedding`] with the absolute index of the failing
    /// input if any batch fails or returns malformed output.
    pub async fn embed_all(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Boxed up front: a lazily mapped stream of borrowing futures is not
        // `Send`, and ingests must be spawnable.
        let pending: Vec<BoxFuture<'_, Result<Vec<Vec<f32>>>>> = texts
            .chunks(self.batch_size)
            .enumerate()
            .map(|(i, batch)| self.embed_one_batch(i * self.batch_size, batch).boxed())
            .collect();

        debug!(
            model = self.provider.model(),
            inputs = texts.len(),
            batches = pending.len(),
            concurrency = self.concurrency,
            "embedding texts"
        );

        let results: Vec<Vec<Vec<f32>>> =
            stream::iter(pending).buffered(self.concurrency).try_collect().await?;

        Ok(results.into_iter().flatten().collect())
    }

    /// Embed a single text, such as a query.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_one_batch(0, &[text]).await?;
        vectors.pop().ok_or_else(|| {
            RagError::embedding(self.provider.model(), Some(0), "provider returned no embedding")
        })
    }

    async fn embed_one_batch(&self, offset: usize, batch: &[&str]) -> Result<Vec<Vec<f32>>> {
        let model = self.provider.model();
        let vectors = self.provider.embed_batch(batch).await.map_err(|e| match e {
            RagError::Embedding { provider, index, message } => {
                RagError::Embedding { provider, index: index.map(|i| i + offset), message }
            }
            other => other,
        })?;

        if vectors.len() != batch.len() {
            error!(model, expected = batch.len(), got = vectors.len(), "embedding count mismatch");
            return Err(RagError::embedding(
                model,
                Some(offset + vectors.len().min(batch.len())),
                format!("expected {} embeddings, got {}", batch.len(), vectors.len()),
            ));
        }

        let dimensions = self.provider.dimensions();
        if let Some(bad) = vectors.iter().position(|v| v.len() != dimensions) {
            error!(model, index = offset + bad, "embedding has wrong dimension");
            return Err(RagError::embedding(
                model,
                Some(offset + bad),
                format!("expected dimension {dimensions}, got {}", vectors[bad].len()),
            ));
        }

        Ok(vectors)
    }
}

impl fmt::Debug for BatchEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEmbedder")
            .field("model", &self.provider.model())
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Embeds a text as `[len, 1.0]`; fails on any text equal to "boom".
    struct LengthEmbedder {
        calls: AtomicUsize,
        largest_batch: AtomicUsize,
    }

    impl LengthEmbedder {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), largest_batch: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.largest_batch.fetch_max(texts.len(), Ordering::SeqCst);
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    if *t == "boom" {
                        Err(RagError::embedding("length", Some(i), "cannot embed"))
                    } else {
                        Ok(vec![t.len() as f32, 1.0])
                    }
                })
                .collect()
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn model(&self) -> &str {
            "length"
        }
    }

    struct WrongDimension;

    #[async_trait]
    impl EmbeddingProvider for WrongDimension {
        async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0; 3]).collect())
        }

        fn dimensions(&self) -> usize {
            4
        }

        fn model(&self) -> &str {
            "wrong"
        }
    }

    #[tokio::test]
    async fn batches_are_capped_and_order_is_preserved() {
        let provider = Arc::new(LengthEmbedder::new());
        let embedder = BatchEmbedder::new(provider.clone(), 2, 3);
        let texts = ["a", "bb", "ccc", "dddd", "eeeee"];

        let vectors = embedder.embed_all(&texts).await.unwrap();

        let lengths: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(provider.largest_batch.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_index_is_absolute() {
        let embedder = BatchEmbedder::new(Arc::new(LengthEmbedder::new()), 2, 1);
        let err = embedder.embed_all(&["a", "b", "c", "boom", "e"]).await.unwrap_err();
        match err {
            RagError::Embedding { index, .. } => assert_eq!(index, Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn wrong_dimension_is_reported() {
        let embedder = BatchEmbedder::new(Arc::new(WrongDimension), 8, 1);
        let err = embedder.embed_all(&["x", "y"]).await.unwrap_err();
        assert!(matches!(err, RagError::Embedding { index: Some(0), .. }));
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let provider = Arc::new(LengthEmbedder::new());
        let embedder = BatchEmbedder::new(provider.clone(), 4, 2);
        assert!(embedder.embed_all(&[]).await.unwrap().is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn embed_all_can_run_on_a_spawned_task() {
        let embedder = BatchEmbedder::new(Arc::new(LengthEmbedder::new()), 1, 2);
        let vectors = tokio::spawn(async move {
            let texts = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            embedder.embed_all(&refs).await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(vectors.len(), 3);
    }

    #[test]
    fn signature_display() {
        let sig = EmbeddingSignature { model: "hash".into(), dimensions: 8 };
        assert_eq!(sig.to_string(), "hash/8");
    }
}
