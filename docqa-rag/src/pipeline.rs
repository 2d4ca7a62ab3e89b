//! Retrieval pipeline orchestrator.
//!
//! The [`RetrievalPipeline`] ties a [`Chunker`], an [`EmbeddingProvider`] and
//! the [`IsolationRegistry`] together: upload-time ingestion (chunk → embed →
//! insert) and query-time retrieval (embed → search → filter), plus context
//! assembly, clearing and statistics.
//!
//! # Example
//!
//! ```rust,ignore
//! use docqa_rag::{HashingEmbedder, RagConfig, RetrievalPipeline, UserId};
//!
//! let pipeline = RetrievalPipeline::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(HashingEmbedder::new(256)))
//!     .build()?;
//!
//! let alice = UserId::new("alice")?;
//! pipeline.ingest_text(&alice, "Rust has no garbage collector.").await?;
//! let results = pipeline.retrieve(&alice, "garbage collection", 4, 0.1).await?;
//! let context = pipeline.assemble_context(&results, 2000);
//! ```

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::chunking::{Chunker, TextChunker};
use crate::config::RagConfig;
use crate::context::{AssembledContext, assemble_context};
use crate::document::{
    Chunk, Document, DocumentSummary, IngestReport, QueryResult, UserId, UserStats,
};
use crate::embedding::{BatchEmbedder, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::extract::{PlainTextExtractor, TextExtractor};
use crate::index::{TITLE_METADATA_KEY, UserIndex};
use crate::registry::IsolationRegistry;
use crate::store::IndexStore;

/// The retrieval pipeline orchestrator.
///
/// Every operation takes the [`UserId`] it acts for; there is no way to reach
/// an index without naming its owner. Construct one via
/// [`RetrievalPipeline::builder()`].
pub struct RetrievalPipeline {
    config: RagConfig,
    embedder: BatchEmbedder,
    chunker: Arc<dyn Chunker>,
    extractor: Arc<dyn TextExtractor>,
    registry: IsolationRegistry,
    cache: Option<Arc<dyn QueryCache>>,
}

impl RetrievalPipeline {
    /// Create a new [`RetrievalPipelineBuilder`].
    pub fn builder() -> RetrievalPipelineBuilder {
        RetrievalPipelineBuilder::default()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Return a reference to the embedding provider.
    pub fn embedding_provider(&self) -> &Arc<dyn EmbeddingProvider> {
        self.embedder.provider()
    }

    /// Return a reference to the registry of user indexes.
    pub fn registry(&self) -> &IsolationRegistry {
        &self.registry
    }

    /// Ingest one document for `user_id`: chunk → embed → store.
    ///
    /// All-or-nothing: if chunking or any embedding fails, or the configured
    /// timeout expires, none of the document's chunks are stored. Concurrent
    /// ingests for one user embed in parallel and commit one at a time.
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidInput`] if `document.owner` is not `user_id`
    /// - [`RagError::Chunking`] / [`RagError::Embedding`] from the stages
    /// - [`RagError::IngestTimeout`] when the deadline passes
    /// - [`RagError::IndexCorruption`] on an embedding model change with
    ///   `auto_reindex` disabled
    /// - [`RagError::Store`] if the backing store rejects the update; the
    ///   in-memory index is put back as it was, including any chunks the
    ///   document overwrote
    pub async fn ingest(&self, user_id: &UserId, document: &Document) -> Result<IngestReport> {
        if document.owner != *user_id {
            return Err(RagError::InvalidInput(format!(
                "document '{}' belongs to '{}', not '{user_id}'",
                document.id, document.owner
            )));
        }

        // Fails fast on a model mismatch before spending embedding calls.
        self.user_index(user_id).await?;

        let prepared = self.prepare(document);
        let pairs = match self.config.ingest_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, prepared).await.map_err(|_| {
                error!(user_id = %user_id, document.id = %document.id, ?timeout, "ingest timed out");
                RagError::IngestTimeout { document_id: document.id.clone(), timeout }
            })??,
            None => prepared.await?,
        };

        if pairs.is_empty() {
            info!(user_id = %user_id, document.id = %document.id, chunk_count = 0, "ingested document (empty)");
            return Ok(IngestReport { document_id: document.id.clone(), chunks_stored: 0 });
        }

        let (index, _commit) = self.locked_index(user_id, true).await?;
        let (chunks_stored, undo) = index.insert_all_undoable(pairs).await?;
        if let Err(e) = self.registry.persist(&index).await {
            error!(user_id = %user_id, document.id = %document.id, error = %e, "persist failed, rolling back");
            index.undo_insert(undo).await;
            return Err(e);
        }

        info!(user_id = %user_id, document.id = %document.id, chunk_count = chunks_stored, "ingested document");
        Ok(IngestReport { document_id: document.id.clone(), chunks_stored })
    }

    /// Ingest already-extracted text as a new document.
    pub async fn ingest_text(&self, user_id: &UserId, text: &str) -> Result<IngestReport> {
        let document = Document::new(user_id.clone(), text);
        self.ingest(user_id, &document).await
    }

    /// Extract text from an uploaded file and ingest it.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Chunking`] when the extractor cannot read the bytes,
    /// plus everything [`ingest`](Self::ingest) returns.
    pub async fn ingest_bytes(
        &self,
        user_id: &UserId,
        title: Option<&str>,
        bytes: &[u8],
    ) -> Result<IngestReport> {
        let text = self.extractor.extract(bytes)?;
        let mut document = Document::new(user_id.clone(), text);
        document.title = title.map(str::to_string);
        self.ingest(user_id, &document).await
    }

    /// Return up to `k` of the user's chunks most similar to `question`,
    /// dropping those scoring below `min_similarity`.
    ///
    /// A user without documents gets an empty result, not an error.
    pub async fn retrieve(
        &self,
        user_id: &UserId,
        question: &str,
        k: usize,
        min_similarity: f32,
    ) -> Result<QueryResult> {
        self.retrieve_filtered(user_id, question, k, min_similarity, None).await
    }

    /// Like [`retrieve`](Self::retrieve), restricted to one of the user's documents.
    pub async fn retrieve_in_document(
        &self,
        user_id: &UserId,
        document_id: &str,
        question: &str,
        k: usize,
        min_similarity: f32,
    ) -> Result<QueryResult> {
        self.retrieve_filtered(user_id, question, k, min_similarity, Some(document_id)).await
    }

    /// Retrieve with the configured `top_k` and `similarity_threshold`, then
    /// assemble the context within `max_context_length`.
    pub async fn context_for(&self, user_id: &UserId, question: &str) -> Result<AssembledContext> {
        let results = self
            .retrieve(user_id, question, self.config.top_k, self.config.similarity_threshold)
            .await?;
        Ok(self.assemble_context(&results, self.config.max_context_length))
    }

    /// Concatenate ranked chunk texts within `max_context_length` characters.
    ///
    /// See [`context::assemble_context`](crate::context::assemble_context).
    pub fn assemble_context(
        &self,
        results: &QueryResult,
        max_context_length: usize,
    ) -> AssembledContext {
        let context = assemble_context(results, max_context_length);
        if context.truncated {
            warn!(max_context_length, "top-ranked chunk truncated to fit the context budget");
        }
        context
    }

    /// Delete all of the user's documents, including any persisted copy.
    pub async fn clear(&self, user_id: &UserId) -> Result<()> {
        self.registry.delete(user_id).await
    }

    /// Chunk and document counts for the user.
    pub async fn stats(&self, user_id: &UserId) -> Result<UserStats> {
        let index = self.registry.get_or_create(user_id).await?;
        Ok(index.stats().await)
    }

    /// The user's documents, in upload order.
    pub async fn documents(&self, user_id: &UserId) -> Result<Vec<DocumentSummary>> {
        let index = self.registry.get_or_create(user_id).await?;
        Ok(index.documents().await)
    }

    /// Remove one document, returning how many chunks were dropped.
    pub async fn delete_document(&self, user_id: &UserId, document_id: &str) -> Result<usize> {
        let (index, _commit) = self.locked_index(user_id, false).await?;
        let removed = index.delete_document(document_id).await;
        if removed > 0 {
            self.registry.persist(&index).await?;
        }
        info!(user_id = %user_id, document.id = document_id, removed, "deleted document");
        Ok(removed)
    }

    /// Re-embed every stored chunk of the user with the current provider and
    /// swap the rebuilt index in. Returns the number of chunks re-embedded.
    ///
    /// Ingests that finish while the rebuild runs land in the rebuilt index.
    /// On failure the existing index is left untouched.
    pub async fn reindex(&self, user_id: &UserId) -> Result<usize> {
        loop {
            let index = self.registry.get_or_create(user_id).await?;
            if let Some(rebuilt) = self.rebuild(user_id, &index, true).await? {
                return Ok(rebuilt.size().await);
            }
        }
    }

    async fn retrieve_filtered(
        &self,
        user_id: &UserId,
        question: &str,
        k: usize,
        min_similarity: f32,
        document_id: Option<&str>,
    ) -> Result<QueryResult> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let index = self.user_index(user_id).await?;
        if index.is_empty().await {
            debug!(user_id = %user_id, "no documents indexed, returning empty result");
            return Ok(Vec::new());
        }

        let key = CacheKey {
            user_id: user_id.clone(),
            epoch: index.epoch(),
            generation: index.generation().await,
            question: question.to_string(),
            k,
            document_id: document_id.map(str::to_string),
        };

        let cached = match &self.cache {
            Some(cache) => cache.get(&key).await,
            None => None,
        };

        let ranked = match cached {
            Some(hit) => {
                debug!(user_id = %user_id, k, "query cache hit");
                hit
            }
            None => {
                let query_embedding = self.embedder.embed_one(question).await.map_err(|e| {
                    error!(user_id = %user_id, error = %e, "embedding failed during query");
                    e
                })?;
                let results = index.query_filtered(&query_embedding, k, document_id).await?;
                if let Some(cache) = &self.cache {
                    cache.put(key, results.clone()).await;
                }
                results
            }
        };

        let filtered: QueryResult =
            ranked.into_iter().filter(|r| r.score >= min_similarity).collect();

        info!(user_id = %user_id, k, result_count = filtered.len(), "retrieval completed");
        Ok(filtered)
    }

    /// Chunk and embed a document without touching any index.
    async fn prepare(&self, document: &Document) -> Result<Vec<(Chunk, Vec<f32>)>> {
        let mut chunks = self.chunker.chunk(document).map_err(|e| {
            error!(document.id = %document.id, error = %e, "chunking failed");
            e
        })?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(title) = &document.title {
            for chunk in &mut chunks {
                chunk.metadata.insert(TITLE_METADATA_KEY.to_string(), title.clone());
            }
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self.embedder.embed_all(&texts).await.map_err(|e| {
            error!(document.id = %document.id, error = %e, "embedding failed during ingestion");
            e
        })?;

        Ok(chunks.into_iter().zip(embeddings).collect())
    }

    /// The user's index, rebuilt first if it was made with another embedding model.
    async fn user_index(&self, user_id: &UserId) -> Result<Arc<UserIndex>> {
        loop {
            let index = self.registry.get_or_create(user_id).await?;
            let current = self.embedder.signature();
            if *index.signature() == current {
                return Ok(index);
            }

            if !self.config.auto_reindex {
                error!(user_id = %user_id, stored = %index.signature(), %current, "embedding model changed");
                return Err(RagError::IndexCorruption {
                    user_id: user_id.to_string(),
                    expected: index.signature().to_string(),
                    found: current.to_string(),
                });
            }

            if let Some(rebuilt) = self.rebuild(user_id, &index, false).await? {
                return Ok(rebuilt);
            }
        }
    }

    /// The user's current index together with its commit lock.
    ///
    /// Retries when the index is cleared or rebuilt while waiting for the
    /// lock, so a commit never lands in an index nobody can reach. With
    /// `rebuild_stale`, an index built by another model is re-embedded first.
    async fn locked_index(
        &self,
        user_id: &UserId,
        rebuild_stale: bool,
    ) -> Result<(Arc<UserIndex>, OwnedMutexGuard<()>)> {
        loop {
            let index = if rebuild_stale {
                self.user_index(user_id).await?
            } else {
                self.registry.get_or_create(user_id).await?
            };
            let commit = index.lock_commits().await;
            if self.registry.is_current(&index).await {
                return Ok((index, commit));
            }
            debug!(user_id = %user_id, epoch = index.epoch(), "index swapped while waiting, retrying");
        }
    }

    /// Re-embed `index` into a fresh index and swap it in.
    ///
    /// Runs under the old index's commit lock: every commit made to the old
    /// index before the lock is carried over, and callers that queued behind
    /// it get `None` once it has been replaced, telling them to look again.
    /// Unless `force` is set, an index already matching the current model is
    /// returned as is.
    async fn rebuild(
        &self,
        user_id: &UserId,
        index: &Arc<UserIndex>,
        force: bool,
    ) -> Result<Option<Arc<UserIndex>>> {
        let _commit = index.lock_commits().await;
        if !self.registry.is_current(index).await {
            debug!(user_id = %user_id, epoch = index.epoch(), "index already replaced");
            return Ok(None);
        }
        if !force && *index.signature() == self.embedder.signature() {
            return Ok(Some(index.clone()));
        }

        warn!(user_id = %user_id, stored = %index.signature(), current = %self.embedder.signature(), "re-indexing user");
        let chunks = index.chunks().await;
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self.embedder.embed_all(&texts).await.map_err(|e| {
            error!(user_id = %user_id, error = %e, "embedding failed during re-index");
            e
        })?;

        let fresh = Arc::new(UserIndex::new(user_id.clone(), self.embedder.signature()));
        let count = fresh.insert_all(chunks.into_iter().zip(embeddings).collect()).await?;
        let _fresh_commit = fresh.lock_commits().await;
        self.registry.replace(user_id, fresh.clone()).await?;
        self.registry.persist(&fresh).await?;

        info!(user_id = %user_id, chunk_count = count, signature = %fresh.signature(), "re-indexed user");
        Ok(Some(fresh))
    }
}

/// Builder for constructing a [`RetrievalPipeline`].
///
/// Only the embedding provider is required. The chunker defaults to a
/// [`TextChunker`] built from the config, and the extractor to
/// [`PlainTextExtractor`]; store and cache are off unless set.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = RetrievalPipeline::builder()
///     .config(RagConfig::builder().chunk_size(512).chunk_overlap(64).build()?)
///     .embedding_provider(Arc::new(embedder))
///     .index_store(Arc::new(JsonFileIndexStore::new("./data")))  // optional
///     .query_cache(Arc::new(InMemoryQueryCache::new(ttl, 1024)))  // optional
///     .build()?;
/// ```
#[derive(Default)]
pub struct RetrievalPipelineBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    chunker: Option<Arc<dyn Chunker>>,
    extractor: Option<Arc<dyn TextExtractor>>,
    index_store: Option<Arc<dyn IndexStore>>,
    query_cache: Option<Arc<dyn QueryCache>>,
}

impl RetrievalPipelineBuilder {
    /// Set the pipeline configuration. Defaults to [`RagConfig::default`].
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Replace the default chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Replace the default text extractor used by `ingest_bytes`.
    pub fn extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Persist user indexes in `store`.
    pub fn index_store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.index_store = Some(store);
        self
    }

    /// Cache retrieval results in `cache`.
    pub fn query_cache(mut self, cache: Arc<dyn QueryCache>) -> Self {
        self.query_cache = Some(cache);
        self
    }

    /// Build the [`RetrievalPipeline`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if the embedding provider is missing or
    /// the configuration is invalid.
    pub fn build(self) -> Result<RetrievalPipeline> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let embedding_provider = self
            .embedding_provider
            .ok_or_else(|| RagError::Config("embedding_provider is required".to_string()))?;
        if embedding_provider.dimensions() == 0 {
            return Err(RagError::Config("embedding dimension must be greater than zero".into()));
        }

        let chunker = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::new(TextChunker::new(config.chunker_config())?),
        };
        let embedder = BatchEmbedder::new(
            embedding_provider,
            config.embed_batch_size,
            config.embed_concurrency,
        );

        let mut registry = IsolationRegistry::new(embedder.signature());
        if let Some(store) = self.index_store {
            registry = registry.with_store(store);
        }

        Ok(RetrievalPipeline {
            config,
            embedder,
            chunker,
            extractor: self.extractor.unwrap_or_else(|| Arc::new(PlainTextExtractor)),
            registry,
            cache: self.query_cache,
        })
    }
}
