//! # docqa-rag
//!
//! Per-user isolated retrieval for document question answering.
//!
//! Uploaded text is split into overlapping chunks, embedded, and stored in an
//! index that belongs to exactly one user. Questions are embedded the same way
//! and answered with the nearest chunks of the asking user only. No operation
//! can reach another user's index: every call names its [`UserId`], and the
//! [`IsolationRegistry`] is the only place ids are resolved to indexes.
//!
//! ## Components
//!
//! - [`TextChunker`]: sentence/paragraph-aware chunking with overlap
//! - [`EmbeddingProvider`]: embedding backend trait, driven in batches by
//!   [`BatchEmbedder`]; [`HashingEmbedder`] works offline
//! - [`UserIndex`]: exact cosine top-k over one user's chunks
//! - [`IndexStore`]: optional persistence ([`JsonFileIndexStore`])
//! - [`QueryCache`]: optional result cache ([`InMemoryQueryCache`])
//! - [`RetrievalPipeline`]: ingest → retrieve → [`assemble_context`]
//!
//! ## Features
//!
//! - `openai`: [`openai::OpenAIEmbeddingProvider`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docqa_rag::{HashingEmbedder, RagConfig, RetrievalPipeline, UserId};
//!
//! let pipeline = RetrievalPipeline::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(HashingEmbedder::new(256)))
//!     .build()?;
//!
//! let alice = UserId::new("alice")?;
//! pipeline.ingest_text(&alice, "The mitochondria is the powerhouse of the cell.").await?;
//! let context = pipeline.context_for(&alice, "What powers the cell?").await?;
//! ```

pub mod cache;
pub mod chunking;
pub mod config;
pub mod context;
pub mod document;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod hashing;
pub mod index;
pub mod pipeline;
pub mod registry;
pub mod store;

#[cfg(feature = "openai")]
pub mod openai;

pub use cache::{CacheKey, InMemoryQueryCache, QueryCache};
pub use chunking::{Chunker, ChunkerConfig, Splitter, TextChunker, chunk_text};
pub use config::{RagConfig, RagConfigBuilder};
pub use context::{AssembledContext, CONTEXT_SEPARATOR, assemble_context};
pub use document::{
    Chunk, Document, DocumentSummary, IngestReport, QueryResult, SearchResult, UserId, UserStats,
};
pub use embedding::{BatchEmbedder, EmbeddingProvider, EmbeddingSignature};
pub use error::{ErrorKind, RagError, Result};
pub use extract::{PlainTextExtractor, TextExtractor};
pub use hashing::HashingEmbedder;
pub use index::{IndexSnapshot, SnapshotEntry, TITLE_METADATA_KEY, UserIndex};
pub use pipeline::{RetrievalPipeline, RetrievalPipelineBuilder};
pub use registry::IsolationRegistry;
pub use store::{InMemoryIndexStore, IndexStore, JsonFileIndexStore};
