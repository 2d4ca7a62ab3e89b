//! Per-user vector index with exact cosine similarity search.
//!
//! A [`UserIndex`] belongs to exactly one [`UserId`] and owns every chunk and
//! embedding stored in it. Vectors are L2-normalised on the way in, so a query
//! is a dot product against each stored vector followed by a bounded-heap
//! top-k selection. Search is exact; there is no approximate mode.
//!
//! Entries live in a `Vec` in insertion order behind a `tokio::sync::RwLock`:
//! one writer or many concurrent readers per user, and no lock shared between
//! users.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::document::{Chunk, DocumentSummary, QueryResult, SearchResult, UserId, UserStats};
use crate::embedding::EmbeddingSignature;
use crate::error::{RagError, Result};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Metadata key under which the pipeline records a document's title.
pub const TITLE_METADATA_KEY: &str = "title";

/// The isolated collection of one user's chunks and embeddings.
#[derive(Debug)]
pub struct UserIndex {
    user_id: UserId,
    signature: EmbeddingSignature,
    epoch: u64,
    state: RwLock<IndexState>,
    /// Serializes mutate-then-persist sequences; reads never take it.
    commit: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: Vec<Entry>,
    /// chunk id → position in `entries`
    positions: HashMap<String, usize>,
    /// document id → number of chunks
    documents: HashMap<String, usize>,
    generation: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    chunk: Chunk,
    /// Unit length, or all zeros for a zero input.
    vector: Vec<f32>,
}

/// Everything one [`UserIndex::insert_all_undoable`] changed.
#[derive(Debug, Default)]
pub(crate) struct InsertUndo {
    /// Chunk ids that did not exist before.
    added: HashSet<String>,
    /// Prior versions of overwritten chunks.
    replaced: Vec<Entry>,
}

/// Serializable copy of a [`UserIndex`], used by index stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSnapshot {
    pub user_id: UserId,
    pub signature: EmbeddingSignature,
    pub entries: Vec<SnapshotEntry>,
}

/// One stored chunk and its (normalised) embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

impl UserIndex {
    /// Create an empty index for `user_id` holding embeddings described by
    /// `signature`.
    pub fn new(user_id: UserId, signature: EmbeddingSignature) -> Self {
        Self {
            user_id,
            signature,
            epoch: next_epoch(),
            state: RwLock::new(IndexState::default()),
            commit: Arc::default(),
        }
    }

    /// Rebuild an index from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::IndexCorruption`] if any stored embedding does not
    /// match the snapshot's declared dimension.
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Result<Self> {
        let IndexSnapshot { user_id, signature, entries } = snapshot;
        let mut state = IndexState::default();
        for entry in entries {
            check_vector(&user_id, &signature, &entry.embedding)?;
            state.upsert(entry.chunk, normalized(entry.embedding));
        }
        Ok(Self {
            user_id,
            signature,
            epoch: next_epoch(),
            state: RwLock::new(state),
            commit: Arc::default(),
        })
    }

    /// The owner of this index.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Model and dimension every stored embedding was produced with.
    pub fn signature(&self) -> &EmbeddingSignature {
        &self.signature
    }

    /// Process-unique identity of this index instance. A user's index created
    /// after a clear never shares an epoch with its predecessor.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Take the commit lock. Whoever holds it is the only one mutating this
    /// index and saving it to the store.
    pub async fn lock_commits(&self) -> OwnedMutexGuard<()> {
        self.commit.clone().lock_owned().await
    }

    /// Counter bumped by every mutation.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    /// Store one chunk. An existing chunk with the same id is overwritten in
    /// place and keeps its original insertion position.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::IndexCorruption`] on a dimension mismatch and
    /// [`RagError::InvalidInput`] for non-finite components.
    pub async fn insert(&self, chunk: Chunk, embedding: Vec<f32>) -> Result<()> {
        self.check_vector(&embedding)?;
        let mut state = self.state.write().await;
        state.upsert(chunk, normalized(embedding));
        state.generation += 1;
        Ok(())
    }

    /// Store many chunks atomically: every embedding is validated before the
    /// first one is written, and all writes happen under one lock.
    ///
    /// Returns the number of pairs applied.
    pub async fn insert_all(&self, pairs: Vec<(Chunk, Vec<f32>)>) -> Result<usize> {
        let (count, _) = self.insert_all_undoable(pairs).await?;
        Ok(count)
    }

    /// [`insert_all`](Self::insert_all), also returning what is needed to
    /// put the index back with [`undo_insert`](Self::undo_insert).
    pub(crate) async fn insert_all_undoable(
        &self,
        pairs: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<(usize, InsertUndo)> {
        for (_, embedding) in &pairs {
            self.check_vector(embedding)?;
        }
        let mut undo = InsertUndo::default();
        if pairs.is_empty() {
            return Ok((0, undo));
        }

        let count = pairs.len();
        let mut state = self.state.write().await;
        for (chunk, embedding) in pairs {
            match state.positions.get(&chunk.id) {
                Some(&position) if !undo.added.contains(&chunk.id) => {
                    if !undo.replaced.iter().any(|e| e.chunk.id == chunk.id) {
                        undo.replaced.push(state.entries[position].clone());
                    }
                }
                Some(_) => {}
                None => {
                    undo.added.insert(chunk.id.clone());
                }
            }
            state.upsert(chunk, normalized(embedding));
        }
        state.generation += 1;
        debug!(user_id = %self.user_id, inserted = count, size = state.entries.len(), "index updated");
        Ok((count, undo))
    }

    /// Revert an insert. Only sound while no other mutation happened since,
    /// which holding [`lock_commits`](Self::lock_commits) guarantees.
    pub(crate) async fn undo_insert(&self, undo: InsertUndo) {
        let mut state = self.state.write().await;
        for entry in undo.replaced {
            state.upsert(entry.chunk, entry.vector);
        }
        if !undo.added.is_empty() {
            let removed: Vec<String> = state
                .entries
                .iter()
                .filter(|e| undo.added.contains(&e.chunk.id))
                .map(|e| e.chunk.document_id.clone())
                .collect();
            state.entries.retain(|e| !undo.added.contains(&e.chunk.id));
            for document_id in &removed {
                state.decrement_document(document_id);
            }
            state.reindex_positions();
        }
        state.generation += 1;
        debug!(user_id = %self.user_id, size = state.entries.len(), "insert undone");
    }

    /// Return the `k` chunks most similar to `embedding`, most similar first.
    ///
    /// Ties are broken by insertion order, earlier first. `k` larger than the
    /// index returns everything.
    pub async fn query(&self, embedding: &[f32], k: usize) -> Result<QueryResult> {
        self.query_filtered(embedding, k, None).await
    }

    /// Like [`query`](Self::query), restricted to one document when
    /// `document_id` is set.
    pub async fn query_filtered(
        &self,
        embedding: &[f32],
        k: usize,
        document_id: Option<&str>,
    ) -> Result<QueryResult> {
        self.check_vector(embedding)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = normalized(embedding.to_vec());
        let state = self.state.read().await;

        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k + 1);
        for (position, entry) in state.entries.iter().enumerate() {
            if document_id.is_some_and(|id| entry.chunk.document_id != id) {
                continue;
            }
            let score = dot(&query, &entry.vector).clamp(-1.0, 1.0);
            heap.push(Reverse(Candidate { score, position }));
            if heap.len() > k {
                heap.pop();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(c)| SearchResult {
                chunk: state.entries[c.position].chunk.clone(),
                score: c.score,
            })
            .collect())
    }

    /// Drop every chunk. Later queries return nothing until new inserts.
    pub async fn delete_all(&self) {
        let mut state = self.state.write().await;
        let generation = state.generation + 1;
        *state = IndexState { generation, ..IndexState::default() };
    }

    /// Drop every chunk of one document, returning how many were removed.
    pub async fn delete_document(&self, document_id: &str) -> usize {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|e| e.chunk.document_id != document_id);
        let removed = before - state.entries.len();
        if removed > 0 {
            state.documents.remove(document_id);
            state.reindex_positions();
            state.generation += 1;
        }
        removed
    }

    /// Number of stored chunks.
    pub async fn size(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Number of distinct documents.
    pub async fn document_count(&self) -> usize {
        self.state.read().await.documents.len()
    }

    pub async fn stats(&self) -> UserStats {
        let state = self.state.read().await;
        UserStats { chunk_count: state.entries.len(), document_count: state.documents.len() }
    }

    /// Stored documents in the order they were first inserted.
    pub async fn documents(&self) -> Vec<DocumentSummary> {
        let state = self.state.read().await;
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut out: Vec<DocumentSummary> = Vec::new();
        for entry in &state.entries {
            let id = entry.chunk.document_id.as_str();
            match seen.get(id) {
                Some(&i) => out[i].chunk_count += 1,
                None => {
                    seen.insert(id, out.len());
                    out.push(DocumentSummary {
                        document_id: id.to_string(),
                        title: entry.chunk.metadata.get(TITLE_METADATA_KEY).cloned(),
                        chunk_count: 1,
                    });
                }
            }
        }
        out
    }

    /// All stored chunks in insertion order.
    pub async fn chunks(&self) -> Vec<Chunk> {
        self.state.read().await.entries.iter().map(|e| e.chunk.clone()).collect()
    }

    pub async fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.read().await;
        IndexSnapshot {
            user_id: self.user_id.clone(),
            signature: self.signature.clone(),
            entries: state
                .entries
                .iter()
                .map(|e| SnapshotEntry { chunk: e.chunk.clone(), embedding: e.vector.clone() })
                .collect(),
        }
    }

    fn check_vector(&self, embedding: &[f32]) -> Result<()> {
        check_vector(&self.user_id, &self.signature, embedding)
    }
}

fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, AtomicOrdering::Relaxed)
}

fn check_vector(user_id: &UserId, signature: &EmbeddingSignature, embedding: &[f32]) -> Result<()> {
    if embedding.len() != signature.dimensions {
        return Err(RagError::IndexCorruption {
            user_id: user_id.to_string(),
            expected: format!("dimension {}", signature.dimensions),
            found: format!("dimension {}", embedding.len()),
        });
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(RagError::InvalidInput("embedding contains non-finite values".to_string()));
    }
    Ok(())
}

impl IndexState {
    fn upsert(&mut self, chunk: Chunk, vector: Vec<f32>) {
        match self.positions.get(&chunk.id) {
            Some(&position) => {
                let old_document = &self.entries[position].chunk.document_id;
                if *old_document != chunk.document_id {
                    let old_document = old_document.clone();
                    self.decrement_document(&old_document);
                    *self.documents.entry(chunk.document_id.clone()).or_default() += 1;
                }
                self.entries[position] = Entry { chunk, vector };
            }
            None => {
                *self.documents.entry(chunk.document_id.clone()).or_default() += 1;
                self.positions.insert(chunk.id.clone(), self.entries.len());
                self.entries.push(Entry { chunk, vector });
            }
        }
    }

    fn decrement_document(&mut self, document_id: &str) {
        if let Some(count) = self.documents.get_mut(document_id) {
            *count -= 1;
            if *count == 0 {
                self.documents.remove(document_id);
            }
        }
    }

    fn reindex_positions(&mut self) {
        self.positions =
            self.entries.iter().enumerate().map(|(i, e)| (e.chunk.id.clone(), i)).collect();
    }
}

/// A scored entry; "greater" means ranked higher.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    position: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score).then_with(|| other.position.cmp(&self.position))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalized(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
    vector
}
