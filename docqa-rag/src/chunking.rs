//! Document chunking.
//!
//! [`TextChunker`] greedily fills character windows of `chunk_size`, ending
//! each window at the last natural boundary its [`Splitter`] recognises, and
//! starts the next window `chunk_overlap` characters before the previous end.
//! A window with no usable boundary is force-split at the character limit.
//!
//! Sizes are counted in characters; [`Chunk::start`] and [`Chunk::end`] are
//! byte offsets on character boundaries.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::document::{Chunk, Document};
use crate::error::{RagError, Result};

/// Preferred place to end a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Splitter {
    /// End chunks after a blank line.
    Paragraph,
    /// End chunks after `.`, `!` or `?` followed by whitespace, or after a newline.
    #[default]
    Sentence,
    /// Fixed-size character windows.
    Raw,
}

/// Chunk sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
    /// Boundary preference.
    pub splitter: Splitter,
}

impl ChunkerConfig {
    /// # Errors
    ///
    /// Returns [`RagError::Chunking`] if `chunk_size` is zero or not larger
    /// than `chunk_overlap`.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Chunking("chunk_size must be greater than zero".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Chunking(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A strategy for splitting documents into chunks.
///
/// Implementations must be deterministic: the same document and
/// configuration always produce the same chunks.
pub trait Chunker: Send + Sync {
    /// Split a document into chunks.
    ///
    /// Returns an empty `Vec` if the document has empty text.
    fn chunk(&self, document: &Document) -> Result<Vec<Chunk>>;
}

/// The default [`Chunker`].
///
/// Chunk IDs are generated as `{document_id}_{chunk_index}`. Each chunk inherits
/// the parent document's metadata plus a `chunk_index` field.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::{ChunkerConfig, Splitter, TextChunker};
///
/// let chunker = TextChunker::new(ChunkerConfig {
///     chunk_size: 512,
///     chunk_overlap: 64,
///     splitter: Splitter::Sentence,
/// })?;
/// let chunks = chunker.chunk(&document)?;
/// ```
#[derive(Debug, Clone)]
pub struct TextChunker {
    config: ChunkerConfig,
}

impl TextChunker {
    /// Create a chunker, validating the configuration up front.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }
}

impl Chunker for TextChunker {
    fn chunk(&self, document: &Document) -> Result<Vec<Chunk>> {
        let mut chunks = chunk_text(&document.id, &document.text, &self.config)?;
        for chunk in &mut chunks {
            for (key, value) in &document.metadata {
                chunk.metadata.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(chunks)
    }
}

/// Split `text` into chunks belonging to `document_id`.
///
/// # Errors
///
/// Returns [`RagError::Chunking`] if the configuration is invalid or the
/// text contains NUL characters (binary data that slipped through extraction).
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkerConfig) -> Result<Vec<Chunk>> {
    let spans = split_spans(text, config)?;
    Ok(spans
        .into_iter()
        .enumerate()
        .map(|(index, span)| Chunk {
            id: format!("{document_id}_{index}"),
            document_id: document_id.to_string(),
            index,
            text: text[span.clone()].to_string(),
            start: span.start,
            end: span.end,
            metadata: [("chunk_index".to_string(), index.to_string())].into_iter().collect(),
        })
        .collect())
}

fn split_spans(text: &str, config: &ChunkerConfig) -> Result<Vec<Range<usize>>> {
    config.validate()?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if text.contains('\0') {
        return Err(RagError::Chunking("text contains NUL characters".to_string()));
    }

    let boundaries = boundaries(text, config.splitter);
    let mut spans = Vec::new();
    let mut start = 0;

    loop {
        let limit = advance_chars(text, start, config.chunk_size);
        if limit >= text.len() {
            spans.push(start..text.len());
            break;
        }

        // A chunk must be longer than the overlap, otherwise the next one
        // would not start past this one.
        let min_end = advance_chars(text, start, config.chunk_overlap + 1);
        let end = last_boundary_between(&boundaries, min_end, limit).unwrap_or(limit);

        spans.push(start..end);
        start = retreat_chars(text, end, config.chunk_overlap);
    }

    Ok(spans)
}

/// Byte offset `n` characters after `from`, clamped to the end of `text`.
fn advance_chars(text: &str, from: usize, n: usize) -> usize {
    text[from..].char_indices().nth(n).map_or(text.len(), |(i, _)| from + i)
}

/// Byte offset `n` characters before `to`, clamped to the start of `text`.
fn retreat_chars(text: &str, to: usize, n: usize) -> usize {
    if n == 0 {
        return to;
    }
    text[..to].char_indices().rev().nth(n - 1).map_or(0, |(i, _)| i)
}

fn last_boundary_between(boundaries: &[usize], min: usize, max: usize) -> Option<usize> {
    let idx = boundaries.partition_point(|&b| b <= max);
    boundaries[..idx].last().copied().filter(|&b| b >= min)
}

/// Sorted byte offsets where a chunk may end, strictly inside `text`.
fn boundaries(text: &str, splitter: Splitter) -> Vec<usize> {
    let mut out = match splitter {
        Splitter::Raw => return Vec::new(),
        Splitter::Paragraph => paragraph_boundaries(text),
        Splitter::Sentence => sentence_boundaries(text),
    };
    out.retain(|&b| b > 0 && b < text.len());
    out.sort_unstable();
    out.dedup();
    out
}

fn paragraph_boundaries(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut newlines = 0;
    for (i, c) in text.char_indices() {
        match c {
            '\n' => newlines += 1,
            '\r' => {}
            _ => {
                if newlines >= 2 {
                    out.push(i);
                }
                newlines = 0;
            }
        }
    }
    out
}

fn sentence_boundaries(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\n' => out.push(i + 1),
            '.' | '!' | '?' => {
                if let Some(&(j, next)) = chars.peek() {
                    if next.is_whitespace() {
                        out.push(j + next.len_utf8());
                    }
                }
            }
            _ => {}
        }
    }
    out
}
