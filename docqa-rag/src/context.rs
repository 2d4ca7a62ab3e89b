//! Building the answer-generation context from ranked chunks.

use serde::{Deserialize, Serialize};

use crate::document::SearchResult;

/// Placed between consecutive chunks; counts toward the budget.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Text handed to answer generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssembledContext {
    pub text: String,
    /// The top-ranked chunk alone exceeded the budget and was cut.
    pub truncated: bool,
    /// How many chunks contributed text.
    pub chunks_used: usize,
    /// Source documents of the used chunks, in first-use order.
    pub document_ids: Vec<String>,
}

impl AssembledContext {
    /// Whether there is any context for the question.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Concatenate chunk texts in ranked order while they fit in
/// `max_context_length` characters.
///
/// Chunks are never split, except the top-ranked one when it alone is over
/// budget: it is cut at a character boundary and `truncated` is set.
pub fn assemble_context(results: &[SearchResult], max_context_length: usize) -> AssembledContext {
    let separator_len = CONTEXT_SEPARATOR.chars().count();
    let mut context = AssembledContext::default();
    let mut used = 0;

    for (i, result) in results.iter().enumerate() {
        let text = &result.chunk.text;
        let len = text.chars().count();
        let needed = if i == 0 { len } else { separator_len + len };

        if used + needed > max_context_length {
            if i == 0 {
                context.text = text.chars().take(max_context_length).collect();
                context.truncated = true;
                context.chunks_used = 1;
                context.document_ids.push(result.chunk.document_id.clone());
            }
            break;
        }

        if i > 0 {
            context.text.push_str(CONTEXT_SEPARATOR);
        }
        context.text.push_str(text);
        used += needed;
        context.chunks_used += 1;
        if !context.document_ids.contains(&result.chunk.document_id) {
            context.document_ids.push(result.chunk.document_id.clone());
        }
    }

    context
}
