//! Turning uploaded bytes into text.
//!
//! Format-specific extraction (PDF and friends) lives outside this crate;
//! implement [`TextExtractor`] to plug one in.

use crate::error::{RagError, Result};

/// Converts an uploaded file into plain text.
pub trait TextExtractor: Send + Sync {
    /// # Errors
    ///
    /// Returns [`RagError::Chunking`] when the bytes cannot be read as text.
    fn extract(&self, bytes: &[u8]) -> Result<String>;
}

/// Treats the upload as UTF-8 text, stripping a leading byte-order mark and
/// normalising `\r\n` line endings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            RagError::Chunking(format!("document is not valid UTF-8 (byte {})", e.valid_up_to()))
        })?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        Ok(text.replace("\r\n", "\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf8_and_normalises_newlines() {
        let text = PlainTextExtractor.extract("\u{feff}line one\r\nline two".as_bytes()).unwrap();
        assert_eq!(text, "line one\nline two");
    }

    #[test]
    fn invalid_utf8_is_a_chunking_error() {
        let err = PlainTextExtractor.extract(&[b'o', b'k', 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, RagError::Chunking(msg) if msg.contains("byte 2")));
    }
}
