//! Overlapping window chunker with stable boundaries.
//!
//! Boundaries depend only on the input text and the configured window, never
//! on embeddings or run order. Re-chunking unchanged text therefore
//! reproduces identical sequences, spans, and fingerprints, which is what
//! makes the incremental-skip diff in the ingestion pipeline sound.

use serde::{Deserialize, Serialize};

/// Window configuration for [`split_text`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum chunk length in chars.
    pub max_chars: usize,
    /// Chars shared between consecutive chunks.
    pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_chars: 100,
        }
    }
}

impl ChunkerConfig {
    /// Step between chunk starts. Overlap is clamped so the stride is always
    /// positive even on a misconfigured window.
    fn stride(&self) -> usize {
        let max = self.max_chars.max(1);
        let overlap = self.overlap_chars.min(max - 1);
        max - overlap
    }
}

/// A chunk of the input text together with its char span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    /// Half-open char range within the source text.
    pub span: (usize, usize),
}

/// Splits `text` into ordered overlapping chunks covering the whole input.
///
/// * Text no longer than the window yields exactly one chunk.
/// * Empty (or whitespace-only) text yields zero chunks; callers treat that
///   as a malformed record.
/// * A trailing window that would start at or past the end is not emitted;
///   the previous window already covers the tail.
pub fn split_text(text: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let max = config.max_chars.max(1);

    if total <= max {
        return vec![TextChunk {
            text: text.to_string(),
            span: (0, total),
        }];
    }

    let stride = config.stride();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < total {
        let end = (start + max).min(total);
        chunks.push(TextChunk {
            text: chars[start..end].iter().collect(),
            span: (start, end),
        });
        if end == total {
            break;
        }
        start += stride;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            max_chars: max,
            overlap_chars: overlap,
        }
    }

    #[test]
    fn short_text_yields_single_chunk() {
        let text = "x".repeat(500);
        let chunks = split_text(&text, &config(1000, 100));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].span, (0, 500));
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn empty_text_yields_zero_chunks() {
        assert!(split_text("", &ChunkerConfig::default()).is_empty());
        assert!(split_text("   \n\t", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn three_thousand_chars_at_1000_100_yields_four_chunks() {
        let text = "a".repeat(3000);
        let chunks = split_text(&text, &config(1000, 100));
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].span, (0, 1000));
        assert_eq!(chunks[1].span, (900, 1900));
        assert_eq!(chunks[2].span, (1800, 2800));
        assert_eq!(chunks[3].span, (2700, 3000));
    }

    #[test]
    fn chunks_cover_input_with_bounded_overlap() {
        let text: String = (0..2750).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let cfg = config(800, 150);
        let chunks = split_text(&text, &cfg);

        assert_eq!(chunks[0].span.0, 0);
        assert_eq!(chunks.last().unwrap().span.1, 2750);
        for pair in chunks.windows(2) {
            let overlap = pair[0].span.1.saturating_sub(pair[1].span.0);
            assert_eq!(overlap, cfg.overlap_chars);
        }

        // Dropping each chunk's leading overlap reconstructs the source.
        let mut rebuilt = chunks[0].text.clone();
        for pair in chunks.windows(2) {
            let skip = pair[0].span.1 - pair[1].span.0;
            rebuilt.extend(pair[1].text.chars().skip(skip));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn rechunking_reproduces_identical_boundaries() {
        let text: String = "The Financial Conduct Authority handbook contains rules and guidance. "
            .repeat(60);
        let cfg = config(1000, 100);
        let first = split_text(&text, &cfg);
        let second = split_text(&text, &cfg);
        assert_eq!(first, second);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "£".repeat(1500);
        let chunks = split_text(&text, &config(1000, 100));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text.chars().count(), 1000);
        assert_eq!(chunks[1].span, (900, 1500));
    }
}
