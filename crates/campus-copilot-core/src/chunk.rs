//! Paragraph-boundary text chunker.
//!
//! The embedding endpoint has an input cap, so long sources are split into
//! passages before they are embedded and indexed. Splitting happens on
//! paragraph boundaries (`\n\n`) so each passage stays coherent.
//!
//! Passage ids are derived from the source id and position
//! (`"{source_id}#{index}"`), which makes re-ingesting the same source
//! replace its passages in the index instead of duplicating them.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to a character budget.
//! 2. Split text on `\n\n` and accumulate paragraphs until the next one
//!    would exceed the budget, then flush.
//! 3. A paragraph larger than the budget is hard-split at the last
//!    newline or space before the limit (or at the limit itself).
//! 4. Whitespace-only input yields no passages.
//!
//! # Example
//!
//! ```rust
//! use campus_copilot_core::chunk::chunk_text;
//!
//! let passages = chunk_text("catalog/cs.md", "CS101 intro.\n\nCS201 data structures.", 700);
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].id, "catalog/cs.md#0");
//! ```

use sha2::{Digest, Sha256};

use crate::tokens::tokens_to_chars;

/// A slice of a source document, ready to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    pub id: String,
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

impl Passage {
    /// Passage `index` of `source_id`, with id `"{source_id}#{index}"`.
    pub fn new(source_id: &str, index: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        Passage {
            id: format!("{}#{}", source_id, index),
            index,
            text,
            hash,
        }
    }
}

/// Split `text` into passages of at most `max_tokens` (estimated).
///
/// Indices are contiguous from 0.
pub fn chunk_text(source_id: &str, text: &str, max_tokens: usize) -> Vec<Passage> {
    let max_chars = tokens_to_chars(max_tokens.max(1));
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_chars = para.chars().count();
        let would_be = if buf.is_empty() {
            para_chars
        } else {
            buf_chars + 2 + para_chars
        };

        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }

        if para_chars > max_chars {
            pieces.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
            buf_chars += 2;
        }
        buf.push_str(para);
        buf_chars += para_chars;
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| Passage::new(source_id, index, text))
        .collect()
}

/// Split an oversized paragraph into pieces of at most `max_chars` chars,
/// preferring to break after a newline or space.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = para;

    while !remaining.is_empty() {
        // Byte offset of the char limit, or the whole rest.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());

        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind(['\n', ' '])
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }

    out
}
