//! Overlapping sliding-window text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `max_chars` bytes (window
//! arithmetic is byte-based, snapped to UTF-8 boundaries), with
//! `overlap_chars` bytes shared between consecutive chunks so that sentences
//! straddling a boundary remain retrievable. Splits prefer whitespace
//! boundaries to avoid cutting words. Chunking is deterministic given the
//! same text and configuration.
//!
//! Each chunk carries a SHA-256 hash of its text for staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Split text into overlapping chunks. Returns chunks with contiguous
/// indices starting at 0, and always at least one chunk.
pub fn chunk_text(document_id: &str, text: &str, max_chars: usize, overlap_chars: usize) -> Vec<Chunk> {
    debug_assert!(overlap_chars < max_chars);

    let trimmed = text.trim();
    if trimmed.len() <= max_chars {
        return vec![make_chunk(document_id, 0, trimmed)];
    }

    let mut chunks = Vec::new();
    let mut chunk_index: i64 = 0;
    let mut start = 0usize;
    let len = trimmed.len();

    while start < len {
        let mut end = floor_boundary(trimmed, (start + max_chars).min(len));
        // Snapping down can pin the window shut when a multibyte character
        // spans the limit; force at least one character of progress
        if end <= start {
            end = ceil_boundary(trimmed, start + 1);
        }

        // Prefer a whitespace boundary so words stay intact
        if end < len {
            if let Some(pos) = trimmed[start..end].rfind(char::is_whitespace) {
                if pos > 0 {
                    end = start + pos;
                }
            }
        }

        let piece = trimmed[start..end].trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(document_id, chunk_index, piece));
            chunk_index += 1;
        }

        if end >= len {
            break;
        }

        // Step back by the overlap; guard against non-progress on pathological
        // inputs (overlap larger than the distance advanced)
        let mut next = floor_boundary(trimmed, end.saturating_sub(overlap_chars));
        if next <= start {
            next = end;
        }
        start = next;
    }

    if chunks.is_empty() {
        chunks.push(make_chunk(document_id, 0, trimmed));
    }

    chunks
}

/// Largest char boundary `<= i`.
fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest char boundary `>= i`, capped at the end of the string.
fn ceil_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
