//! Page-aware, overlapping text chunker.
//!
//! Splits each page's text into [`Chunk`]s that respect a configurable
//! `max_tokens` budget, carrying a short tail of the previous chunk on the
//! same page into the next one so passages near a boundary keep their
//! context.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` / `overlap_tokens` to characters (4 chars/token).
//! 2. Per page, split on `\n\n` paragraph boundaries and accumulate
//!    paragraphs into a body buffer of at most `max_chars - overlap_chars`.
//! 3. Paragraphs larger than the body budget are hard-split at the nearest
//!    newline or space boundary.
//! 4. Every body after the first on a page is prefixed with the last
//!    `overlap_chars` of the previous body, snapped to a word boundary.
//! 5. Pages with no text produce no chunks. Indices are contiguous from 0
//!    across the whole document.
//!
//! # Example
//!
//! ```rust
//! use docchat_core::chunk::{chunk_pages, ChunkingParams};
//!
//! let pages = vec!["Hello world.\n\nSecond paragraph.".to_string(), String::new()];
//! let chunks = chunk_pages("doc-123", &pages, &ChunkingParams::new(200, 0));
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].page, 1);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Longest line still considered a section title.
const MAX_HEADING_CHARS: usize = 80;

/// Chunk sizing, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl ChunkingParams {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_tokens,
        }
    }

    fn max_chars(&self) -> usize {
        (self.max_tokens * CHARS_PER_TOKEN).max(1)
    }

    /// Overlap never exceeds half of a chunk, so bodies always make progress.
    fn overlap_chars(&self) -> usize {
        (self.overlap_tokens * CHARS_PER_TOKEN).min(self.max_chars() / 2)
    }
}

/// Split extracted pages into overlapping chunks.
///
/// `pages[0]` is page 1. Chunks come back in reading order with contiguous
/// `chunk_index` values and empty `embedding` vectors.
pub fn chunk_pages(document_id: &str, pages: &[String], params: &ChunkingParams) -> Vec<Chunk> {
    let overlap = params.overlap_chars();
    let body_budget = params.max_chars() - overlap;

    let mut chunks = Vec::new();
    let mut chunk_index: i64 = 0;

    for (page_idx, page_text) in pages.iter().enumerate() {
        let page = page_idx as u32 + 1;
        let bodies = split_page(page_text, body_budget);
        let mut section: Option<String> = None;
        let mut previous: Option<&str> = None;

        for body in &bodies {
            if let Some(heading) = detect_heading(body) {
                section = Some(heading);
            }
            let text = match previous {
                Some(prev) if overlap > 0 => {
                    let tail = overlap_tail(prev, overlap);
                    if tail.is_empty() {
                        body.clone()
                    } else {
                        format!("{} {}", tail, body)
                    }
                }
                _ => body.clone(),
            };
            chunks.push(make_chunk(
                document_id,
                page,
                chunk_index,
                &text,
                section.clone(),
            ));
            chunk_index += 1;
            previous = Some(body.as_str());
        }
    }

    chunks
}

/// Split one page into chunk bodies of at most `max_chars` bytes.
fn split_page(text: &str, max_chars: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            bodies.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut bodies);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        bodies.push(current_buf);
    }

    bodies
}

/// Break an oversized paragraph at newline/space boundaries.
fn hard_split(paragraph: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let split_at = if split_at == 0 {
            next_char_boundary(remaining)
        } else {
            split_at
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// The last `max_chars` of `text`, starting at a word boundary.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text.trim();
    }
    let start = snap_forward_to_char_boundary(text, text.len() - max_chars);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(ws) if ws + 1 < tail.len() => tail[ws..].trim(),
        _ => tail.trim(),
    }
}

/// Pick a section title out of a chunk body: a markdown heading, or a short
/// title-like first line.
fn detect_heading(body: &str) -> Option<String> {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix('#') {
            let heading = heading.trim_start_matches('#').trim();
            if !heading.is_empty() {
                return Some(heading.chars().take(MAX_HEADING_CHARS).collect());
            }
        }
    }

    let first = body.lines().map(str::trim).find(|l| !l.is_empty())?;
    let alphabetic = first.chars().filter(|c| c.is_alphabetic()).count();
    let looks_like_title = first.chars().count() <= MAX_HEADING_CHARS
        && alphabetic >= 3
        && !first.ends_with(|c: char| ".,;:?!".contains(c))
        && body.trim().len() > first.len();
    looks_like_title.then(|| first.to_string())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn snap_forward_to_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

/// SHA-256 of a chunk's text, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(
    document_id: &str,
    page: u32,
    index: i64,
    text: &str,
    section: Option<String>,
) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        page,
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
        section,
        embedding: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_small_page_single_chunk() {
        let chunks = chunk_pages("doc1", &pages(&["Hello, world!"]), &ChunkingParams::new(200, 0));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert!(chunks[0].embedding.is_empty());
    }

    #[test]
    fn test_empty_pages_produce_no_chunks() {
        let chunks = chunk_pages(
            "doc1",
            &pages(&["", "Only page two has text.", "   \n\n  "]),
            &ChunkingParams::new(200, 10),
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page, 2);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn test_indices_contiguous_across_pages() {
        let page = (0..30)
            .map(|i| format!("Paragraph number {} has a handful of words.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_pages(
            "doc1",
            &pages(&[&page, &page, &page]),
            &ChunkingParams::new(20, 5),
        );
        assert!(chunks.len() > 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "Index mismatch at position {}", i);
        }
        assert!(chunks.iter().any(|c| c.page == 3));
        let pages_seen: Vec<u32> = chunks.iter().map(|c| c.page).collect();
        let mut sorted = pages_seen.clone();
        sorted.sort();
        assert_eq!(pages_seen, sorted, "chunks stay in reading order");
    }

    #[test]
    fn test_overlap_carries_previous_tail() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu nu xi omicron pi rho sigma tau upsilon";
        let chunks = chunk_pages("doc1", &pages(&[text]), &ChunkingParams::new(10, 3));
        assert!(chunks.len() > 1);
        let first_words: Vec<&str> = chunks[0].text.split_whitespace().collect();
        let last_word = first_words.last().unwrap();
        assert!(
            chunks[1].text.starts_with(last_word) || chunks[1].text.contains(last_word),
            "second chunk should repeat the tail of the first: {:?} / {:?}",
            chunks[0].text,
            chunks[1].text
        );
    }

    #[test]
    fn test_no_overlap_across_pages() {
        let chunks = chunk_pages(
            "doc1",
            &pages(&["first page text", "second page text"]),
            &ChunkingParams::new(200, 20),
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].text, "second page text");
    }

    #[test]
    fn test_chunks_respect_budget() {
        let text = "word ".repeat(500);
        let params = ChunkingParams::new(25, 5);
        let chunks = chunk_pages("doc1", &pages(&[&text]), &params);
        for c in &chunks {
            assert!(c.text.len() <= params.max_chars() + 1, "chunk too long: {}", c.text.len());
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_pages("doc1", &pages(&[text]), &ChunkingParams::new(3, 1));
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_markdown_heading_becomes_section() {
        let text = "# Installation\n\nRun the installer and follow the prompts.";
        let chunks = chunk_pages("doc1", &pages(&[text]), &ChunkingParams::new(200, 0));
        assert_eq!(chunks[0].section.as_deref(), Some("Installation"));
    }

    #[test]
    fn test_sentence_is_not_a_section() {
        let chunks = chunk_pages(
            "doc1",
            &pages(&["This is just a sentence."]),
            &ChunkingParams::new(200, 0),
        );
        assert_eq!(chunks[0].section, None);
    }

    #[test]
    fn test_deterministic_text_and_hash() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_pages("doc1", &pages(&[text]), &ChunkingParams::new(2, 0));
        let c2 = chunk_pages("doc1", &pages(&[text]), &ChunkingParams::new(2, 0));
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.chunk_index, b.chunk_index);
        }
    }
}
