//! Overlapping semantic chunker for book text.
//!
//! Splits normalized book text into [`Chunk`]s bounded by a token window,
//! with a fixed overlap between consecutive chunks so passages that straddle
//! a boundary stay retrievable.
//!
//! # Algorithm
//!
//! 1. Convert token limits to byte budgets using a 4 chars/token ratio.
//! 2. Split the text into paragraphs (`\n\n`), paragraphs into sentences,
//!    and sentences longer than the overlap budget into whitespace-aligned
//!    pieces. Each piece is a *unit* with a byte span into the original text.
//! 3. Greedily pack units into a chunk until the next unit would exceed
//!    `max_chars`. Close early at a paragraph break once the chunk reaches
//!    `min_chars`, and back off to the last sentence end rather than cutting
//!    mid-sentence.
//! 4. Start the next chunk with the trailing units of the previous one that
//!    fit in the overlap budget.
//!
//! Every chunk's `text` is exactly `book_text[start..end]`. Consecutive
//! chunks either overlap or are separated only by whitespace.
//!
//! Chunk ids are UUIDv5 of `"{book_id}:{position}"`, so re-chunking the same
//! text yields identical ids and boundaries.
//!
//! # Example
//!
//! ```rust
//! use folio_core::chunk::{chunk_text, ChunkingParams};
//!
//! let chunks = chunk_text("moby", "Call me Ishmael.\n\nSome years ago.", &ChunkingParams::default()).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].position, 0);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Chunk;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Namespace for deterministic chunk ids.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x5f0a_1c3e_8b7d_4e21_9a6f_0c4d_2b8e_7f13);

/// Maximum share of control characters before input is rejected as non-text.
const MAX_CONTROL_RATIO: f64 = 0.10;

/// Chunk window and overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkingParams {
    pub min_tokens: usize,
    pub max_tokens: usize,
    /// Fraction of `max_tokens` repeated at the start of the next chunk.
    pub overlap_ratio: f64,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            min_tokens: 200,
            max_tokens: 500,
            overlap_ratio: 0.15,
        }
    }
}

impl ChunkingParams {
    fn max_chars(&self) -> usize {
        (self.max_tokens * CHARS_PER_TOKEN).max(1)
    }

    fn min_chars(&self) -> usize {
        (self.min_tokens * CHARS_PER_TOKEN).min(self.max_chars())
    }

    fn overlap_chars(&self) -> usize {
        let ratio = self.overlap_ratio.clamp(0.0, 0.5);
        (self.max_chars() as f64 * ratio) as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    para_start: bool,
    sentence_start: bool,
}

/// Split book text into overlapping chunks.
///
/// # Errors
///
/// [`Error::MalformedInput`] if the text is empty, whitespace-only, or does
/// not look like text (NUL bytes or a high share of control characters).
pub fn chunk_text(book_id: &str, text: &str, params: &ChunkingParams) -> Result<Vec<Chunk>> {
    validate_text(text)?;

    let max_chars = params.max_chars();
    let min_chars = params.min_chars();
    let overlap_chars = params.overlap_chars();
    let piece_limit = if overlap_chars >= 16 {
        overlap_chars.min(max_chars)
    } else {
        max_chars
    };

    let units = split_units(text, piece_limit);
    let mut chunks = Vec::new();
    let mut first = 0usize;

    while first < units.len() {
        let mut last = first;
        while last + 1 < units.len() {
            let next = units[last + 1];
            let len = units[last].end - units[first].start;
            if next.end - units[first].start > max_chars {
                break;
            }
            if next.para_start && len >= min_chars {
                break;
            }
            last += 1;
        }

        if last + 1 < units.len() && !units[last + 1].sentence_start {
            if let Some(back) = (first..last).rev().find(|&k| {
                units[k + 1].sentence_start && units[k].end - units[first].start >= min_chars
            }) {
                last = back;
            }
        }

        let start = units[first].start;
        let end = units[last].end;
        chunks.push(make_chunk(book_id, chunks.len() as i64, text, start, end));

        if last + 1 >= units.len() {
            break;
        }

        let mut next_first = last + 1;
        let mut k = last;
        while k > first && units[last].end - units[k].start <= overlap_chars {
            next_first = k;
            k -= 1;
        }
        first = next_first;
    }

    Ok(chunks)
}

/// Rough token estimate for a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::MalformedInput("book text is empty".to_string()));
    }
    if text.contains('\0') {
        return Err(Error::MalformedInput(
            "book text contains NUL bytes".to_string(),
        ));
    }
    let total = text.chars().count();
    let control = text
        .chars()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        .count();
    if control as f64 / total as f64 > MAX_CONTROL_RATIO {
        return Err(Error::MalformedInput(format!(
            "book text does not look like text ({} of {} characters are control codes)",
            control, total
        )));
    }
    Ok(())
}

fn split_units(text: &str, piece_limit: usize) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut offset = 0usize;
    for para in text.split("\n\n") {
        let para_start = offset;
        offset += para.len() + 2;
        let (s, e) = trim_span(text, para_start, para_start + para.len());
        if s >= e {
            continue;
        }
        let mut first_in_para = true;
        for (ss, se) in sentence_spans(text, s, e) {
            let before = units.len();
            split_piece(text, ss, se, piece_limit, &mut units);
            if let Some(u) = units.get_mut(before) {
                u.sentence_start = true;
                if first_in_para {
                    u.para_start = true;
                    first_in_para = false;
                }
            }
        }
    }
    units
}

/// Sentence spans within `[start, end)`, trimmed of surrounding whitespace.
fn sentence_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let mut spans = Vec::new();
    let mut sentence_start = 0usize;
    let mut iter = slice.char_indices().peekable();

    while let Some((i, c)) = iter.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let mut stop = i + c.len_utf8();
        while let Some(&(j, q)) = iter.peek() {
            if matches!(q, '"' | '\'' | '”' | '’' | ')' | '.' | '!' | '?') {
                stop = j + q.len_utf8();
                iter.next();
            } else {
                break;
            }
        }
        match iter.peek() {
            Some(&(_, next)) if next.is_whitespace() => {
                let (s, e) = trim_span(text, start + sentence_start, start + stop);
                if s < e {
                    spans.push((s, e));
                }
                sentence_start = stop;
            }
            _ => {}
        }
    }

    let (s, e) = trim_span(text, start + sentence_start, end);
    if s < e {
        spans.push((s, e));
    }
    spans
}

/// Push `[start, end)` as one unit, or as whitespace-aligned pieces when it
/// exceeds `limit`.
fn split_piece(text: &str, start: usize, end: usize, limit: usize, out: &mut Vec<Unit>) {
    let mut s = start;
    while s < end {
        let remaining = &text[s..end];
        if remaining.len() <= limit {
            out.push(unit(s, end));
            break;
        }
        let cut = snap_to_char_boundary(remaining, limit);
        let cut = if cut == 0 {
            next_char_boundary(remaining)
        } else {
            cut
        };
        let actual = remaining[..cut]
            .rfind(&[' ', '\n'][..])
            .filter(|&p| p > 0)
            .map(|p| p + 1)
            .unwrap_or(cut);
        let (ps, pe) = trim_span(text, s, s + actual);
        if ps < pe {
            out.push(unit(ps, pe));
        }
        s += actual;
        while s < end && text[s..].starts_with(char::is_whitespace) {
            s += text[s..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
    }
}

fn unit(start: usize, end: usize) -> Unit {
    Unit {
        start,
        end,
        para_start: false,
        sentence_start: false,
    }
}

fn trim_span(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead + trail >= slice.len() {
        return (start, start);
    }
    (start + lead, end - trail)
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

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

/// Deterministic chunk id for a book position.
pub fn chunk_id(book_id: &str, position: i64) -> String {
    Uuid::new_v5(
        &CHUNK_NAMESPACE,
        format!("{}:{}", book_id, position).as_bytes(),
    )
    .to_string()
}

fn make_chunk(book_id: &str, position: i64, text: &str, start: usize, end: usize) -> Chunk {
    let body = &text[start..end];
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(book_id, position),
        book_id: book_id.to_string(),
        position,
        start,
        end,
        text: body.to_string(),
        char_len: body.chars().count(),
        token_estimate: estimate_tokens(body),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ChunkingParams {
        ChunkingParams {
            min_tokens: 10,
            max_tokens: 25,
            overlap_ratio: 0.2,
        }
    }

    fn long_text() -> String {
        (0..40)
            .map(|i| {
                let para = format!(
                    "Sentence {} begins the paragraph. It keeps going for a while. The sea was calm.",
                    i
                );
                if i % 3 == 0 {
                    format!("{}\n\n", para)
                } else {
                    format!("{} ", para)
                }
            })
            .collect()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("b1", "Hello, world!", &ChunkingParams::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].position, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text_rejected() {
        let err = chunk_text("b1", "   \n\n  ", &ChunkingParams::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[test]
    fn test_binary_text_rejected() {
        let err = chunk_text("b1", "abc\0def", &ChunkingParams::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));

        let noisy: String = (0..50).map(|i| if i % 2 == 0 { '\u{1}' } else { 'a' }).collect();
        let err = chunk_text("b1", &noisy, &ChunkingParams::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedInput(_)));
    }

    #[test]
    fn test_deterministic() {
        let text = long_text();
        let a = chunk_text("b1", &text, &small_params()).unwrap();
        let b = chunk_text("b1", &text, &small_params()).unwrap();
        assert_eq!(a, b);
        assert!(a.len() > 3);
    }

    #[test]
    fn test_ids_scoped_to_book() {
        let text = long_text();
        let a = chunk_text("b1", &text, &small_params()).unwrap();
        let b = chunk_text("b2", &text, &small_params()).unwrap();
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(a[0].hash, b[0].hash);
    }

    #[test]
    fn test_positions_contiguous_and_spans_exact() {
        let text = long_text();
        let chunks = chunk_text("b1", &text, &small_params()).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.position, i as i64);
            assert_eq!(c.text, &text[c.start..c.end]);
        }
    }

    #[test]
    fn test_bounded_length() {
        let params = small_params();
        let chunks = chunk_text("b1", &long_text(), &params).unwrap();
        for c in &chunks {
            assert!(
                c.end - c.start <= params.max_tokens * CHARS_PER_TOKEN,
                "chunk {} is {} bytes",
                c.position,
                c.end - c.start
            );
        }
    }

    #[test]
    fn test_coverage_and_overlap() {
        let text = long_text();
        let chunks = chunk_text("b1", &text, &small_params()).unwrap();
        let mut overlapping = 0;
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(b.start > a.start, "chunks must advance");
            if b.start < a.end {
                overlapping += 1;
            } else {
                assert!(
                    text[a.end..b.start].trim().is_empty(),
                    "gap between {} and {}",
                    a.position,
                    b.position
                );
            }
        }
        assert!(overlapping > 0, "expected overlapping neighbours");
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, text.trim_end().len());
    }

    #[test]
    fn test_zero_overlap_is_adjacent() {
        let params = ChunkingParams {
            overlap_ratio: 0.0,
            ..small_params()
        };
        let text = long_text();
        let chunks = chunk_text("b1", &text, &params).unwrap();
        for pair in chunks.windows(2) {
            assert!(pair[1].start >= pair[0].end);
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐ │ Hello world │ └──────────────────┘ ".repeat(20);
        let chunks = chunk_text("b1", &text, &small_params()).unwrap();
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
