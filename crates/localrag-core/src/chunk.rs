//! Sliding-window text chunker.
//!
//! Splits loaded document text into overlapping [`Chunk`]s of a fixed
//! window, measured in tokens or characters. Windows end on a natural
//! boundary when one lies within the tolerance band before the hard limit.
//!
//! The chunker is pure: the same text and [`ChunkParams`] always produce the
//! same boundaries, hence the same chunk identifiers. Re-indexing unchanged
//! content therefore finds every chunk text already embedded.
//!
//! # Algorithm
//!
//! 1. Convert the window to characters (4 chars per token in token mode).
//! 2. From the current start, take the rest of the text if it fits.
//! 3. Otherwise look backwards from `start + window` over the tolerance
//!    band for, in order: a paragraph break, a sentence end, a line break,
//!    any whitespace. Cut at the first found, or hard-cut at the limit.
//! 4. Step back by the overlap, snapped forward to a word start, and repeat.
//! 5. A trailing window shorter than `min_chunk_chars` is merged into the
//!    previous chunk.
//! 6. Leading and trailing whitespace is trimmed from each chunk; offsets
//!    always index the untrimmed source text.
//!
//! # Example
//!
//! ```rust
//! use localrag_core::chunk::{chunk_text, ChunkParams};
//!
//! let chunks = chunk_text("/notes/a.md", "Hello world.\n\nSecond paragraph.", &ChunkParams::default()).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].seq, 0);
//! assert_eq!(chunks[0].start, 0);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ChunkError;
use crate::hash::{chunk_id, sha256_hex};
use crate::models::Chunk;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Unit the window and chunk lengths are measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    #[default]
    Tokens,
    Chars,
}

/// Chunking parameters. Changing any of them changes chunk identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub unit: ChunkUnit,
    /// Window size in `unit`s.
    pub window: usize,
    /// Fraction of the window repeated at the start of the next chunk.
    pub overlap_fraction: f32,
    /// Fraction of the window searched backwards for a natural boundary.
    pub boundary_tolerance: f32,
    /// Trailing chunks shorter than this merge into their predecessor.
    pub min_chunk_chars: usize,
    /// Upper bound on chunks per document.
    pub max_chunks: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            unit: ChunkUnit::Tokens,
            window: 256,
            overlap_fraction: 0.15,
            boundary_tolerance: 0.2,
            min_chunk_chars: 40,
            max_chunks: 2000,
        }
    }
}

impl ChunkParams {
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.window == 0 {
            return Err(ChunkError::InvalidParams("window must be > 0".to_string()));
        }
        if !(0.0..=0.5).contains(&self.overlap_fraction) {
            return Err(ChunkError::InvalidParams(format!(
                "overlap_fraction must be in [0.0, 0.5], got {}",
                self.overlap_fraction
            )));
        }
        if !(0.0..1.0).contains(&self.boundary_tolerance) {
            return Err(ChunkError::InvalidParams(format!(
                "boundary_tolerance must be in [0.0, 1.0), got {}",
                self.boundary_tolerance
            )));
        }
        if self.max_chunks == 0 {
            return Err(ChunkError::InvalidParams(
                "max_chunks must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Window size in characters.
    pub fn window_chars(&self) -> usize {
        match self.unit {
            ChunkUnit::Tokens => self.window * CHARS_PER_TOKEN,
            ChunkUnit::Chars => self.window,
        }
    }

    /// Length of `chars` characters in the configured unit.
    pub fn measure(&self, chars: usize) -> usize {
        match self.unit {
            ChunkUnit::Tokens => chars.div_ceil(CHARS_PER_TOKEN),
            ChunkUnit::Chars => chars,
        }
    }
}

/// Split `text` into chunks owned by `document_id`.
///
/// Returns an empty vector for empty or whitespace-only text.
///
/// # Errors
///
/// - [`ChunkError::InvalidParams`] for an unusable parameter set.
/// - [`ChunkError::BinaryContent`] when the text contains NUL characters.
/// - [`ChunkError::TooManyChunks`] when `max_chunks` would be exceeded.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    params: &ChunkParams,
) -> Result<Vec<Chunk>, ChunkError> {
    params.validate()?;

    if text.contains('\0') {
        return Err(ChunkError::BinaryContent);
    }

    let chars: Vec<char> = text.chars().collect();
    if chars.iter().all(|c| c.is_whitespace()) {
        return Ok(Vec::new());
    }

    let spans = window_spans(&chars, params);
    if spans.len() > params.max_chunks {
        return Err(ChunkError::TooManyChunks {
            produced: spans.len(),
            limit: params.max_chunks,
        });
    }

    let mut chunks = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        let (start, end) = trim_span(&chars, start, end);
        if start >= end {
            continue;
        }
        let seq = chunks.len() as u32;
        let body: String = chars[start..end].iter().collect();
        chunks.push(make_chunk(document_id, seq, start, end, body, params));
    }

    Ok(chunks)
}

/// Compute raw `[start, end)` windows over `chars`.
fn window_spans(chars: &[char], params: &ChunkParams) -> Vec<(usize, usize)> {
    let n = chars.len();
    let window = params.window_chars();
    let overlap = ((window as f32) * params.overlap_fraction).floor() as usize;
    let tolerance = ((window as f32) * params.boundary_tolerance).floor() as usize;

    let mut spans = Vec::new();
    let mut start = 0usize;

    while start < n {
        let end = if n - start <= window {
            n
        } else {
            find_break(chars, start, start + window, tolerance)
        };
        spans.push((start, end));
        if end >= n {
            break;
        }
        start = next_start(chars, start, end, overlap);
    }

    if spans.len() > 1 {
        let (tail_start, tail_end) = spans[spans.len() - 1];
        let tail_len = chars[tail_start..tail_end]
            .iter()
            .filter(|c| !c.is_whitespace())
            .count();
        if tail_len < params.min_chunk_chars {
            spans.pop();
            if let Some(last) = spans.last_mut() {
                last.1 = tail_end;
            }
        }
    }

    spans
}

/// Pick the cut position for a window starting at `start` whose hard limit
/// is `limit`. Searches `[limit - tolerance, limit]` backwards.
fn find_break(chars: &[char], start: usize, limit: usize, tolerance: usize) -> usize {
    let lo = limit.saturating_sub(tolerance).max(start + 1);

    let paragraph = |p: usize| p >= 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n';
    let sentence = |p: usize| {
        matches!(chars[p - 1], '.' | '!' | '?') && p < chars.len() && chars[p].is_whitespace()
    };
    let line = |p: usize| chars[p - 1] == '\n';
    let space = |p: usize| chars[p - 1].is_whitespace();

    let rules: [&dyn Fn(usize) -> bool; 4] = [&paragraph, &sentence, &line, &space];
    for rule in rules {
        if let Some(p) = (lo..=limit).rev().find(|&p| rule(p)) {
            return p;
        }
    }
    limit
}

/// Start of the next window: `end - overlap`, moved forward to a word start
/// when one exists inside the overlap. Always makes progress.
fn next_start(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }
    let candidate = end.saturating_sub(overlap).max(start + 1);
    let snapped = (candidate..end).find(|&p| p > 0 && chars[p - 1].is_whitespace());
    snapped.unwrap_or(candidate)
}

fn trim_span(chars: &[char], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (start, end)
}

fn make_chunk(
    document_id: &str,
    seq: u32,
    start: usize,
    end: usize,
    text: String,
    params: &ChunkParams,
) -> Chunk {
    let hash = sha256_hex(text.as_bytes());
    Chunk {
        id: chunk_id(document_id, seq, &hash),
        document_id: document_id.to_string(),
        seq,
        start,
        end,
        length: params.measure(end - start),
        text,
        hash,
    }
}
