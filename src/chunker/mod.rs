// src/chunker/mod.rs
// Splits long message content into chunks sized for the embedding model.
//
// Chunks are contiguous byte ranges of the original string (overlapping
// ranges for overlap), so `content == &original[start_offset..end_offset]`
// always holds and every region of the input is covered by some chunk.

use crate::config::ChunkingStrategyName;
use regex::Regex;
use std::sync::LazyLock;

/// A chunk of message content ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    pub index: usize,
    pub total_chunks: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub estimated_tokens: usize,
    pub strategy: ChunkingStrategyName,
}

/// Result of chunking one text.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunks: Vec<TextChunk>,
    pub was_chunked: bool,
}

/// Chunker configuration; defaults fit common embedding context limits.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub strategy: ChunkingStrategyName,
    pub target_tokens: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_fraction: f64,
    pub chars_per_token_prose: f64,
    pub chars_per_token_code: f64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategyName::Sentence,
            target_tokens: 400,
            min_tokens: 32,
            max_tokens: 512,
            overlap_fraction: 0.15,
            chars_per_token_prose: 4.0,
            chars_per_token_code: 3.0,
        }
    }
}

static CODE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:fn |def |class |impl |pub |let |const |var |import |use |#include|return |if \(|for \(|while \()|[{};]\s*$")
        .expect("valid regex")
});

/// Text chunker with token estimation tuned for mixed prose and code.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Estimate the token count of a text as a weighted mixture of prose and
    /// code ratios. Code is detected via fenced spans and per-line patterns.
    pub fn estimate_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let code_chars = count_code_chars(text);
        let prose_chars = text.len().saturating_sub(code_chars);
        let estimate = prose_chars as f64 / self.config.chars_per_token_prose
            + code_chars as f64 / self.config.chars_per_token_code;
        estimate.ceil() as usize
    }

    /// Average chars-per-token for this specific text's prose/code mix.
    fn avg_chars_per_token(&self, text: &str) -> f64 {
        let tokens = self.estimate_tokens(text).max(1);
        text.len() as f64 / tokens as f64
    }

    /// Split `text` according to the configured strategy.
    pub fn chunk(&self, text: &str) -> ChunkResult {
        if self.estimate_tokens(text) <= self.config.target_tokens {
            return ChunkResult {
                chunks: vec![self.make_chunk(text, 0, text.len(), 0)],
                was_chunked: false,
            };
        }

        let mut chunks = match self.config.strategy {
            ChunkingStrategyName::Sentence => self.chunk_by_units(text, sentence_units(text)),
            ChunkingStrategyName::Paragraph => self.chunk_by_units(text, paragraph_units(text)),
            ChunkingStrategyName::SlidingWindow => self.sliding_window(text, 0, text.len()),
        };

        // A runt tail below min_tokens is folded into its predecessor.
        if chunks.len() > 1
            && chunks
                .last()
                .is_some_and(|c| c.estimated_tokens < self.config.min_tokens)
        {
            if let Some(tail) = chunks.pop() {
                if let Some(prev) = chunks.last_mut() {
                    if tail.end_offset > prev.end_offset {
                        prev.end_offset = tail.end_offset;
                        prev.content = text[prev.start_offset..prev.end_offset].to_string();
                        prev.estimated_tokens = self.estimate_tokens(&prev.content);
                    }
                }
            }
        }

        let total = chunks.len();
        for (index, chunk) in chunks.iter_mut().enumerate() {
            chunk.index = index;
            chunk.total_chunks = total;
        }
        ChunkResult {
            chunks,
            was_chunked: total > 1,
        }
    }

    fn make_chunk(&self, text: &str, start: usize, end: usize, index: usize) -> TextChunk {
        let content = &text[start..end];
        TextChunk {
            content: content.to_string(),
            index,
            total_chunks: 1,
            start_offset: start,
            end_offset: end,
            estimated_tokens: self.estimate_tokens(content),
            strategy: self.config.strategy,
        }
    }

    /// Greedy packing of contiguous units (sentences or paragraphs) up to
    /// target_tokens, with the configured fraction of trailing units
    /// re-emitted at the start of the next chunk.
    fn chunk_by_units(&self, text: &str, units: Vec<(usize, usize)>) -> Vec<TextChunk> {
        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut i = 0usize;

        while i < units.len() {
            let (unit_start, unit_end) = units[i];

            // A single unit beyond max_tokens falls through to a word-level
            // sliding window for that unit only.
            if self.estimate_tokens(&text[unit_start..unit_end]) > self.config.max_tokens {
                chunks.extend(self.sliding_window(text, unit_start, unit_end));
                i += 1;
                continue;
            }

            let chunk_start = unit_start;
            let mut last = i;
            while last + 1 < units.len() {
                let candidate_end = units[last + 1].1;
                if self.estimate_tokens(&text[chunk_start..candidate_end])
                    > self.config.target_tokens
                {
                    break;
                }
                // Never merge an oversized unit; it gets its own window pass.
                if self.estimate_tokens(&text[units[last + 1].0..candidate_end])
                    > self.config.max_tokens
                {
                    break;
                }
                last += 1;
            }

            let chunk_end = units[last].1;
            chunks.push(self.make_chunk(text, chunk_start, chunk_end, chunks.len()));

            if last + 1 >= units.len() {
                break;
            }

            // Overlap: re-emit trailing units of this chunk at the start of
            // the next one, but always advance past chunk_start.
            let units_in_chunk = last - i + 1;
            let overlap_units =
                ((units_in_chunk as f64) * self.config.overlap_fraction).floor() as usize;
            let next = (last + 1).saturating_sub(overlap_units);
            i = if next > i { next } else { last + 1 };
        }

        chunks
    }

    /// Character-window chunking over `text[start..end]`.
    ///
    /// Window size comes from this text's own prose/code ratio; both window
    /// edges snap to the nearest preceding whitespace, and the loop always
    /// advances at least one character.
    fn sliding_window(&self, text: &str, start: usize, end: usize) -> Vec<TextChunk> {
        let region = &text[start..end];
        let window = ((self.config.target_tokens as f64 * self.avg_chars_per_token(region))
            .round() as usize)
            .max(1);
        let overlap = ((window as f64) * self.config.overlap_fraction) as usize;
        let step = window.saturating_sub(overlap).max(1);

        let mut chunks = Vec::new();
        let mut pos = start;
        while pos < end {
            let raw_end = (pos + window).min(end);
            let mut chunk_end = if raw_end < end {
                snap_to_prev_whitespace(text, raw_end, pos)
            } else {
                end
            };
            if chunk_end <= pos {
                chunk_end = ceil_char_boundary(text, (pos + window).min(end));
            }
            chunks.push(self.make_chunk(text, pos, chunk_end, chunks.len()));
            if chunk_end >= end {
                break;
            }

            let raw_next = pos + step;
            let mut next = snap_to_prev_whitespace(text, raw_next.min(end), pos);
            if next <= pos {
                // Forward progress is mandatory.
                next = ceil_char_boundary(text, pos + 1);
            }
            pos = next;
        }
        chunks
    }
}

/// Count characters that look like code: fenced spans plus pattern-matching
/// lines outside fences.
fn count_code_chars(text: &str) -> usize {
    let mut code = 0usize;
    let mut in_fence = false;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            code += line.len();
            continue;
        }
        if in_fence || CODE_LINE.is_match(line) {
            code += line.len();
        }
    }
    code.min(text.len())
}

/// Sentence units covering the whole string: fenced code blocks verbatim,
/// prose split at sentence terminators. Ranges are contiguous byte ranges.
fn sentence_units(text: &str) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut offset = 0usize;
    let mut fence_start: Option<usize> = None;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_start();

        match fence_start {
            Some(start) => {
                if trimmed.starts_with("```") {
                    units.push((start, offset));
                    fence_start = None;
                }
            }
            None => {
                if trimmed.starts_with("```") {
                    fence_start = Some(line_start);
                } else {
                    split_prose_sentences(text, line_start, offset, &mut units);
                }
            }
        }
    }
    // Unterminated fence: keep the rest as one unit.
    if let Some(start) = fence_start {
        units.push((start, text.len()));
    }
    units
}

/// Split a prose range at sentence terminators, emitting contiguous ranges.
fn split_prose_sentences(text: &str, start: usize, end: usize, units: &mut Vec<(usize, usize)>) {
    let mut sentence_start = start;
    let slice = &text[start..end];
    for (i, c) in slice.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let boundary = start + i + c.len_utf8();
            units.push((sentence_start, boundary));
            sentence_start = boundary;
        }
    }
    if sentence_start < end {
        units.push((sentence_start, end));
    }
}

/// Paragraph units: ranges separated at blank lines, blank lines attached to
/// the preceding paragraph so coverage stays exact.
fn paragraph_units(text: &str) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut para_start = 0usize;
    let mut offset = 0usize;
    let mut prev_blank = false;

    for line in text.split_inclusive('\n') {
        let is_blank = line.trim().is_empty();
        if prev_blank && !is_blank && offset > para_start {
            units.push((para_start, offset));
            para_start = offset;
        }
        prev_blank = is_blank;
        offset += line.len();
    }
    if para_start < text.len() {
        units.push((para_start, text.len()));
    }
    units
}

/// Snap a byte position back to just after the nearest preceding whitespace,
/// never before `floor`. Falls back to a char boundary at or below `pos`.
fn snap_to_prev_whitespace(text: &str, pos: usize, floor: usize) -> usize {
    let mut p = floor_char_boundary(text, pos.min(text.len()));
    while p > floor {
        let prev = prev_char(text, p);
        if prev.1.is_whitespace() {
            return p;
        }
        p = prev.0;
    }
    floor_char_boundary(text, pos.min(text.len()))
}

fn floor_char_boundary(text: &str, mut pos: usize) -> usize {
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_char_boundary(text: &str, mut pos: usize) -> usize {
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

fn prev_char(text: &str, pos: usize) -> (usize, char) {
    let before = &text[..pos];
    let c = before.chars().next_back().unwrap_or(' ');
    (pos - c.len_utf8(), c)
}
