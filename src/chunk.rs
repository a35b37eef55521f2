//! Boundary-aware text chunker.
//!
//! Splits canonical document text into [`ChunkSpan`]s of at most
//! `max_chunk_size` characters, with consecutive chunks sharing up to
//! `overlap_size` characters. Offsets are character (Unicode scalar) offsets
//! into the canonical text, so provenance survives any re-encoding.
//!
//! # Algorithm
//!
//! 1. Start at character 0.
//! 2. The window ends at `start + max_chunk_size` (or the end of the text).
//! 3. Unless the window reaches the end of the text, backtrack from the
//!    window end to the nearest boundary allowed by the [`BoundaryPolicy`],
//!    first down to `start + overlap_size + 1`, then down to just past the
//!    previous chunk's end. Ends therefore always advance.
//! 4. If the window has no usable boundary at all, force-split at the
//!    window end.
//! 5. The next chunk starts `overlap_size` characters before the previous
//!    end (but after the previous start), moved forward to the first policy
//!    boundary inside the overlap region when there is one. A chunk cut
//!    short by step 3 therefore shares less than `overlap_size` characters.
//!
//! Iteration is lazy; [`Chunks`] is `Clone`, and calling
//! [`Chunker::chunks`] again restarts from the beginning.
//!
//! # Example
//!
//! ```rust
//! use kbase::chunk::{BoundaryPolicy, ChunkConfig, Chunker};
//!
//! let chunker = Chunker::new(ChunkConfig {
//!     max_chunk_size: 12,
//!     overlap_size: 0,
//!     boundary_policy: BoundaryPolicy::Word,
//! })
//! .unwrap();
//! let texts: Vec<String> = chunker.chunks("alpha beta gamma delta").map(|c| c.text).collect();
//! assert_eq!(texts, vec!["alpha beta ", "gamma delta"]);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KbError, Result};
use crate::models::{Chunk, ChunkId, DocumentId};

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', ';', '\n', '。', '！', '？', '；'];

/// Which positions a chunk may end at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryPolicy {
    /// Any character position.
    Char,
    /// Between whitespace and non-whitespace, or next to a CJK ideograph.
    #[default]
    Word,
    /// After a sentence terminator and its trailing whitespace; falls back
    /// to word boundaries when a window contains no sentence end.
    Sentence,
}

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_chunk_size: usize,
    pub overlap_size: usize,
    pub boundary_policy: BoundaryPolicy,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            overlap_size: 100,
            boundary_policy: BoundaryPolicy::Word,
        }
    }
}

/// A chunk produced by the [`Chunker`], before it is bound to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub seq: usize,
    /// First character of the chunk.
    pub start: usize,
    /// One past the last character of the chunk.
    pub end: usize,
    pub text: String,
}

impl ChunkSpan {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }

    /// Bind the span to a document version, assigning its id and content hash.
    pub fn into_chunk(self, document_id: DocumentId, version: u32) -> Chunk {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        Chunk {
            id: ChunkId::derive(document_id, version, self.seq),
            document_id,
            seq: self.seq,
            start: self.start,
            end: self.end,
            text: self.text,
            hash,
        }
    }
}

/// Validated chunking configuration.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    /// # Errors
    ///
    /// `Config` when `max_chunk_size` is zero or `overlap_size` is not
    /// strictly less than `max_chunk_size`.
    pub fn new(config: ChunkConfig) -> Result<Self> {
        if config.max_chunk_size == 0 {
            return Err(KbError::Config("max_chunk_size must be > 0".to_string()));
        }
        if config.overlap_size >= config.max_chunk_size {
            return Err(KbError::Config(format!(
                "overlap_size ({}) must be strictly less than max_chunk_size ({})",
                config.overlap_size, config.max_chunk_size
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Lazily chunk `text`. Empty text yields no chunks.
    pub fn chunks<'a>(&self, text: &'a str) -> Chunks<'a> {
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let chars: Vec<char> = text.chars().collect();
        offsets.push(text.len());
        Chunks {
            text,
            chars,
            offsets,
            config: self.config,
            next_start: Some(0),
            prev_end: 0,
            seq: 0,
        }
    }
}

/// Iterator over the chunks of one text.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    chars: Vec<char>,
    /// Byte offset of every character, plus `text.len()` at the end.
    offsets: Vec<usize>,
    config: ChunkConfig,
    next_start: Option<usize>,
    /// End of the previously emitted chunk.
    prev_end: usize,
    seq: usize,
}

impl Iterator for Chunks<'_> {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        let start = self.next_start?;
        let n = self.chars.len();
        if start >= n {
            self.next_start = None;
            return None;
        }

        let window_end = (start + self.config.max_chunk_size).min(n);
        let end = if window_end == n {
            n
        } else {
            self.split_point(start, window_end)
        };

        self.next_start = if end == n {
            None
        } else {
            Some(self.next_chunk_start(start, end))
        };

        let span = ChunkSpan {
            seq: self.seq,
            start,
            end,
            text: self.text[self.offsets[start]..self.offsets[end]].to_string(),
        };
        self.seq += 1;
        self.prev_end = end;
        Some(span)
    }
}

impl Chunks<'_> {
    /// Pick where a chunk starting at `start` ends, given its window end.
    fn split_point(&self, start: usize, window_end: usize) -> usize {
        let lowest = (start + self.config.overlap_size + 1).min(window_end);
        let floor = start.max(self.prev_end) + 1;
        let within = |lo: usize, hi: usize, accept: &dyn Fn(usize) -> bool| {
            (lo..=hi).rev().find(|&p| accept(p))
        };
        let search = |lo: usize, hi: usize| match self.config.boundary_policy {
            BoundaryPolicy::Char => None,
            BoundaryPolicy::Word => within(lo, hi, &|p| self.is_word_boundary(p)),
            BoundaryPolicy::Sentence => within(lo, hi, &|p| self.is_sentence_boundary(p))
                .or_else(|| within(lo, hi, &|p| self.is_word_boundary(p))),
        };

        search(lowest, window_end)
            .or_else(|| {
                if floor < lowest {
                    search(floor, lowest - 1)
                } else {
                    None
                }
            })
            .unwrap_or(window_end)
    }

    /// Start of the chunk following one that spans `[start, end)`.
    fn next_chunk_start(&self, start: usize, end: usize) -> usize {
        let overlap = self.config.overlap_size;
        if overlap == 0 {
            return end;
        }
        let earliest = end.saturating_sub(overlap).max(start + 1);
        let forward = |accept: &dyn Fn(usize) -> bool| (earliest..end).find(|&p| accept(p));

        let found = match self.config.boundary_policy {
            BoundaryPolicy::Char => None,
            BoundaryPolicy::Word => forward(&|p| self.is_word_boundary(p)),
            BoundaryPolicy::Sentence => forward(&|p| self.is_sentence_boundary(p))
                .or_else(|| forward(&|p| self.is_word_boundary(p))),
        };
        found.unwrap_or(earliest)
    }

    fn is_word_boundary(&self, p: usize) -> bool {
        if p == 0 || p >= self.chars.len() {
            return true;
        }
        let before = self.chars[p - 1];
        let after = self.chars[p];
        before.is_whitespace() != after.is_whitespace() || is_cjk(before) || is_cjk(after)
    }

    fn is_sentence_boundary(&self, p: usize) -> bool {
        if p == 0 || p >= self.chars.len() {
            return true;
        }
        if self.chars[p].is_whitespace() {
            return false;
        }
        let mut q = p;
        while q > 0 && self.chars[q - 1].is_whitespace() && self.chars[q - 1] != '\n' {
            q -= 1;
        }
        q > 0 && SENTENCE_TERMINATORS.contains(&self.chars[q - 1])
    }
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0x3000..=0x303F | 0xFF00..=0xFFEF
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max: usize, overlap: usize, policy: BoundaryPolicy) -> Chunker {
        Chunker::new(ChunkConfig {
            max_chunk_size: max,
            overlap_size: overlap,
            boundary_policy: policy,
        })
        .unwrap()
    }

    /// Deterministic pseudo-random prose with mixed punctuation.
    fn sample_text(words: usize, seed: u64) -> String {
        const VOCAB: &[&str] = &[
            "index", "vector", "chunk", "encoding", "query", "provenance", "a", "of",
            "knowledge", "检索", "文档", "embedding", "similarity", "is", "the",
        ];
        let mut state = seed;
        let mut out = String::new();
        for i in 0..words {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let word = VOCAB[(state >> 33) as usize % VOCAB.len()];
            if i > 0 {
                out.push(' ');
            }
            out.push_str(word);
            match (state >> 20) % 13 {
                0 => out.push('.'),
                1 => out.push_str("?\n"),
                2 => out.push('。'),
                _ => {}
            }
        }
        out
    }

    fn assert_covers(text: &str, spans: &[ChunkSpan], config: &ChunkConfig) {
        let n = text.chars().count();
        assert!(!spans.is_empty());
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans.last().unwrap().end, n);
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.seq, i);
            assert!(span.end > span.start);
            assert!(span.char_len() <= config.max_chunk_size);
            let expected: String = text.chars().skip(span.start).take(span.char_len()).collect();
            assert_eq!(span.text, expected);
        }
        for pair in spans.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(b.start > a.start, "starts must advance");
            assert!(b.start <= a.end, "gap between {:?} and {:?}", a, b);
            assert!(a.end - b.start <= config.overlap_size, "overlap too large");
            assert!(b.end > a.end, "ends must advance");
        }
    }

    #[test]
    fn test_short_text_single_chunk() {
        let spans: Vec<_> = chunker(100, 10, BoundaryPolicy::Word)
            .chunks("Hello, world!")
            .collect();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "Hello, world!");
        assert_eq!((spans[0].start, spans[0].end), (0, 13));
    }

    #[test]
    fn test_exact_fit_single_chunk() {
        let text = "x".repeat(50);
        let spans: Vec<_> = chunker(50, 5, BoundaryPolicy::Char).chunks(&text).collect();
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert_eq!(chunker(10, 0, BoundaryPolicy::Word).chunks("").count(), 0);
    }

    #[test]
    fn test_overlap_must_be_smaller() {
        let err = Chunker::new(ChunkConfig {
            max_chunk_size: 10,
            overlap_size: 10,
            boundary_policy: BoundaryPolicy::Char,
        });
        assert!(matches!(err, Err(KbError::Config(_))));
        let zero = Chunker::new(ChunkConfig {
            max_chunk_size: 0,
            overlap_size: 0,
            boundary_policy: BoundaryPolicy::Char,
        });
        assert!(matches!(zero, Err(KbError::Config(_))));
    }

    #[test]
    fn test_ten_thousand_chars_eleven_chunks() {
        let text: String = (0..10_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let config = ChunkConfig {
            max_chunk_size: 1000,
            overlap_size: 100,
            boundary_policy: BoundaryPolicy::Char,
        };
        let spans: Vec<_> = Chunker::new(config).unwrap().chunks(&text).collect();
        assert_eq!(spans.len(), 11);
        assert_eq!(spans[1].start, 900);
        assert_eq!(spans[10].start, 9000);
        assert_covers(&text, &spans, &config);
    }

    #[test]
    fn test_word_policy_never_splits_words() {
        let text = sample_text(400, 7);
        let c = chunker(60, 10, BoundaryPolicy::Word);
        let spans: Vec<_> = c.chunks(&text).collect();
        assert_covers(&text, &spans, c.config());
        let chars: Vec<char> = text.chars().collect();
        for span in &spans[..spans.len() - 1] {
            let before = chars[span.end - 1];
            let after = chars[span.end];
            assert!(
                before.is_whitespace() || after.is_whitespace() || is_cjk(before) || is_cjk(after),
                "split inside a word at {}",
                span.end
            );
        }
    }

    #[test]
    fn test_word_policy_uses_early_boundary_before_force_split() {
        let text = "abcd efghijkl mn";
        let c = chunker(10, 5, BoundaryPolicy::Word);
        let spans: Vec<_> = c.chunks(text).collect();
        let texts: Vec<&str> = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd ", " efghijkl ", " mn"]);
        assert_covers(text, &spans, c.config());
    }

    #[test]
    fn test_sentence_policy_prefers_sentence_ends() {
        let text = "One short sentence. Another one here! A third?\nFinal words trail on";
        let spans: Vec<_> = chunker(20, 0, BoundaryPolicy::Sentence).chunks(text).collect();
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0].text, "One short sentence. ");
        assert_eq!(spans[1].text, "Another one here! ");
        assert_eq!(spans[2].text, "A third?\n");
        assert_eq!(spans[3].text, "Final words trail on");
    }

    #[test]
    fn test_force_split_single_long_token() {
        let text = "x".repeat(35);
        let c = chunker(10, 2, BoundaryPolicy::Word);
        let spans: Vec<_> = c.chunks(&text).collect();
        assert_covers(&text, &spans, c.config());
        assert!(spans.iter().all(|s| s.char_len() <= 10));
        assert_eq!(spans[0].end, 10);
    }

    #[test]
    fn test_cjk_text_splits_between_ideographs() {
        let text = "知识库检索系统支持多种编码格式的文档导入与相似度查询";
        let c = chunker(8, 2, BoundaryPolicy::Word);
        let spans: Vec<_> = c.chunks(text).collect();
        assert_covers(text, &spans, c.config());
        assert_eq!(spans[0].char_len(), 8);
    }

    #[test]
    fn test_coverage_across_configurations() {
        let text = sample_text(300, 42);
        for policy in [BoundaryPolicy::Char, BoundaryPolicy::Word, BoundaryPolicy::Sentence] {
            for max in [1usize, 2, 7, 16, 33, 100, 5000] {
                for overlap in [0usize, 1, 3, 15, 99] {
                    if overlap >= max {
                        continue;
                    }
                    let c = chunker(max, overlap, policy);
                    let spans: Vec<_> = c.chunks(&text).collect();
                    assert_covers(&text, &spans, c.config());
                }
            }
        }
    }

    #[test]
    fn test_restartable_and_deterministic() {
        let text = sample_text(120, 3);
        let c = chunker(40, 8, BoundaryPolicy::Sentence);
        let iter = c.chunks(&text);
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        let third: Vec<_> = c.chunks(&text).collect();
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_into_chunk_assigns_id_and_hash() {
        let doc = DocumentId::from_name("doc");
        let span = chunker(100, 0, BoundaryPolicy::Word).chunks("abc").next().unwrap();
        let chunk = span.clone().into_chunk(doc, 1);
        assert_eq!(chunk.id, ChunkId::derive(doc, 1, 0));
        assert_eq!(chunk.hash.len(), 64);
        assert_eq!(chunk, span.into_chunk(doc, 1));
    }
}
