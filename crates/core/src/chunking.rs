use crate::config::ChunkingSettings;
use crate::error::IngestError;
use crate::models::{Chunk, PageText};
use std::sync::Arc;
use tracing::warn;

/// Length function bound to an embedding model's tokenizer.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Per-word estimate of `ceil(chars / chars_per_token)`; additive across whitespace.
#[derive(Debug, Clone, Copy)]
pub struct EstimatedTokenCounter {
    pub chars_per_token: usize,
}

impl Default for EstimatedTokenCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for EstimatedTokenCounter {
    fn count(&self, text: &str) -> usize {
        let per_token = self.chars_per_token.max(1);
        text.split_whitespace()
            .map(|word| word.chars().count().div_ceil(per_token))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
    pub lookback_tokens: usize,
    /// Hard ceiling from the embedding model; no chunk may exceed it.
    pub model_limit: usize,
}

impl ChunkingConfig {
    /// Explicit overrides win, otherwise sizes are fractions of the model's input limit.
    pub fn resolve(settings: &ChunkingSettings, max_input_tokens: usize) -> Result<Self, IngestError> {
        if max_input_tokens == 0 {
            return Err(IngestError::Chunking(
                "embedding model reports a zero token limit".to_string(),
            ));
        }

        let chunk_tokens = settings.chunk_tokens.unwrap_or_else(|| {
            (max_input_tokens as f64 * settings.chunk_fraction_of_limit).floor() as usize
        });
        if chunk_tokens == 0 {
            return Err(IngestError::Chunking("chunk size must be positive".to_string()));
        }
        if chunk_tokens > max_input_tokens {
            return Err(IngestError::Chunking(format!(
                "chunk size {chunk_tokens} exceeds the model limit of {max_input_tokens} tokens"
            )));
        }

        let overlap_tokens = settings
            .overlap_tokens
            .unwrap_or_else(|| (chunk_tokens as f64 * settings.overlap_fraction).floor() as usize);
        if overlap_tokens >= chunk_tokens {
            return Err(IngestError::Chunking(format!(
                "overlap {overlap_tokens} must be smaller than chunk size {chunk_tokens}"
            )));
        }

        let lookback_tokens =
            ((chunk_tokens as f64 * settings.lookback_fraction).floor() as usize).max(1);

        Ok(Self {
            chunk_tokens,
            overlap_tokens,
            lookback_tokens,
            model_limit: max_input_tokens,
        })
    }
}

pub struct Chunker {
    config: ChunkingConfig,
    counter: Arc<dyn TokenCounter>,
}

impl Chunker {
    pub fn new(config: ChunkingConfig, counter: Arc<dyn TokenCounter>) -> Self {
        Self { config, counter }
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Starts a fresh pass over `pages`. The returned stream is consumed once.
    pub fn chunks(&self, contract_id: &str, pages: &[PageText]) -> ChunkStream {
        let mut oversized = 0;
        let pieces = split_pieces(pages, self.counter.as_ref(), self.config.chunk_tokens, &mut oversized);

        ChunkStream {
            contract_id: contract_id.to_string(),
            config: self.config,
            pieces,
            start: 0,
            overlap_len: 0,
            next_index: 0,
            oversized,
            done: false,
        }
    }
}

#[derive(Debug)]
struct Piece {
    text: String,
    separator: &'static str,
    page: u32,
    tokens: usize,
    /// A chunk may end after this piece without splitting a sentence or paragraph.
    boundary: bool,
}

fn split_pieces(
    pages: &[PageText],
    counter: &dyn TokenCounter,
    chunk_tokens: usize,
    oversized: &mut usize,
) -> Vec<Piece> {
    let mut pieces = Vec::new();

    for page in pages {
        for paragraph in page.text.split("\n\n") {
            let words = paragraph.split_whitespace().collect::<Vec<_>>();
            for (position, word) in words.iter().enumerate() {
                let paragraph_end = position + 1 == words.len();
                let separator = if paragraph_end { "\n\n" } else { " " };
                let boundary = paragraph_end || ends_sentence(word);
                let tokens = counter.count(word);

                if tokens <= chunk_tokens {
                    pieces.push(Piece {
                        text: (*word).to_string(),
                        separator,
                        page: page.number,
                        tokens,
                        boundary,
                    });
                    continue;
                }

                *oversized += 1;
                let parts = split_long_word(word, counter, chunk_tokens);
                let last = parts.len().saturating_sub(1);
                for (index, part) in parts.into_iter().enumerate() {
                    let is_last = index == last;
                    pieces.push(Piece {
                        tokens: counter.count(&part),
                        text: part,
                        separator: if is_last { separator } else { "" },
                        page: page.number,
                        boundary: is_last && boundary,
                    });
                }
            }
        }
    }

    pieces
}

fn ends_sentence(word: &str) -> bool {
    let trimmed = word.trim_end_matches(['"', '\'', ')', ']', '\u{201d}', '\u{2019}']);
    trimmed.ends_with(['.', '!', '?', ';'])
}

fn split_long_word(word: &str, counter: &dyn TokenCounter, chunk_tokens: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();

    for ch in word.chars() {
        current.push(ch);
        if counter.count(&current) > chunk_tokens && current.chars().count() > 1 {
            current.pop();
            parts.push(std::mem::take(&mut current));
            current.push(ch);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

/// Lazily yields the chunks of one document.
pub struct ChunkStream {
    contract_id: String,
    config: ChunkingConfig,
    pieces: Vec<Piece>,
    start: usize,
    overlap_len: usize,
    next_index: usize,
    oversized: usize,
    done: bool,
}

impl ChunkStream {
    /// Segments that had to exceed the target size (or be force-split) so far.
    pub fn oversized_segments(&self) -> usize {
        self.oversized
    }

    fn greedy_end(&self, from: usize, budget: usize) -> usize {
        let mut end = from;
        let mut tokens = 0;
        while end < self.pieces.len() && tokens + self.pieces[end].tokens <= budget {
            tokens += self.pieces[end].tokens;
            end += 1;
        }
        end
    }

    /// Last sentence or paragraph end within the lookback window before `end`.
    fn boundary_before(&self, fresh: usize, end: usize) -> Option<usize> {
        let mut cut = end;
        let mut trailing = 0;
        while cut > fresh && trailing <= self.config.lookback_tokens {
            if self.pieces[cut - 1].boundary {
                return Some(cut);
            }
            trailing += self.pieces[cut - 1].tokens;
            cut -= 1;
        }
        None
    }

    /// Extends a sentence that starts at `from` to its end, bounded by the model limit.
    fn whole_sentence_end(&self, from: usize) -> usize {
        let mut end = from;
        let mut tokens = 0;
        while end < self.pieces.len() && tokens + self.pieces[end].tokens <= self.config.model_limit {
            tokens += self.pieces[end].tokens;
            end += 1;
            if self.pieces[end - 1].boundary {
                break;
            }
        }
        end
    }

    fn overlap_start(&self, start: usize, end: usize) -> usize {
        let mut begin = end;
        let mut carried = 0;
        while begin > start + 1 && carried + self.pieces[begin - 1].tokens <= self.config.overlap_tokens {
            carried += self.pieces[begin - 1].tokens;
            begin -= 1;
        }
        begin
    }
}

impl Iterator for ChunkStream {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.start >= self.pieces.len() {
            return None;
        }

        let mut end = self.greedy_end(self.start, self.config.chunk_tokens);
        let mut fresh = self.start + self.overlap_len;
        if end <= fresh && self.overlap_len > 0 {
            // carried overlap leaves no room for new text
            self.start = fresh;
            self.overlap_len = 0;
            end = self.greedy_end(self.start, self.config.chunk_tokens);
        }

        if end < self.pieces.len() {
            match self.boundary_before(fresh, end) {
                Some(cut) => end = cut,
                None => {
                    let sentence_starts_here = fresh == 0 || self.pieces[fresh - 1].boundary;
                    let sentence_open = self.pieces[fresh..end].iter().all(|piece| !piece.boundary);
                    if sentence_starts_here && sentence_open {
                        self.oversized += 1;
                        let sentence_end = self.whole_sentence_end(fresh);
                        if self.pieces[sentence_end - 1].boundary {
                            self.start = fresh;
                            self.overlap_len = 0;
                            end = sentence_end;
                            warn!(
                                contract_id = %self.contract_id,
                                chunk_index = self.next_index,
                                "sentence exceeds chunk target, emitting it as its own chunk"
                            );
                        } else {
                            warn!(
                                contract_id = %self.contract_id,
                                chunk_index = self.next_index,
                                "sentence exceeds the model limit, splitting on word boundaries"
                            );
                        }
                    }
                }
            }
        }
        fresh = self.start + self.overlap_len;

        let window = &self.pieces[self.start..end];
        let mut text = String::new();
        for (offset, piece) in window.iter().enumerate() {
            text.push_str(&piece.text);
            if offset + 1 < window.len() {
                text.push_str(piece.separator);
            }
        }

        let chunk = Chunk {
            contract_id: self.contract_id.clone(),
            chunk_index: self.next_index,
            page_start: window.iter().map(|piece| piece.page).min().unwrap_or(0),
            page_end: window.iter().map(|piece| piece.page).max().unwrap_or(0),
            token_count: window.iter().map(|piece| piece.tokens).sum(),
            overlap_tokens: self.pieces[self.start..fresh].iter().map(|piece| piece.tokens).sum(),
            overlaps_previous: self.overlap_len > 0,
            text,
        };
        self.next_index += 1;

        if end >= self.pieces.len() {
            self.done = true;
        } else {
            let next_start = self.overlap_start(self.start, end);
            self.overlap_len = end - next_start;
            self.start = next_start;
        }

        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: u32, text: &str) -> PageText {
        PageText {
            number,
            text: text.to_string(),
        }
    }

    fn chunker(chunk_tokens: usize, overlap_tokens: usize, lookback_tokens: usize, model_limit: usize) -> Chunker {
        Chunker::new(
            ChunkingConfig {
                chunk_tokens,
                overlap_tokens,
                lookback_tokens,
                model_limit,
            },
            Arc::new(EstimatedTokenCounter::default()),
        )
    }

    #[test]
    fn sizes_are_derived_from_the_model_limit() {
        let config = ChunkingConfig::resolve(&ChunkingSettings::default(), 512).unwrap();
        assert_eq!(config.chunk_tokens, 409);
        assert_eq!(config.overlap_tokens, 81);
        assert_eq!(config.model_limit, 512);

        let remote = ChunkingConfig::resolve(&ChunkingSettings::default(), 8192).unwrap();
        assert_eq!(remote.chunk_tokens, 6553);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let settings = ChunkingSettings {
            chunk_tokens: Some(10),
            overlap_tokens: Some(10),
            ..ChunkingSettings::default()
        };
        assert!(matches!(
            ChunkingConfig::resolve(&settings, 512),
            Err(IngestError::Chunking(_))
        ));
    }

    #[test]
    fn override_cannot_exceed_model_limit() {
        let settings = ChunkingSettings {
            chunk_tokens: Some(600),
            ..ChunkingSettings::default()
        };
        assert!(ChunkingConfig::resolve(&settings, 512).is_err());
    }

    #[test]
    fn estimate_counts_per_word() {
        let counter = EstimatedTokenCounter { chars_per_token: 4 };
        assert_eq!(counter.count("a bb ccccc"), 1 + 1 + 2);
        assert_eq!(counter.count("   "), 0);
    }

    #[test]
    fn chunks_respect_limit_and_carry_overlap() {
        let words = (0..120).map(|i| format!("w{:02}", i % 100)).collect::<Vec<_>>();
        let pages = vec![page(1, &words[..60].join(" ")), page(2, &words[60..].join(" "))];

        let chunks = chunker(20, 5, 10, 25).chunks("c1", &pages).collect::<Vec<_>>();
        assert!(chunks.len() > 1);

        for chunk in &chunks {
            assert!(chunk.token_count <= 20, "chunk {} too large", chunk.chunk_index);
        }

        for pair in chunks.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            assert!(current.overlaps_previous);
            assert_eq!(current.overlap_tokens, 5);
            let carried = current.text.split_whitespace().take(current.overlap_tokens).collect::<Vec<_>>();
            let tail = previous.text.split_whitespace().collect::<Vec<_>>();
            assert_eq!(&tail[tail.len() - carried.len()..], carried.as_slice());
        }

        assert!(!chunks[0].overlaps_previous);
        assert_eq!(chunks[0].page_start, 1);
        assert_eq!(chunks.last().unwrap().page_end, 2);
        assert!(chunks.iter().any(|chunk| chunk.page_start == 1 && chunk.page_end == 2));
    }

    #[test]
    fn cuts_prefer_sentence_ends() {
        let text = "The parties agree to this. Each one must keep all data safe and also private. \
                    Any breach is bad.";
        let chunks = chunker(11, 0, 5, 20).chunks("c1", &[page(1, text)]).collect::<Vec<_>>();

        assert_eq!(chunks[0].text, "The parties agree to this.");
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 20));
    }

    #[test]
    fn oversized_sentence_is_emitted_alone_and_counted() {
        let long_sentence = (0..15).map(|_| "law").collect::<Vec<_>>().join(" ") + ".";
        let text = format!("Short one. {long_sentence} Tail here.");

        let mut stream = chunker(8, 0, 6, 20).chunks("c1", &[page(1, &text)]);
        let chunks = stream.by_ref().collect::<Vec<_>>();

        assert_eq!(stream.oversized_segments(), 1);
        let alone = chunks
            .iter()
            .find(|chunk| chunk.text == long_sentence)
            .expect("long sentence kept whole");
        assert_eq!(alone.token_count, 15);
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 20));
    }

    #[test]
    fn giant_word_is_split_below_the_target() {
        let text = format!("start {} end", "x".repeat(100));
        let mut stream = chunker(10, 2, 5, 12).chunks("c1", &[page(3, &text)]);
        let chunks = stream.by_ref().collect::<Vec<_>>();

        assert!(stream.oversized_segments() >= 1);
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 10));
        let rebuilt: usize = chunks.iter().map(|chunk| chunk.text.matches('x').count()).sum();
        assert!(rebuilt >= 100);
        assert!(chunks.iter().all(|chunk| chunk.page_start == 3));
    }

    #[test]
    fn chunk_indices_are_sequential() {
        let text = (0..50).map(|i| format!("word{i}.")).collect::<Vec<_>>().join(" ");
        let chunks = chunker(10, 2, 5, 12).chunks("c1", &[page(1, &text)]).collect::<Vec<_>>();
        for (expected, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, expected);
            assert_eq!(chunk.contract_id, "c1");
        }
    }

    #[test]
    fn empty_pages_yield_nothing() {
        let chunks = chunker(10, 2, 5, 12).chunks("c1", &[page(1, "   ")]).collect::<Vec<_>>();
        assert!(chunks.is_empty());
    }
}
