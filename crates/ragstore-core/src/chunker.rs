//! Recursive separator text chunking with windowed overlap

use std::collections::VecDeque;
use std::ops::Range;

use sha2::{Digest, Sha256};

use super::error::{IndexError, IndexResult};
use super::types::{keys, Chunk, DocumentRecord, MetadataValue};

/// Coarsest to finest. The empty separator splits into single characters.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// A chunk of text located in its parent, before lineage metadata is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    /// Whitespace-trimmed content
    pub content: String,
    /// Start position in the parent text, in characters
    pub char_offset: usize,
    /// Length in characters
    pub char_len: usize,
}

#[derive(Debug, Clone)]
struct Piece {
    range: Range<usize>,
    chars: usize,
}

/// Splits documents into overlapping chunks.
/// All size calculations are based on **character count**, not byte count,
/// so multi-byte text never gets cut inside a code point.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextChunker {
    /// Create a chunker; requires `chunk_size > 0` and `chunk_overlap < chunk_size`
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> IndexResult<Self> {
        if chunk_size == 0 {
            return Err(IndexError::Configuration(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(IndexError::Configuration(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }

        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Replace the separator list. Without a trailing `""`, pieces that no
    /// separator can break are emitted whole and flagged oversized.
    pub fn with_separators(mut self, separators: Vec<String>) -> IndexResult<Self> {
        if separators.is_empty() {
            return Err(IndexError::Configuration(
                "at least one separator is required".to_string(),
            ));
        }
        self.separators = separators;
        Ok(self)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn separators(&self) -> &[String] {
        &self.separators
    }

    /// Split raw text into spans, in source order
    pub fn split_text(&self, text: &str) -> Vec<TextSpan> {
        let separators: Vec<&str> = self.separators.iter().map(String::as_str).collect();
        let mut ranges = Vec::new();
        self.split_range(text, 0..text.len(), &separators, &mut ranges);

        let mut cursor = CharCursor::default();
        ranges
            .into_iter()
            .filter_map(|range| self.to_span(text, range, &mut cursor))
            .collect()
    }

    /// Split one record, attaching lineage metadata to every chunk.
    /// Empty or whitespace-only text is rejected.
    pub fn split_document(&self, record: &DocumentRecord) -> IndexResult<Vec<Chunk>> {
        if record.text.trim().is_empty() {
            return Err(IndexError::Validation(format!(
                "document '{}' has no text",
                record.source().unwrap_or("<unnamed>")
            )));
        }

        let spans = self.split_text(&record.text);
        let parent_id = parent_id(record);
        let chunk_count = spans.len();

        let chunks = spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let mut metadata = record.metadata.clone();
                metadata
                    .entry(keys::SOURCE_TYPE.to_string())
                    .or_insert_with(|| MetadataValue::from("text"));
                metadata.insert(keys::CHUNK_INDEX.to_string(), index.into());
                metadata.insert(keys::CHUNK_COUNT.to_string(), chunk_count.into());
                metadata.insert(keys::PARENT_CHAR_OFFSET.to_string(), span.char_offset.into());
                metadata.insert(keys::PARENT_ID.to_string(), parent_id.clone().into());
                metadata.insert(
                    keys::OVERSIZED.to_string(),
                    (span.char_len > self.chunk_size).into(),
                );
                Chunk {
                    text: span.content,
                    metadata,
                }
            })
            .collect();

        Ok(chunks)
    }

    /// Split a batch of records; fails on the first invalid one
    pub fn split_documents(&self, records: &[DocumentRecord]) -> IndexResult<Vec<Chunk>> {
        let mut chunks = Vec::new();
        for record in records {
            chunks.extend(self.split_document(record)?);
        }
        Ok(chunks)
    }

    fn split_range(
        &self,
        text: &str,
        range: Range<usize>,
        separators: &[&str],
        out: &mut Vec<Range<usize>>,
    ) {
        let segment = &text[range.clone()];

        // First separator present in the segment; the rest become the finer levels
        let mut separator = separators.last().copied().unwrap_or("");
        let mut finer: &[&str] = &[];
        for (i, &candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                separator = candidate;
                break;
            }
            if segment.contains(candidate) {
                separator = candidate;
                finer = &separators[i + 1..];
                break;
            }
        }

        let mut fitting: Vec<Piece> = Vec::new();
        for piece in split_keeping_separator(segment, separator) {
            let piece = (piece.start + range.start)..(piece.end + range.start);
            let chars = text[piece.clone()].chars().count();

            if chars <= self.chunk_size {
                fitting.push(Piece {
                    range: piece,
                    chars,
                });
                continue;
            }

            if !fitting.is_empty() {
                self.merge(&fitting, out);
                fitting.clear();
            }
            if finer.is_empty() {
                out.push(piece);
            } else {
                self.split_range(text, piece, finer, out);
            }
        }

        if !fitting.is_empty() {
            self.merge(&fitting, out);
        }
    }

    /// Greedily pack contiguous pieces up to `chunk_size`, carrying up to
    /// `chunk_overlap` characters of the previous window into the next.
    fn merge(&self, pieces: &[Piece], out: &mut Vec<Range<usize>>) {
        let mut window: VecDeque<&Piece> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            if total + piece.chars > self.chunk_size && !window.is_empty() {
                out.push(window_range(&window));

                while total > self.chunk_overlap
                    || (total + piece.chars > self.chunk_size && total > 0)
                {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    total -= front.chars;
                }
            }

            window.push_back(piece);
            total += piece.chars;
        }

        if !window.is_empty() {
            out.push(window_range(&window));
        }
    }

    fn to_span(
        &self,
        text: &str,
        range: Range<usize>,
        cursor: &mut CharCursor,
    ) -> Option<TextSpan> {
        let raw = &text[range.clone()];
        let content = raw.trim();
        if content.is_empty() {
            return None;
        }

        let start = range.start + (raw.len() - raw.trim_start().len());
        let char_len = content.chars().count();
        if char_len > self.chunk_size {
            log::warn!(
                "Created a chunk of size {}, which is longer than the specified {}",
                char_len,
                self.chunk_size
            );
        }

        Some(TextSpan {
            content: content.to_string(),
            char_offset: cursor.seek(text, start),
            char_len,
        })
    }
}

/// Byte to char offset conversion for positions that mostly move forward.
/// Chunk starts are nearly sorted, so each lookup only counts the chars
/// between the previous position and the new one.
#[derive(Debug, Default)]
struct CharCursor {
    byte: usize,
    chars: usize,
}

impl CharCursor {
    fn seek(&mut self, text: &str, byte: usize) -> usize {
        if byte >= self.byte {
            self.chars += text[self.byte..byte].chars().count();
        } else {
            self.chars -= text[byte..self.byte].chars().count();
        }
        self.byte = byte;
        self.chars
    }
}

/// Separator occurrences start a new piece, so no text is lost
fn split_keeping_separator(segment: &str, separator: &str) -> Vec<Range<usize>> {
    if separator.is_empty() {
        return segment
            .char_indices()
            .map(|(i, c)| i..i + c.len_utf8())
            .collect();
    }

    let mut starts = vec![0];
    starts.extend(
        segment
            .match_indices(separator)
            .map(|(i, _)| i)
            .filter(|&i| i > 0),
    );

    let mut pieces = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(segment.len());
        if start < end {
            pieces.push(start..end);
        }
    }
    pieces
}

fn window_range(window: &VecDeque<&Piece>) -> Range<usize> {
    match (window.front(), window.back()) {
        (Some(first), Some(last)) => first.range.start..last.range.end,
        _ => 0..0,
    }
}

fn parent_id(record: &DocumentRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.source().unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(record.text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(TextChunker::new(0, 0).is_err());
        assert!(TextChunker::new(100, 100).is_err());
        assert!(TextChunker::new(100, 150).is_err());
        assert!(TextChunker::new(100, 99).is_ok());
        assert!(TextChunker::new(100, 0)
            .and_then(|c| c.with_separators(vec![]))
            .is_err());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunker = TextChunker::new(100, 10).unwrap();
        let spans = chunker.split_text("  Hello world.  ");

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].content, "Hello world.");
        assert_eq!(spans[0].char_offset, 2);
    }

    #[test]
    fn test_no_separator_scenario() {
        let chunker = TextChunker::new(100, 20).unwrap();
        let text: String = (0..250).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let spans = chunker.split_text(&text);

        let offsets: Vec<usize> = spans.iter().map(|s| s.char_offset).collect();
        let sizes: Vec<usize> = spans.iter().map(|s| s.char_len).collect();
        assert_eq!(offsets, vec![0, 80, 160]);
        assert_eq!(sizes, vec![100, 100, 90]);

        for pair in spans.windows(2) {
            let tail: String = pair[0].content.chars().skip(pair[0].char_len - 20).collect();
            assert!(pair[1].content.starts_with(&tail));
        }
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let chunker = TextChunker::new(40, 0).unwrap();
        let text = "First paragraph is here.\n\nSecond paragraph is here.";
        let spans = chunker.split_text(text);

        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].content, "First paragraph is here.");
        assert_eq!(spans[1].content, "Second paragraph is here.");
        assert_eq!(spans[1].char_offset, 26);
    }

    #[test]
    fn test_multibyte_text() {
        let chunker = TextChunker::new(10, 2).unwrap();
        let content = "这是一段很长的中文内容。我们需要确保在切分时不会切到汉字中间。";
        let spans = chunker.split_text(content);

        assert!(spans.len() > 1);
        for span in &spans {
            assert!(span.char_len <= 10);
            let expected: String = content
                .chars()
                .skip(span.char_offset)
                .take(span.char_len)
                .collect();
            assert_eq!(span.content, expected);
        }
    }

    #[test]
    fn test_offsets_stay_exact_on_long_text() {
        let chunker = TextChunker::new(50, 15).unwrap();
        let mut text = String::new();
        for i in 0..2000 {
            text.push_str(["naïve ", "word ", "   ", "日本語\n", "x\n\n"][i % 5]);
        }
        let chars: Vec<char> = text.chars().collect();

        let spans = chunker.split_text(&text);
        assert!(spans.len() > 100);
        for span in &spans {
            let expected: String = chars[span.char_offset..span.char_offset + span.char_len]
                .iter()
                .collect();
            assert_eq!(span.content, expected);
        }
    }

    #[test]
    fn test_char_cursor_moves_both_ways() {
        let text = "aé日bc";
        let mut cursor = CharCursor::default();
        assert_eq!(cursor.seek(text, 3), 2);
        assert_eq!(cursor.seek(text, 6), 3);
        assert_eq!(cursor.seek(text, 1), 1);
        assert_eq!(cursor.seek(text, text.len()), 5);
    }

    #[test]
    fn test_oversized_token_is_not_truncated() {
        let chunker = TextChunker::new(10, 0)
            .unwrap()
            .with_separators(vec!["\n\n".into(), "\n".into(), " ".into()])
            .unwrap();
        let word = "supercalifragilistic";
        let record = DocumentRecord::new(format!("tiny {word} end"));
        let chunks = chunker.split_document(&record).unwrap();

        let long = chunks.iter().find(|c| c.text == word).unwrap();
        assert!(long.is_oversized());
        assert!(chunks.iter().filter(|c| c.text != word).all(|c| !c.is_oversized()));
    }

    #[test]
    fn test_empty_text() {
        let chunker = TextChunker::new(100, 10).unwrap();
        assert!(chunker.split_text("").is_empty());
        assert!(chunker.split_text(" \n\n ").is_empty());

        let err = chunker.split_document(&DocumentRecord::new("   ")).unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));
    }
}
