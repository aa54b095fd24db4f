use crate::config::ChunkingConfig;
use std::collections::VecDeque;

/// Splits normalized text into overlapping segments, preferring the earliest
/// separator in the configured list (headings, then paragraphs, then lines,
/// sentences, words and finally single characters).
#[derive(Debug, Clone, Default)]
pub struct TextChunker {
    config: ChunkingConfig,
}

impl TextChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let size = self.config.chunk_size.max(1);
        let overlap = self.config.chunk_overlap.min(size.saturating_sub(1));

        split_recursive(text, &self.config.separators, size, overlap)
            .into_iter()
            .map(|chunk| chunk.trim().to_string())
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn split_recursive(text: &str, separators: &[String], size: usize, overlap: usize) -> Vec<String> {
    let mut separator = separators.last().map(String::as_str).unwrap_or("");
    let mut remaining: &[String] = &[];

    for (position, candidate) in separators.iter().enumerate() {
        if candidate.is_empty() {
            separator = "";
            break;
        }
        if text.contains(candidate.as_str()) {
            separator = candidate;
            remaining = &separators[position + 1..];
            break;
        }
    }

    let mut chunks = Vec::new();
    let mut pending = Vec::new();

    for piece in split_keeping_separator(text, separator) {
        if char_len(&piece) < size {
            pending.push(piece);
            continue;
        }

        if !pending.is_empty() {
            chunks.extend(merge_pieces(&pending, size, overlap));
            pending.clear();
        }

        if remaining.is_empty() {
            chunks.push(piece);
        } else {
            chunks.extend(split_recursive(&piece, remaining, size, overlap));
        }
    }

    if !pending.is_empty() {
        chunks.extend(merge_pieces(&pending, size, overlap));
    }

    chunks
}

// The separator stays attached to the start of the piece that follows it so
// that heading markers survive the split.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (index, _) in text.match_indices(separator) {
        if index > start {
            pieces.push(text[start..index].to_string());
        }
        start = index;
    }
    if start < text.len() {
        pieces.push(text[start..].to_string());
    }
    pieces
}

fn merge_pieces(pieces: &[String], size: usize, overlap: usize) -> Vec<String> {
    let mut merged = Vec::new();
    let mut window: VecDeque<(&str, usize)> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let length = char_len(piece);

        if total + length > size && !window.is_empty() {
            push_joined(&mut merged, &window);

            while total > overlap || (total + length > size && total > 0) {
                match window.pop_front() {
                    Some((_, dropped)) => total -= dropped,
                    None => break,
                }
            }
        }

        window.push_back((piece.as_str(), length));
        total += length;
    }

    push_joined(&mut merged, &window);
    merged
}

fn push_joined(target: &mut Vec<String>, window: &VecDeque<(&str, usize)>) {
    let joined = window.iter().map(|(piece, _)| *piece).collect::<String>();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        target.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(size: usize, overlap: usize) -> TextChunker {
        TextChunker::new(ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            ..ChunkingConfig::default()
        })
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunker(512, 77).chunk("  Travel expenses are reimbursed monthly.  ");
        assert_eq!(chunks, vec!["Travel expenses are reimbursed monthly.".to_string()]);
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        assert!(chunker(512, 77).chunk(" \n\n ").is_empty());
    }

    #[test]
    fn heading_boundaries_are_preferred() {
        let text = "# A\nintro text\n## B\nbody b\n## C\nbody c";
        let chunks = chunker(30, 0).chunk(text);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "# A\nintro text\n## B\nbody b");
        assert_eq!(chunks[1], "## C\nbody c");
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let chunks = chunker(10, 5).chunk("aaaa bbbb cccc dddd eeee ffff");

        assert_eq!(
            chunks,
            vec!["aaaa bbbb", "bbbb cccc", "cccc dddd", "dddd eeee", "eeee ffff"]
        );
        for pair in chunks.windows(2) {
            let tail = pair[0].split(' ').last().unwrap_or_default();
            assert!(pair[1].starts_with(tail));
        }
    }

    #[test]
    fn chunks_respect_the_target_size() {
        let text = "word ".repeat(400);
        let chunks = chunker(64, 8).chunk(&text);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 64));
    }

    #[test]
    fn unbroken_text_falls_back_to_character_splits() {
        let text = "x".repeat(25);
        let chunks = chunker(10, 2).chunk(&text);

        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
        assert_eq!(chunks.first().map(String::len), Some(10));
    }

    #[test]
    fn multibyte_text_is_measured_in_characters() {
        let text = "就業規則。有給休暇は十日。出張旅費規程、日当。";
        let chunks = chunker(8, 0).chunk(text);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 8));
    }
}
