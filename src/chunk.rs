use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Position of a chunk in the ordered sequence.
///
/// A section split into several pieces gets dotted sub-indices
/// (`2.1`, `2.2`, ...). Ordering follows document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkIndex {
    /// Section position
    pub major: usize,
    /// Piece within the section, 1-based
    pub minor: Option<usize>,
}

impl ChunkIndex {
    /// Index of an unsplit section.
    #[must_use]
    pub const fn major(major: usize) -> Self {
        Self { major, minor: None }
    }

    /// Index of one piece of a split section.
    #[must_use]
    pub const fn sub(major: usize, minor: usize) -> Self {
        Self {
            major,
            minor: Some(minor),
        }
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

impl Serialize for ChunkIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A validated slice of source text, ready for the orchestrator.
///
/// Chunks are immutable once produced by
/// [`ChunkValidator`](crate::validator::ChunkValidator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Text sent to the model, overlap prefix included
    pub content: String,

    /// Detected section name, or a synthetic `part_N` / `char_chunk_N`
    pub section: String,

    /// Structural index
    pub index: ChunkIndex,

    /// Sequential 0-based position among the surviving chunks
    pub position: usize,

    /// Heuristic token estimate of `content`
    pub tokens_estimated: usize,

    /// Content fingerprint
    pub chunk_id: String,

    /// Whitespace-separated words in `content`
    pub word_count: usize,

    /// Characters in `content`
    pub char_count: usize,

    /// Byte length of the overlap prefix at the start of `content`
    pub overlap_len: usize,
}

impl Chunk {
    /// Returns the content without the overlap prefix.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.content[self.overlap_len..]
    }

    /// Returns the overlap prefix (empty for most first chunks).
    #[must_use]
    pub fn overlap(&self) -> &str {
        &self.content[..self.overlap_len]
    }

    /// Returns true if the chunk carries an overlap prefix.
    #[must_use]
    pub const fn has_overlap(&self) -> bool {
        self.overlap_len > 0
    }

    /// Returns the utilization of `max_tokens` (0.0 to 1.0 and above).
    #[must_use]
    pub fn utilization(&self, max_tokens: usize) -> f64 {
        if max_tokens == 0 {
            return 0.0;
        }
        self.tokens_estimated as f64 / max_tokens as f64
    }
}

/// Content-derived fingerprint: the first 4 bytes of SHA-256, hex encoded.
///
/// Stable for identical content; meant for traceability, not security.
#[must_use]
pub fn chunk_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(content: &str, overlap_len: usize) -> Chunk {
        Chunk {
            content: content.to_string(),
            section: "background".to_string(),
            index: ChunkIndex::sub(1, 2),
            position: 3,
            tokens_estimated: 500,
            chunk_id: chunk_id(content),
            word_count: 2,
            char_count: content.chars().count(),
            overlap_len,
        }
    }

    #[test]
    fn test_index_display() {
        assert_eq!(ChunkIndex::major(2).to_string(), "2");
        assert_eq!(ChunkIndex::sub(2, 1).to_string(), "2.1");
    }

    #[test]
    fn test_index_ordering() {
        assert!(ChunkIndex::major(1) < ChunkIndex::sub(1, 1));
        assert!(ChunkIndex::sub(1, 2) < ChunkIndex::sub(1, 10));
        assert!(ChunkIndex::sub(1, 10) < ChunkIndex::major(2));
    }

    #[test]
    fn test_chunk_id_is_stable() {
        assert_eq!(chunk_id("hola mundo"), chunk_id("hola mundo"));
        assert_ne!(chunk_id("hola mundo"), chunk_id("hola mundo!"));
        assert_eq!(chunk_id("x").len(), 8);
    }

    #[test]
    fn test_body_and_overlap() {
        let chunk = sample("Prev.\n\nBody text", 7);
        assert_eq!(chunk.overlap(), "Prev.\n\n");
        assert_eq!(chunk.body(), "Body text");
        assert!(chunk.has_overlap());
    }

    #[test]
    fn test_utilization() {
        let chunk = sample("text", 0);
        assert_eq!(chunk.utilization(1000), 0.5);
        assert_eq!(chunk.utilization(0), 0.0);
    }

    #[test]
    fn test_serializes_index_as_string() {
        let json = serde_json::to_value(sample("text", 0)).unwrap();
        assert_eq!(json["index"], "1.2");
        assert_eq!(json["section"], "background");
    }
}
