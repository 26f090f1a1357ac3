use crate::{
    chunk::{Chunk, chunk_id},
    config::Config,
    splitter::RawChunk,
    token::count_words,
};
use tracing::{debug, info};

/// Chunks shorter than this (trimmed, overlap excluded) are dropped.
pub const DEFAULT_MIN_CHUNK_CHARS: usize = 50;

/// The single gate between the splitter and the orchestrator.
///
/// Drops degenerate chunks and attaches metadata to the survivors, so the
/// orchestrator never sees garbage input.
#[derive(Debug, Clone)]
pub struct ChunkValidator {
    min_chunk_chars: usize,
}

impl Default for ChunkValidator {
    fn default() -> Self {
        Self {
            min_chunk_chars: DEFAULT_MIN_CHUNK_CHARS,
        }
    }
}

impl ChunkValidator {
    /// Creates a validator from configuration.
    #[must_use]
    pub const fn new(config: &Config) -> Self {
        Self {
            min_chunk_chars: config.min_chunk_chars,
        }
    }

    /// Creates a validator with an explicit minimum length.
    #[must_use]
    pub const fn with_min_chars(min_chunk_chars: usize) -> Self {
        Self { min_chunk_chars }
    }

    /// Filters and enriches raw chunks, preserving their order.
    ///
    /// A chunk is dropped when its body is shorter than the minimum length,
    /// its token estimate is zero, or it has no alphanumeric character. The
    /// length rule also applies to the whole-document chunk of a small input.
    #[must_use]
    pub fn process(&self, raw_chunks: Vec<RawChunk>) -> Vec<Chunk> {
        let received = raw_chunks.len();

        let chunks: Vec<Chunk> = raw_chunks
            .into_iter()
            .filter(|raw| self.accepts(raw))
            .enumerate()
            .map(|(position, raw)| enrich(raw, position))
            .collect();

        if chunks.len() < received {
            info!(
                "Validator dropped {} of {} chunks",
                received - chunks.len(),
                received
            );
        }

        chunks
    }

    fn accepts(&self, raw: &RawChunk) -> bool {
        let body = raw.body().trim();

        let reason = if raw.tokens_estimated == 0 {
            Some("no tokens")
        } else if !body.chars().any(char::is_alphanumeric) {
            Some("no alphanumeric characters")
        } else if body.chars().count() < self.min_chunk_chars {
            Some("too short")
        } else {
            None
        };

        if let Some(reason) = reason {
            debug!("Dropping chunk {} ({}): {}", raw.index, raw.section, reason);
        }

        reason.is_none()
    }
}

fn enrich(raw: RawChunk, position: usize) -> Chunk {
    Chunk {
        chunk_id: chunk_id(&raw.content),
        word_count: count_words(&raw.content),
        char_count: raw.content.chars().count(),
        position,
        content: raw.content,
        section: raw.section,
        index: raw.index,
        tokens_estimated: raw.tokens_estimated,
        overlap_len: raw.overlap_len,
    }
}
