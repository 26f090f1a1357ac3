use crate::{
    chunk::ChunkIndex,
    client::has_error_marker,
    config::Config,
    sections::{detect_header, detect_sub_header},
    token::{HeuristicEstimator, TokenEstimator},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::{fmt, sync::Arc};
use tracing::{debug, info, trace};

/// Section name of the single chunk produced for small documents.
pub const COMPLETE_SECTION: &str = "complete";

/// Section name of text preceding the first detected heading.
pub const PREAMBLE_SECTION: &str = "preamble";

/// Separator between an overlap prefix and the chunk body.
pub const OVERLAP_SEPARATOR: &str = "\n\n";

const CHARS_PER_TOKEN: usize = 4;

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*(?:\r?\n[ \t]*)+").expect("valid paragraph regex"));

/// A chunk as produced by the splitter, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawChunk {
    /// Text including any overlap prefix
    pub content: String,

    /// Detected or synthetic section name
    pub section: String,

    /// Structural index
    pub index: ChunkIndex,

    /// Heuristic token estimate of `content`
    pub tokens_estimated: usize,

    /// Byte length of the overlap prefix (separator included)
    pub overlap_len: usize,
}

impl RawChunk {
    /// Returns the content without the overlap prefix.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.content[self.overlap_len..]
    }

    /// Returns true for the single chunk covering a small document.
    #[must_use]
    pub fn is_whole_document(&self) -> bool {
        self.section == COMPLETE_SECTION && self.index == ChunkIndex::major(0)
    }
}

/// Strategy that produced a chunk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Blank input or input carrying the extractor's error marker
    Empty,
    /// The whole document fits in one chunk
    Whole,
    /// Split at section headings
    Structural,
    /// Split at numbered, lettered or bulleted items
    SubStructural,
    /// Split at blank lines
    Paragraph,
    /// Split into whitespace-aligned character windows
    Character,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Whole => "whole-document",
            Self::Structural => "structural",
            Self::SubStructural => "sub-structural",
            Self::Paragraph => "paragraph",
            Self::Character => "character",
        };
        f.write_str(name)
    }
}

/// Splits a document into an ordered sequence of chunks under a token budget.
///
/// Strategies are tried in order and the first one yielding at least two
/// usable parts wins:
///
/// 1. whole document, when it already fits
/// 2. section headings (see [`crate::sections`])
/// 3. numbered, lettered, roman or bulleted items, packed greedily
/// 4. paragraphs, then character windows
///
/// Any section still over budget is split by paragraph, then sentence, then
/// character windows snapped to whitespace. Every chunk after the first is
/// prefixed with trailing sentences of its predecessor.
pub struct Splitter {
    max_tokens: usize,
    overlap_tokens: usize,
    min_chunk_chars: usize,
    estimator: Arc<dyn TokenEstimator>,
}

impl Splitter {
    /// Creates a new splitter from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_limits(config.effective_chunk_tokens(), config.overlap_tokens)
            .min_chunk_chars(config.min_chunk_chars)
    }

    /// Creates a splitter with explicit limits and the heuristic estimator.
    #[must_use]
    pub fn with_limits(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            overlap_tokens,
            min_chunk_chars: crate::validator::DEFAULT_MIN_CHUNK_CHARS,
            estimator: Arc::new(HeuristicEstimator),
        }
    }

    /// Sets the length below which a piece is folded into a neighbour.
    #[must_use]
    pub const fn min_chunk_chars(mut self, min_chunk_chars: usize) -> Self {
        self.min_chunk_chars = min_chunk_chars;
        self
    }

    /// Replaces the token estimator.
    #[must_use]
    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Returns the token budget per chunk.
    #[must_use]
    pub const fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Splits text into chunks.
    ///
    /// Blank input, or input starting with the error marker, yields no
    /// chunks. This never fails: oversized words are cut into windows.
    #[must_use]
    pub fn split(&self, text: &str) -> Vec<RawChunk> {
        self.split_detailed(text).1
    }

    /// Splits text and reports which strategy was used.
    #[must_use]
    pub fn split_detailed(&self, text: &str) -> (Strategy, Vec<RawChunk>) {
        if text.trim().is_empty() || has_error_marker(text) {
            debug!("Input is blank or an extraction error, nothing to split");
            return (Strategy::Empty, Vec::new());
        }

        let total_tokens = self.estimator.estimate(text);
        if total_tokens <= self.max_tokens {
            let content = text.trim().to_string();
            let tokens_estimated = self.estimator.estimate(&content);
            debug!("Document fits in one chunk ({} tokens)", total_tokens);
            return (
                Strategy::Whole,
                vec![RawChunk {
                    content,
                    section: COMPLETE_SECTION.to_string(),
                    index: ChunkIndex::major(0),
                    tokens_estimated,
                    overlap_len: 0,
                }],
            );
        }

        info!(
            "Chunking document: {} tokens into {} token chunks",
            total_tokens, self.max_tokens
        );

        let (strategy, planned) = self.plan(text);
        let planned = self.absorb_fragments(text, planned);
        let chunks = self.finish(text, &planned);

        info!(
            "✓ Split with {} strategy into {} chunks",
            strategy,
            chunks.len()
        );

        (strategy, chunks)
    }

    /// Chooses a strategy and lays out chunk spans without overlap.
    fn plan(&self, text: &str) -> (Strategy, Vec<Planned>) {
        let sections = sections_at(text, |line| detect_header(line).map(str::to_string));
        if self.usable_count(text, &sections) >= 2 {
            debug!("Found {} structural sections", sections.len());
            return (Strategy::Structural, self.plan_sections(text, sections));
        }

        let parts = sections_at(text, |line| detect_sub_header(line).then(String::new));
        if self.usable_count(text, &parts) >= 2 {
            debug!("Found {} sub-structural parts", parts.len());
            return (Strategy::SubStructural, self.plan_parts(text, parts));
        }

        let whole = Span::new(0, text.len());
        let budget = self.body_budget();

        if paragraph_spans(text, whole).len() >= 2 {
            let pieces = self.split_span(text, whole, budget);
            return (Strategy::Paragraph, numbered(pieces, Label::Part));
        }

        let windows = self.char_windows(text, whole, budget);
        (Strategy::Character, numbered(windows, Label::CharChunk))
    }

    /// Keeps each section whole when it fits; splits it otherwise.
    fn plan_sections(&self, text: &str, sections: Vec<Section>) -> Vec<Planned> {
        let budget = self.body_budget();
        let mut planned = Vec::new();

        for (group, section) in sections.into_iter().enumerate() {
            let Some(span) = section.span.trimmed(text) else {
                continue;
            };

            if self.estimate(text, span) <= self.max_tokens {
                planned.push(Planned::new(span, Label::Named(section.name), group, None));
                continue;
            }

            debug!(
                "Section '{}' exceeds {} tokens, splitting",
                section.name, self.max_tokens
            );
            let pieces = self.split_span(text, span, budget);
            planned.extend(pieces.into_iter().enumerate().map(|(minor, piece)| {
                Planned::new(piece, Label::Named(section.name.clone()), group, Some(minor + 1))
            }));
        }

        planned
    }

    /// Packs consecutive parts greedily; oversized parts are split alone.
    fn plan_parts(&self, text: &str, parts: Vec<Section>) -> Vec<Planned> {
        let budget = self.body_budget();
        let mut planned = Vec::new();
        let mut group = 0;
        let mut current: Option<Span> = None;

        for part in parts {
            let Some(span) = part.span.trimmed(text) else {
                continue;
            };

            if self.estimate(text, span) > self.max_tokens {
                if let Some(done) = current.take() {
                    planned.push(Planned::new(done, Label::Part, group, None));
                    group += 1;
                }
                let pieces = self.split_span(text, span, budget);
                planned.extend(
                    pieces
                        .into_iter()
                        .enumerate()
                        .map(|(minor, piece)| Planned::new(piece, Label::Part, group, Some(minor + 1))),
                );
                group += 1;
                continue;
            }

            current = match current {
                None => Some(span),
                Some(open) => {
                    let merged = Span::new(open.start, span.end);
                    if self.estimate(text, merged) <= budget {
                        Some(merged)
                    } else {
                        planned.push(Planned::new(open, Label::Part, group, None));
                        group += 1;
                        Some(span)
                    }
                }
            };
        }

        if let Some(done) = current {
            planned.push(Planned::new(done, Label::Part, group, None));
        }

        planned
    }

    /// Recursively splits a span by paragraph, then sentence, then
    /// character windows, packing the pieces back up to `budget`.
    fn split_span(&self, text: &str, span: Span, budget: usize) -> Vec<Span> {
        if self.estimate(text, span) <= budget {
            return vec![span];
        }

        for pieces in [paragraph_spans(text, span), sentence_spans(text, span)] {
            if pieces.len() >= 2 {
                let refined = pieces
                    .into_iter()
                    .flat_map(|piece| self.split_span(text, piece, budget))
                    .collect();
                return self.pack(text, refined, budget);
            }
        }

        trace!("Falling back to character windows for {} bytes", span.len());
        self.char_windows(text, span, budget)
    }

    /// Merges consecutive pieces while the merged span stays within budget.
    fn pack(&self, text: &str, pieces: Vec<Span>, budget: usize) -> Vec<Span> {
        let mut packed = Vec::with_capacity(pieces.len());
        let mut current: Option<Span> = None;

        for piece in pieces {
            current = match current {
                None => Some(piece),
                Some(open) => {
                    let merged = Span::new(open.start, piece.end);
                    if self.estimate(text, merged) <= budget {
                        Some(merged)
                    } else {
                        packed.push(open);
                        Some(piece)
                    }
                }
            };
        }

        packed.extend(current);
        packed
    }

    /// Cuts a span into windows of at most `budget` tokens.
    ///
    /// A window starts at `budget × 4` characters, snaps back to the last
    /// whitespace and shrinks until the estimate fits. A word longer than
    /// the window is hard-cut at a character boundary.
    fn char_windows(&self, text: &str, span: Span, budget: usize) -> Vec<Span> {
        let budget = budget.max(1);
        let mut windows = Vec::new();
        let mut start = skip_whitespace(text, span.start, span.end);

        while start < span.end {
            let rest = &text[start..span.end];
            let mut max_chars = budget.saturating_mul(CHARS_PER_TOKEN);

            let window = loop {
                let candidate = Span::new(start, start + window_end(rest, max_chars));
                let tokens = self.estimate(text, candidate);
                if tokens <= budget || max_chars <= 1 {
                    break candidate;
                }
                max_chars = shrink_window(max_chars, budget, tokens);
            };

            windows.extend(window.trimmed(text));
            start = skip_whitespace(text, window.end, span.end);
        }

        windows
    }

    /// Folds pieces that are too short or have no alphanumerics into a
    /// neighbour when the merge stays within the chunk budget.
    ///
    /// The first piece of a group merges forward (a bare heading belongs to
    /// what follows); later pieces merge backward.
    fn absorb_fragments(&self, text: &str, mut planned: Vec<Planned>) -> Vec<Planned> {
        let mut i = 0;

        while i < planned.len() {
            if planned.len() == 1 || !self.is_fragment(text, planned[i].span) {
                i += 1;
                continue;
            }

            let forward_first = planned[i].minor.is_none_or(|minor| minor == 1);
            let merged = if forward_first {
                self.merge_forward(text, &mut planned, i) || self.merge_backward(text, &mut planned, i)
            } else {
                self.merge_backward(text, &mut planned, i) || self.merge_forward(text, &mut planned, i)
            };

            if merged {
                trace!("Absorbed short fragment at position {}", i);
            } else {
                i += 1;
            }
        }

        planned
    }

    fn merge_forward(&self, text: &str, planned: &mut Vec<Planned>, i: usize) -> bool {
        let Some(next) = planned.get(i + 1) else {
            return false;
        };
        let merged = Span::new(planned[i].span.start, next.span.end);
        if self.estimate(text, merged) > self.max_tokens {
            return false;
        }
        planned[i + 1].span = merged;
        planned.remove(i);
        true
    }

    fn merge_backward(&self, text: &str, planned: &mut Vec<Planned>, i: usize) -> bool {
        if i == 0 {
            return false;
        }
        let merged = Span::new(planned[i - 1].span.start, planned[i].span.end);
        if self.estimate(text, merged) > self.max_tokens {
            return false;
        }
        planned[i - 1].span = merged;
        planned.remove(i);
        true
    }

    /// Numbers the planned spans and attaches overlap prefixes.
    fn finish(&self, text: &str, planned: &[Planned]) -> Vec<RawChunk> {
        let mut chunks = Vec::with_capacity(planned.len());
        let mut previous: Option<Span> = None;

        for (position, group) in planned.chunk_by(|a, b| a.group == b.group).enumerate() {
            let major = position + 1;

            for (minor, piece) in group.iter().enumerate() {
                let index = if group.len() > 1 {
                    ChunkIndex::sub(major, minor + 1)
                } else {
                    ChunkIndex::major(major)
                };

                let body = piece.span.slice(text);
                let (content, overlap_len) = previous
                    .and_then(|prev| self.with_overlap(text, prev, body))
                    .unwrap_or_else(|| (body.to_string(), 0));

                chunks.push(RawChunk {
                    tokens_estimated: self.estimator.estimate(&content),
                    content,
                    section: piece.label.resolve(major),
                    index,
                    overlap_len,
                });

                previous = Some(piece.span);
            }
        }

        chunks
    }

    /// Prefixes `body` with the trailing sentences of the previous chunk.
    ///
    /// Returns `None` when no whole sentence fits in the overlap budget or
    /// the prefixed chunk would exceed the chunk budget.
    fn with_overlap(&self, text: &str, previous: Span, body: &str) -> Option<(String, usize)> {
        if self.overlap_tokens == 0 {
            return None;
        }

        let mut start = None;
        for sentence in sentence_spans(text, previous).iter().rev() {
            let candidate = Span::new(sentence.start, previous.end);
            if self.estimate(text, candidate) > self.overlap_tokens {
                break;
            }
            start = Some(sentence.start);
        }

        let overlap = Span::new(start?, previous.end).slice(text);
        let content = format!("{overlap}{OVERLAP_SEPARATOR}{body}");

        if self.estimator.estimate(&content) > self.max_tokens {
            trace!("Dropping overlap that would exceed the chunk budget");
            return None;
        }

        Some((content, overlap.len() + OVERLAP_SEPARATOR.len()))
    }

    /// Budget for chunk bodies, leaving room for the overlap prefix.
    const fn body_budget(&self) -> usize {
        if self.overlap_tokens < self.max_tokens / 2 {
            self.max_tokens - self.overlap_tokens
        } else {
            self.max_tokens
        }
    }

    fn usable_count(&self, text: &str, sections: &[Section]) -> usize {
        sections
            .iter()
            .filter_map(|section| section.span.trimmed(text))
            .filter(|span| !self.is_fragment(text, *span))
            .count()
    }

    fn is_fragment(&self, text: &str, span: Span) -> bool {
        let slice = span.slice(text);
        slice.chars().count() < self.min_chunk_chars || !slice.chars().any(char::is_alphanumeric)
    }

    fn estimate(&self, text: &str, span: Span) -> usize {
        self.estimator.estimate(span.slice(text))
    }
}

/// Byte range into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    const fn len(self) -> usize {
        self.end - self.start
    }

    fn slice(self, text: &str) -> &str {
        &text[self.start..self.end]
    }

    /// Shrinks the span to exclude surrounding whitespace; `None` if blank.
    fn trimmed(self, text: &str) -> Option<Self> {
        let slice = self.slice(text);
        let trimmed = slice.trim();
        if trimmed.is_empty() {
            return None;
        }
        let start = self.start + (slice.len() - slice.trim_start().len());
        Some(Self::new(start, start + trimmed.len()))
    }
}

/// A named region between two detected headings.
#[derive(Debug)]
struct Section {
    span: Span,
    name: String,
}

/// How a planned chunk is labelled once its final index is known.
#[derive(Debug, Clone)]
enum Label {
    Named(String),
    Part,
    CharChunk,
}

impl Label {
    fn resolve(&self, major: usize) -> String {
        match self {
            Self::Named(name) => name.clone(),
            Self::Part => format!("part_{major}"),
            Self::CharChunk => format!("char_chunk_{major}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Planned {
    span: Span,
    label: Label,
    group: usize,
    minor: Option<usize>,
}

impl Planned {
    const fn new(span: Span, label: Label, group: usize, minor: Option<usize>) -> Self {
        Self {
            span,
            label,
            group,
            minor,
        }
    }
}

/// One group per piece.
fn numbered(pieces: Vec<Span>, label: Label) -> Vec<Planned> {
    pieces
        .into_iter()
        .enumerate()
        .map(|(group, span)| Planned::new(span, label.clone(), group, None))
        .collect()
}

/// Cuts the text at every line accepted by `detect`.
///
/// Text before the first break becomes a preamble section.
fn sections_at(text: &str, detect: impl Fn(&str) -> Option<String>) -> Vec<Section> {
    let mut breaks = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if let Some(name) = detect(line) {
            breaks.push((offset, name));
        }
        offset += line.len();
    }

    let Some(&(first, _)) = breaks.first() else {
        return Vec::new();
    };

    let mut sections = Vec::with_capacity(breaks.len() + 1);
    if !text[..first].trim().is_empty() {
        sections.push(Section {
            span: Span::new(0, first),
            name: PREAMBLE_SECTION.to_string(),
        });
    }

    let ends = breaks.iter().skip(1).map(|(start, _)| *start).chain([text.len()]);
    for ((start, name), end) in breaks.iter().zip(ends) {
        sections.push(Section {
            span: Span::new(*start, end),
            name: name.clone(),
        });
    }

    sections
}

/// Splits a span at blank lines.
fn paragraph_spans(text: &str, span: Span) -> Vec<Span> {
    let slice = span.slice(text);
    let mut spans = Vec::new();
    let mut start = 0;

    for found in PARAGRAPH_BREAK.find_iter(slice) {
        spans.push(Span::new(span.start + start, span.start + found.start()));
        start = found.end();
    }
    spans.push(Span::new(span.start + start, span.end));

    spans.into_iter().filter_map(|s| s.trimmed(text)).collect()
}

/// Splits a span after sentence-ending punctuation followed by whitespace.
fn sentence_spans(text: &str, span: Span) -> Vec<Span> {
    let slice = span.slice(text);
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = slice.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?' | '…') {
            continue;
        }
        if let Some(&(next, following)) = chars.peek() {
            if following.is_whitespace() {
                spans.push(Span::new(span.start + start, span.start + next));
                start = next;
            }
        }
    }
    spans.push(Span::new(span.start + start, span.end));

    spans.into_iter().filter_map(|s| s.trimmed(text)).collect()
}

/// Byte length of a window of at most `max_chars` characters of `rest`,
/// ending before whitespace when possible.
fn window_end(rest: &str, max_chars: usize) -> usize {
    let Some((hard_cut, _)) = rest.char_indices().nth(max_chars.max(1)) else {
        return rest.len();
    };

    match rest[..hard_cut].rfind(char::is_whitespace) {
        Some(space) if space > 0 => space,
        _ => hard_cut,
    }
}

/// Scales a window of `max_chars` by `budget / tokens`, shrinking it by at
/// least a tenth. Computed in `u128` so huge budgets cannot overflow.
fn shrink_window(max_chars: usize, budget: usize, tokens: usize) -> usize {
    let max_chars = max_chars as u128;
    let scaled = max_chars * budget as u128 / tokens.max(1) as u128;
    let shrunk = scaled.min(max_chars * 9 / 10).max(1);
    usize::try_from(shrunk).unwrap_or(usize::MAX)
}

fn skip_whitespace(text: &str, from: usize, end: usize) -> usize {
    let rest = &text[from..end];
    from + (rest.len() - rest.trim_start().len())
}
