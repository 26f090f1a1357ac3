//! # tor-proposal
//!
//! Turns a Terms-of-Reference (ToR) document into a funding proposal: a
//! narrative and a line-item budget, produced by two external language
//! models.
//!
//! ## Features
//!
//! - Heuristic token estimation with per-provider context budgets
//! - Hierarchical splitting (sections, numbered items, paragraphs, sentences)
//!   with sentence-aligned overlap
//! - Chained extract → synthesize prompting with bounded retries
//! - Donor-aware prompts (USAID, BID, GIZ, AECID) and budget normalisation
//! - Background worker with progress events and cooperative cancellation
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tor_proposal::{
//!     ChainedPromptGenerator, ChunkValidator, Clients, Config, ProjectMetadata, Splitter,
//!     TaskKind, mock::ScriptedProseClient,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::builder().build()?;
//! let text = std::fs::read_to_string("tor.txt")?;
//!
//! let chunks = ChunkValidator::new(&config).process(Splitter::new(&config).split(&text));
//! let project = ProjectMetadata::new().with("title", "Agua segura").with("donor", "USAID");
//!
//! let clients = Clients::new().with_prose(Arc::new(ScriptedProseClient::new("...")));
//! let mut generator = ChainedPromptGenerator::new(clients, &config)?;
//! let narrative = generator.process(&chunks, &project, TaskKind::Narrative, config.max_retries);
//! generator.stats().print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! 1. **Splitter**: divides the document into chunks under the token budget
//! 2. **Validator**: drops degenerate chunks and attaches metadata
//! 3. **Prompt builder**: renders extraction and synthesis prompts with Tera
//! 4. **Orchestrator**: runs extraction per chunk, then one synthesis call
//! 5. **Worker**: runs the whole flow on a background thread

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod budget;
mod cancel;
mod chunk;
mod client;
mod config;
mod donor;
mod error;
mod json;
mod orchestrator;
mod pipeline;
mod progress;
mod project;
mod prompt;
mod sections;
mod splitter;
mod template_validator;
mod token;
mod validator;
mod worker;
mod writer;

pub use budget::{
    Budget, BudgetItem, BudgetRates, CostEffectiveness, CostRating, DEFAULT_CURRENCY, DEFAULT_EXCHANGE_RATE,
    FinancialTotals, UNCATEGORIZED, budget_schema,
};
pub use cancel::CancelToken;
pub use chunk::{Chunk, ChunkIndex, chunk_id};
pub use client::{
    Capabilities, ClientError, Clients, LlmClient, ProseClient, StructuredClient, has_error_marker, mock,
};
pub use config::{Config, ConfigBuilder};
pub use donor::{DonorKind, DonorStandards};
pub use error::{Error, Result};
pub use json::{extract_first_json, recover_json, strip_code_fences};
pub use orchestrator::{ChainedPromptGenerator, PipelineResult, ProcessingStats, RetryPolicy};
pub use pipeline::{ChunkPlan, PipelineStats, PromptPipeline};
pub use progress::{Phase, Progress, ProgressSink, noop_sink};
pub use project::{ProjectMetadata, ProposalLanguage};
pub use prompt::{
    BUDGET_TEMPLATE, EXTRACTION_TEMPLATE, NARRATIVE_TEMPLATE, PROJECT_TEMPLATE, PromptBuilder, TaskKind,
};
pub use sections::{
    Language, MAX_HEADER_LEN, SECTION_TABLE, SectionKeyword, detect_header, detect_sub_header,
};
pub use splitter::{COMPLETE_SECTION, OVERLAP_SEPARATOR, PREAMBLE_SECTION, RawChunk, Splitter, Strategy};
pub use token::{
    ContextTier, DEFAULT_PROMPT_OVERHEAD, HeuristicEstimator, MIN_CONTENT_TOKENS, Provider, SAFETY_MARGIN,
    SMALL_TIER_OVERHEAD_CAP, TokenBudget, TokenEstimator, max_content_tokens,
};
pub use validator::{ChunkValidator, DEFAULT_MIN_CHUNK_CHARS};
pub use worker::{GenerationRequest, GenerationWorker, WorkerEvent, WorkerHandle};

/// Splits and validates `text` with the given configuration.
///
/// Blank input, input starting with the error marker, or a document shorter
/// than the minimum chunk length yields no chunks.
///
/// # Examples
///
/// ```
/// use tor_proposal::{Config, chunk_document};
///
/// let config = Config::default();
/// let chunks = chunk_document(
///     "A short ToR for a rural water project in three municipalities of Chiquimula.",
///     &config,
/// );
/// assert_eq!(chunks.len(), 1);
/// assert!(chunk_document("Short ToR", &config).is_empty());
/// ```
#[must_use]
pub fn chunk_document(text: &str, config: &Config) -> Vec<Chunk> {
    ChunkValidator::new(config).process(Splitter::new(config).split(text))
}
