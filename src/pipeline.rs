use crate::{
    chunk::Chunk,
    config::Config,
    error::{Error, Result},
    project::ProjectMetadata,
    splitter::{Splitter, Strategy},
    validator::ChunkValidator,
    writer::Writer,
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Share of the chunk budget above which a chunk is reported as near the limit.
const NEAR_LIMIT_RATIO: f64 = 0.9;

/// Validated chunks of one document and the strategy that produced them.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPlan {
    /// Splitting strategy used
    pub strategy: Strategy,

    /// Token budget per chunk
    pub chunk_budget: usize,

    /// Chunks in document order
    pub chunks: Vec<Chunk>,
}

impl ChunkPlan {
    /// Returns the total estimated tokens.
    #[must_use]
    pub fn total_tokens(&self) -> usize {
        self.chunks.iter().map(|c| c.tokens_estimated).sum()
    }
}

/// Statistics collected during a prompt export.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Splitting strategy used
    pub strategy: Strategy,

    /// Total number of chunks created
    pub total_chunks: usize,

    /// Total tokens across all chunks
    pub total_tokens: usize,

    /// Average tokens per chunk
    pub avg_tokens_per_chunk: usize,

    /// Largest chunk size in tokens
    pub max_chunk_tokens: usize,

    /// Smallest chunk size in tokens
    pub min_chunk_tokens: usize,

    /// Token budget per chunk
    pub chunk_budget: usize,

    /// Total execution time
    pub duration: Duration,

    /// Time spent splitting and validating
    pub split_duration: Duration,

    /// Time spent writing
    pub write_duration: Duration,

    /// Output directory path
    pub output_directory: String,

    /// Number of files written, summary included
    pub files_written: usize,
}

impl PipelineStats {
    fn new(
        plan: &ChunkPlan,
        duration: Duration,
        split_duration: Duration,
        write_duration: Duration,
        output_directory: String,
        files_written: usize,
    ) -> Self {
        let total_chunks = plan.chunks.len();
        let total_tokens = plan.total_tokens();
        let tokens = plan.chunks.iter().map(|c| c.tokens_estimated);

        Self {
            strategy: plan.strategy,
            total_chunks,
            total_tokens,
            avg_tokens_per_chunk: total_tokens.checked_div(total_chunks).unwrap_or(0),
            max_chunk_tokens: tokens.clone().max().unwrap_or(0),
            min_chunk_tokens: tokens.min().unwrap_or(0),
            chunk_budget: plan.chunk_budget,
            duration,
            split_duration,
            write_duration,
            output_directory,
            files_written,
        }
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║            Prompt Export Summary                      ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!("║ Strategy:             {:>15}                 ║", self.strategy.to_string());
        println!(
            "║ Chunks Created:       {:>8}                        ║",
            self.total_chunks
        );
        println!(
            "║ Total Tokens:         {:>8}                        ║",
            self.total_tokens
        );
        println!(
            "║ Avg Tokens/Chunk:     {:>8}                        ║",
            self.avg_tokens_per_chunk
        );
        println!(
            "║ Min Chunk Size:       {:>8} tokens                 ║",
            self.min_chunk_tokens
        );
        println!(
            "║ Max Chunk Size:       {:>8} tokens                 ║",
            self.max_chunk_tokens
        );
        println!(
            "║ Chunk Budget:         {:>8} tokens                 ║",
            self.chunk_budget
        );
        println!("║                                                       ║");
        println!(
            "║ Files Written:        {:>8}                        ║",
            self.files_written
        );
        println!("║ Output Directory:                                     ║");
        println!("║   {}", self.output_directory);
        println!("║                                                       ║");
        println!("║ Timing Breakdown:                                     ║");
        println!(
            "║   - Splitting:        {:>8.2}s                     ║",
            self.split_duration.as_secs_f64()
        );
        println!(
            "║   - Writing:          {:>8.2}s                     ║",
            self.write_duration.as_secs_f64()
        );
        println!(
            "║   - Total:            {:>8.2}s                     ║",
            self.duration.as_secs_f64()
        );
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Chunks a ToR document and exports its extraction prompts without calling
/// any language model.
pub struct PromptPipeline {
    config: Config,
    splitter: Splitter,
    validator: ChunkValidator,
    writer: Writer,
}

impl PromptPipeline {
    /// Creates a new pipeline with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - Prompt templates cannot be loaded
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            splitter: Splitter::new(&config),
            validator: ChunkValidator::new(&config),
            writer: Writer::new(&config)?,
            config,
        })
    }

    /// Reads a plain-text document.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read as UTF-8.
    pub fn read_document(path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| Error::io(path, e))
    }

    /// Splits and validates `text`.
    #[must_use]
    pub fn plan(&self, text: &str) -> ChunkPlan {
        let (strategy, raw) = self.splitter.split_detailed(text);
        let plan = ChunkPlan {
            strategy,
            chunk_budget: self.splitter.max_tokens(),
            chunks: self.validator.process(raw),
        };
        self.log_chunk_distribution(&plan);
        plan
    }

    /// Chunks `text` and writes one extraction prompt per chunk plus
    /// `summary.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document yields no chunks or writing fails.
    #[instrument(skip(self, text, project), fields(output_dir = %self.config.output_dir.display()))]
    pub fn run(&self, text: &str, project: &ProjectMetadata) -> Result<PipelineStats> {
        let start_time = Instant::now();

        info!("Stage 1/2: Splitting document...");
        let plan = self.plan(text);
        let split_duration = start_time.elapsed();

        if plan.chunks.is_empty() {
            return Err(Error::config(
                "Document produced no usable chunks",
            ));
        }

        info!(
            "✓ Created {} chunks in {:.2}s",
            plan.chunks.len(),
            split_duration.as_secs_f64()
        );

        info!("Stage 2/2: Writing prompt files...");
        let write_start = Instant::now();
        let written = self.writer.write_prompts(&plan.chunks, project)?;
        self.writer
            .write_summary(&plan.chunks, project, start_time.elapsed())?;
        let files_written = written.len() + 1;
        let write_duration = write_start.elapsed();

        info!(
            "✓ Wrote {} files in {:.2}s",
            files_written,
            write_duration.as_secs_f64()
        );

        Ok(PipelineStats::new(
            &plan,
            start_time.elapsed(),
            split_duration,
            write_duration,
            self.config.output_dir.display().to_string(),
            files_written,
        ))
    }

    /// Logs information about chunk distribution.
    fn log_chunk_distribution(&self, plan: &ChunkPlan) {
        if plan.chunks.is_empty() {
            return;
        }

        let tokens = plan.chunks.iter().map(|c| c.tokens_estimated);
        info!(
            "  Chunk stats: avg={}, min={}, max={} tokens",
            plan.total_tokens() / plan.chunks.len(),
            tokens.clone().min().unwrap_or(0),
            tokens.max().unwrap_or(0)
        );

        let threshold = (plan.chunk_budget as f64 * NEAR_LIMIT_RATIO) as usize;
        let near_limit = plan
            .chunks
            .iter()
            .filter(|c| c.tokens_estimated > threshold)
            .count();

        if near_limit > 0 {
            warn!(
                "  {} chunk(s) are >90% of the token budget (overlap may be trimmed)",
                near_limit
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn create_test_config(root: &Path) -> Config {
        Config::builder()
            .output_dir(root.join("out"))
            .max_tokens(120)
            .overlap_tokens(15)
            .build()
            .unwrap()
    }

    fn tor_text() -> String {
        let mut text = String::from("TÉRMINOS DE REFERENCIA\n\n");
        for header in ["ANTECEDENTES", "OBJETIVOS", "METODOLOGÍA"] {
            text.push_str(header);
            text.push_str("\n\n");
            for i in 0..8 {
                text.push_str(&format!(
                    "Sentence {i} explains the {header} of the safe water project in Chiquimula. "
                ));
            }
            text.push_str("\n\n");
        }
        text
    }

    #[test]
    fn test_pipeline_basic_execution() {
        let temp = assert_fs::TempDir::new().unwrap();
        let pipeline = PromptPipeline::new(create_test_config(temp.path())).unwrap();

        let stats = pipeline
            .run(&tor_text(), &ProjectMetadata::new().with("title", "Agua"))
            .unwrap();

        assert!(stats.total_chunks > 1);
        assert_eq!(stats.files_written, stats.total_chunks + 1);
        assert!(temp.child("out").child("summary.json").exists());
        assert!(temp.child("out").child("prompt_001.txt").exists());
        assert!(stats.min_chunk_tokens <= stats.avg_tokens_per_chunk);
        assert!(stats.avg_tokens_per_chunk <= stats.max_chunk_tokens);
    }

    #[test]
    fn test_pipeline_rejects_error_document() {
        let temp = assert_fs::TempDir::new().unwrap();
        let pipeline = PromptPipeline::new(create_test_config(temp.path())).unwrap();

        let result = pipeline.run("Error: PDF extraction failed", &ProjectMetadata::new());

        assert!(result.is_err());
        assert!(!temp.child("out").exists());
    }

    #[test]
    fn test_plan_small_document() {
        let temp = assert_fs::TempDir::new().unwrap();
        let pipeline = PromptPipeline::new(create_test_config(temp.path())).unwrap();

        let plan = pipeline.plan("A short ToR asking for a household water filter pilot in Jocotán.");

        assert_eq!(plan.strategy, Strategy::Whole);
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunk_budget, 120);
    }

    #[test]
    fn test_pipeline_rejects_too_short_document() {
        let temp = assert_fs::TempDir::new().unwrap();
        let pipeline = PromptPipeline::new(create_test_config(temp.path())).unwrap();

        assert!(pipeline.plan("Short ToR").chunks.is_empty());
        assert!(pipeline.run("Short ToR", &ProjectMetadata::new()).is_err());
        assert!(!temp.child("out").exists());
    }

    #[test]
    fn test_read_document() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("tor.txt");
        file.write_str("ANTECEDENTES\n\nTexto.").unwrap();

        assert_eq!(PromptPipeline::read_document(file.path()).unwrap(), "ANTECEDENTES\n\nTexto.");
        assert!(PromptPipeline::read_document(&temp.path().join("missing.txt")).unwrap_err().is_io());
    }
}
