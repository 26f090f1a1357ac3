use crate::{
    chunk::Chunk,
    config::Config,
    error::{Error, Result},
    project::ProjectMetadata,
    prompt::PromptBuilder,
};
use serde::Serialize;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tracing::{debug, info};

/// Extension of written prompt files.
const PROMPT_EXTENSION: &str = "txt";

/// Summary of a dry run's output files.
#[derive(Debug, Serialize)]
pub(crate) struct WriteSummary {
    /// Total number of chunks written
    pub total_chunks: usize,

    /// Total estimated tokens across all chunks
    pub total_tokens: usize,

    /// Token budget per chunk
    pub chunk_budget: usize,

    /// Provider the budget was computed for
    pub provider: String,

    /// Execution duration in seconds
    pub duration_secs: f64,

    /// Output directory path
    pub output_directory: String,

    /// Project title, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_title: Option<String>,

    /// Individual chunk summaries
    pub chunks: Vec<ChunkSummary>,

    /// Generation timestamp
    pub generated_at: String,
}

/// Summary of a single chunk.
#[derive(Debug, Serialize)]
pub(crate) struct ChunkSummary {
    /// Hierarchical index, e.g. "2.1"
    pub index: String,

    /// Section label
    pub section: String,

    /// Estimated tokens of the chunk
    pub tokens: usize,

    /// Characters of overlap carried from the previous chunk
    pub overlap_chars: usize,

    /// Content fingerprint
    pub chunk_id: String,

    /// Output filename
    pub filename: String,
}

/// Writes extraction prompts to output files with atomic operations.
pub(crate) struct Writer {
    output_dir: PathBuf,
    output_pattern: String,
    backup_existing: bool,
    chunk_budget: usize,
    provider: String,
    prompts: PromptBuilder,
}

impl Writer {
    /// Creates a new writer from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt templates cannot be loaded.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            output_dir: config.output_dir.clone(),
            output_pattern: config.output_pattern.clone(),
            backup_existing: config.backup_existing,
            chunk_budget: config.effective_chunk_tokens(),
            provider: config.provider.to_string(),
            prompts: PromptBuilder::new(config)?,
        })
    }

    /// Renders and writes the extraction prompt of every chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Output directory cannot be created
    /// - Template rendering fails
    /// - File write operations fail
    pub(crate) fn write_prompts(&self, chunks: &[Chunk], project: &ProjectMetadata) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir).map_err(|e| Error::io(&self.output_dir, e))?;

        info!("Writing {} prompts to {}", chunks.len(), self.output_dir.display());

        let mut written = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let content = self
                .prompts
                .build_extraction_prompt(chunk, chunks.len(), project)?;
            let path = self.output_path(chunk.position);
            self.write_file_atomic(&path, &content)?;

            debug!(
                "Wrote chunk {} ({}, {} tokens) to {}",
                chunk.index,
                chunk.section,
                chunk.tokens_estimated,
                path.display()
            );
            written.push(path);
        }

        info!("Successfully wrote {} prompt files", written.len());
        Ok(written)
    }

    /// Generates the output file path for the chunk at `position`.
    fn output_path(&self, position: usize) -> PathBuf {
        let number = position + 1;
        let filename = self
            .output_pattern
            .replace("{index:03}", &format!("{number:03}"))
            .replace("{index:02}", &format!("{number:02}"))
            .replace("{index}", &number.to_string())
            .replace("{ext}", PROMPT_EXTENSION);

        self.output_dir.join(filename)
    }

    /// Writes a file atomically with optional backup.
    ///
    /// Content goes to a temporary file that is synced and then renamed over
    /// the target, so an interrupted write never leaves a partial file.
    fn write_file_atomic(&self, path: &Path, content: &str) -> Result<()> {
        if path.exists() && self.backup_existing {
            Self::backup_file(path)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut temp_file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;

        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| Error::io(&temp_path, e))?;
        temp_file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
        drop(temp_file);

        fs::rename(&temp_path, path).map_err(|e| Error::io(path, e))?;

        Ok(())
    }

    /// Creates a timestamped backup of an existing file.
    fn backup_file(path: &Path) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_nanos();

        let filename = path
            .file_name()
            .ok_or_else(|| Error::config("Invalid file path"))?
            .to_string_lossy();

        let backup_path = path
            .parent()
            .ok_or_else(|| Error::config("Invalid file path"))?
            .join(format!("{filename}.backup.{timestamp}"));

        fs::copy(path, &backup_path).map_err(|e| Error::io(&backup_path, e))?;

        debug!("Created backup: {}", backup_path.display());
        Ok(())
    }

    /// Writes `summary.json` describing every chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the summary file cannot be written.
    pub(crate) fn write_summary(
        &self,
        chunks: &[Chunk],
        project: &ProjectMetadata,
        duration: Duration,
    ) -> Result<PathBuf> {
        let summary = WriteSummary {
            total_chunks: chunks.len(),
            total_tokens: chunks.iter().map(|c| c.tokens_estimated).sum(),
            chunk_budget: self.chunk_budget,
            provider: self.provider.clone(),
            duration_secs: duration.as_secs_f64(),
            output_directory: self.output_dir.display().to_string(),
            project_title: project.title(),
            chunks: chunks
                .iter()
                .map(|c| ChunkSummary {
                    index: c.index.to_string(),
                    section: c.section.clone(),
                    tokens: c.tokens_estimated,
                    overlap_chars: c.overlap_len,
                    chunk_id: c.chunk_id.clone(),
                    filename: self
                        .output_path(c.position)
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                })
                .collect(),
            generated_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };

        fs::create_dir_all(&self.output_dir).map_err(|e| Error::io(&self.output_dir, e))?;
        let summary_path = self.output_dir.join("summary.json");
        self.write_file_atomic(&summary_path, &serde_json::to_string_pretty(&summary)?)?;

        info!("Wrote summary to {}", summary_path.display());
        Ok(summary_path)
    }
}
