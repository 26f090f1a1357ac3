use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tor_proposal::{
    Budget, Config, ConfigBuilder, ProjectMetadata, PromptPipeline, Provider, recover_json,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "tor-proposal",
    version,
    author,
    about = "Chunk Terms-of-Reference documents and prepare proposal prompts",
    long_about = "Chunk Terms-of-Reference (ToR) documents under a model's token budget and \
    prepare the prompts of the chained proposal pipeline, without calling any model.\n\n\
    USAGE EXAMPLES:\n  \
      # Show how a ToR would be chunked\n  \
      tor-proposal chunk tor.txt\n\n  \
      # Write extraction prompts for a project\n  \
      tor-proposal prompts tor.txt --project project.json --out ./prompts\n\n  \
      # Recover and normalise a budget from raw model output\n  \
      tor-proposal normalize-budget response.txt --donor USAID"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model provider whose context window sets the chunk budget
    #[arg(long, global = true, value_name = "NAME")]
    provider: Option<String>,

    /// Max tokens per chunk (overrides the provider budget)
    #[arg(long, global = true)]
    max_tokens: Option<usize>,

    /// Overlap tokens between chunks
    #[arg(long, global = true)]
    overlap: Option<usize>,

    /// Directory with custom prompt templates
    #[arg(long, global = true, value_name = "DIR")]
    templates: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the chunk plan of a plain-text ToR
    Chunk {
        /// Plain-text ToR document
        file: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write one extraction prompt per chunk plus summary.json
    Prompts {
        /// Plain-text ToR document
        file: PathBuf,

        /// Project metadata as a JSON object
        #[arg(short, long, value_name = "FILE")]
        project: Option<PathBuf>,

        /// Output directory for generated prompts
        #[arg(short, long, value_name = "PATH")]
        out: Option<PathBuf>,

        /// Output filename pattern
        #[arg(long)]
        pattern: Option<String>,

        /// Overwrite existing files without keeping backups
        #[arg(long)]
        no_backup: bool,
    },

    /// Recover a budget from raw model output and recompute its totals
    NormalizeBudget {
        /// Raw structured-model response
        file: PathBuf,

        /// Donor whose indirect-cost rate and categories apply
        #[arg(long)]
        donor: Option<String>,

        /// Direct beneficiaries, for the cost-per-beneficiary rating
        #[arg(long)]
        beneficiaries: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    let mut builder = match &cli.config {
        Some(path) => ConfigBuilder::from_toml_file(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?,
        None => Config::builder(),
    };

    if let Some(provider) = &cli.provider {
        builder = builder.provider(Provider::from_name(provider));
    }
    if let Some(max_tokens) = cli.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }
    if let Some(overlap) = cli.overlap {
        builder = builder.overlap_tokens(overlap);
    }
    if let Some(dir) = &cli.templates {
        builder = builder.template_dir(dir);
    }

    match cli.command {
        Command::Chunk { file, json } => {
            let config = builder.build().context("Failed to build configuration")?;
            print_chunk_plan(&file, config, json)
        }
        Command::Prompts {
            file,
            project,
            out,
            pattern,
            no_backup,
        } => {
            if let Some(out) = out {
                builder = builder.output_dir(out);
            }
            if let Some(pattern) = pattern {
                builder = builder.output_pattern(pattern);
            }
            if no_backup {
                builder = builder.backup_existing(false);
            }
            let config = builder.build().context("Failed to build configuration")?;
            write_prompts(&file, project.as_deref(), config)
        }
        Command::NormalizeBudget {
            file,
            donor,
            beneficiaries,
        } => {
            let config = builder.build().context("Failed to build configuration")?;
            normalize_budget(&file, donor.as_deref(), beneficiaries, &config)
        }
    }
}

fn print_chunk_plan(file: &Path, config: Config, json: bool) -> anyhow::Result<()> {
    let text = PromptPipeline::read_document(file).context("Failed to read document")?;
    let pipeline = PromptPipeline::new(config).context("Failed to create pipeline")?;
    let plan = pipeline.plan(&text);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "Strategy: {}  |  Chunks: {}  |  Budget: {} tokens/chunk  |  Total: {} tokens\n",
        plan.strategy,
        plan.chunks.len(),
        plan.chunk_budget,
        plan.total_tokens()
    );
    println!(
        "{:<8} {:<28} {:>8} {:>8} {:>8}  {}",
        "INDEX", "SECTION", "TOKENS", "CHARS", "OVERLAP", "ID"
    );
    for chunk in &plan.chunks {
        println!(
            "{:<8} {:<28} {:>8} {:>8} {:>8}  {}",
            chunk.index.to_string(),
            truncate(&chunk.section, 28),
            chunk.tokens_estimated,
            chunk.char_count,
            chunk.overlap_len,
            chunk.chunk_id
        );
    }

    Ok(())
}

fn write_prompts(file: &Path, project: Option<&Path>, config: Config) -> anyhow::Result<()> {
    let text = PromptPipeline::read_document(file).context("Failed to read document")?;
    let project = match project {
        Some(path) => ProjectMetadata::from_json_file(path).context("Failed to read project metadata")?,
        None => ProjectMetadata::new(),
    };

    let stats = PromptPipeline::new(config)
        .context("Failed to create pipeline")?
        .run(&text, &project)
        .context("Prompt export failed")?;

    stats.print_summary();
    Ok(())
}

fn normalize_budget(
    file: &Path,
    donor: Option<&str>,
    beneficiaries: Option<u64>,
    config: &Config,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let value = recover_json(&raw).context("No budget JSON found in response")?;
    let mut budget = Budget::from_value(value).context("Response is not a budget object")?;

    budget.normalize(&config.budget_rates(donor));
    if let Some(direct) = beneficiaries {
        budget.assess_cost_effectiveness(direct, 0);
    }

    println!("{}", serde_json::to_string_pretty(&budget)?);
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{kept}…")
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("tor_proposal=info"),
        1 => EnvFilter::new("tor_proposal=debug"),
        _ => EnvFilter::new("tor_proposal=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();

    Ok(())
}
