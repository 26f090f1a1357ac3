use crate::{
    budget::{Budget, budget_schema},
    cancel::CancelToken,
    chunk::Chunk,
    client::{Capabilities, ClientError, Clients, ProseClient, StructuredClient, has_error_marker},
    config::Config,
    error::{Error, Result},
    progress::{Phase, Progress, ProgressSink, noop_sink},
    project::ProjectMetadata,
    prompt::{PromptBuilder, TaskKind},
    token::{HeuristicEstimator, Provider, TokenBudget, TokenEstimator},
};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Largest backoff exponent; keeps `base × 2^n` from overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one
    pub max_attempts: usize,
    /// Delay after the first failure; doubles after each further failure
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy; zero attempts is raised to one.
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            base_delay,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based):
    /// `base × 2^(attempt - 1)`.
    #[must_use]
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1))
            .unwrap_or(MAX_BACKOFF_EXPONENT)
            .min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Outcome of a run: one coherent artifact or one coherent error value of
/// the same shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipelineResult {
    /// Proposal narrative; an error value starts with the error marker
    Narrative(String),
    /// Structured budget; an error value has its `error` field set
    Budget(Budget),
}

impl PipelineResult {
    /// Returns true if this is the error shape.
    #[must_use]
    pub fn is_error(&self) -> bool {
        match self {
            Self::Narrative(text) => has_error_marker(text),
            Self::Budget(budget) => budget.is_error(),
        }
    }

    /// Returns the task this result answers.
    #[must_use]
    pub const fn task(&self) -> TaskKind {
        match self {
            Self::Narrative(_) => TaskKind::Narrative,
            Self::Budget(_) => TaskKind::Budget,
        }
    }

    /// Returns the narrative text, if this is a narrative.
    #[must_use]
    pub fn as_narrative(&self) -> Option<&str> {
        match self {
            Self::Narrative(text) => Some(text),
            Self::Budget(_) => None,
        }
    }

    /// Returns the budget, if this is a budget.
    #[must_use]
    pub const fn as_budget(&self) -> Option<&Budget> {
        match self {
            Self::Narrative(_) => None,
            Self::Budget(budget) => Some(budget),
        }
    }

    fn failure(task: TaskKind, message: &str, stats: &ProcessingStats) -> Self {
        match task {
            TaskKind::Narrative => Self::Narrative(format!(
                "Error generating narrative: {message}\n\n\
                The proposal narrative could not be completed. \
                Review the error above and try again."
            )),
            TaskKind::Budget => {
                let mut budget = Budget::failed(message);
                budget.processing_stats = serde_json::to_value(stats).ok();
                Self::Budget(budget)
            }
        }
    }
}

/// Statistics of the most recent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    /// Chunks handed to the run
    pub chunks_processed: usize,

    /// Sum of the chunks' estimated tokens
    pub total_tokens: usize,

    /// Wall time of the run
    #[serde(rename = "processing_time", serialize_with = "serialize_secs")]
    pub elapsed: Duration,

    /// Every failure observed, including retried ones
    pub errors: Vec<String>,

    /// Chunks replaced by a placeholder after failed extraction
    pub extraction_failures: usize,
}

impl ProcessingStats {
    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║            Generation Run Summary                     ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Chunks Processed:     {:>8}                        ║",
            self.chunks_processed
        );
        println!(
            "║ Total Tokens:         {:>8}                        ║",
            self.total_tokens
        );
        println!(
            "║ Extraction Failures:  {:>8}                        ║",
            self.extraction_failures
        );
        println!(
            "║ Errors Recorded:      {:>8}                        ║",
            self.errors.len()
        );
        println!(
            "║ Elapsed:              {:>8.2}s                       ║",
            self.elapsed.as_secs_f64()
        );
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// A failed step: the error that ended it and how many attempts were made.
#[derive(Debug)]
struct Failure {
    attempts: usize,
    last: Error,
}

impl From<Error> for Failure {
    fn from(last: Error) -> Self {
        Self { attempts: 0, last }
    }
}

/// Failures collected during one run.
#[derive(Debug, Default)]
struct RunLog {
    errors: Vec<String>,
    extraction_failures: usize,
}

impl RunLog {
    fn record(&mut self, message: String) {
        warn!("{}", message);
        self.errors.push(message);
    }
}

/// Turns chunks plus project metadata into one narrative or one budget.
///
/// Documents of one chunk are sent straight to the target client. Larger
/// documents go through an extraction phase (one prose call per chunk, in
/// index order) and a single synthesis call over the consolidated
/// extractions. Client failures never escape [`process`](Self::process):
/// every run ends in a success value or an error value of the same shape.
///
/// Statistics belong to one generator; concurrent runs need separate
/// generators.
pub struct ChainedPromptGenerator {
    config: Config,
    clients: Clients,
    prompts: PromptBuilder,
    estimator: Arc<dyn TokenEstimator>,
    progress: ProgressSink,
    cancel: CancelToken,
    stats: ProcessingStats,
}

impl ChainedPromptGenerator {
    /// Creates a generator.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt templates cannot be loaded.
    pub fn new(clients: Clients, config: &Config) -> Result<Self> {
        Ok(Self {
            prompts: PromptBuilder::new(config)?,
            config: config.clone(),
            clients,
            estimator: Arc::new(HeuristicEstimator),
            progress: noop_sink(),
            cancel: CancelToken::new(),
            stats: ProcessingStats::default(),
        })
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Sets the cancellation token checked at chunk boundaries.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the estimator used to check synthesis prompt size.
    #[must_use]
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Returns the capabilities of the configured clients.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::detect(&self.clients, self.config.donor_standards)
    }

    /// Returns the statistics of the most recent run.
    #[must_use]
    pub const fn stats(&self) -> &ProcessingStats {
        &self.stats
    }

    /// Runs the pipeline over `chunks`.
    ///
    /// `max_retries` is the total number of attempts for the single-chunk
    /// and synthesis calls. Statistics of the previous run are replaced.
    #[instrument(skip(self, chunks, project), fields(task = %task, chunks = chunks.len()))]
    pub fn process(
        &mut self,
        chunks: &[Chunk],
        project: &ProjectMetadata,
        task: TaskKind,
        max_retries: usize,
    ) -> PipelineResult {
        let start = Instant::now();
        let mut log = RunLog::default();
        let policy = RetryPolicy::new(max_retries, self.config.retry_base_delay);

        let outcome = if chunks.is_empty() {
            Err(format!("No chunks available to process ({task})"))
        } else {
            self.notify(Phase::Start {
                task,
                chunks: chunks.len(),
            });

            let result = if chunks.len() == 1 {
                self.run_single(&chunks[0], project, task, policy, &mut log)
            } else {
                self.run_chained(chunks, project, task, policy, &mut log)
            };

            result.map_err(|failure| describe_failure(task, &failure))
        };

        if let Err(message) = &outcome {
            log.record(message.clone());
        }

        let elapsed = start.elapsed();
        self.stats = ProcessingStats {
            chunks_processed: chunks.len(),
            total_tokens: chunks.iter().map(|c| c.tokens_estimated).sum(),
            elapsed,
            errors: log.errors,
            extraction_failures: log.extraction_failures,
        };

        if !chunks.is_empty() {
            self.notify(Phase::Complete {
                task,
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            });
        }

        match outcome {
            Ok(result) => {
                info!(
                    "✓ Generated {} from {} chunk(s) in {:.2}s",
                    task,
                    chunks.len(),
                    elapsed.as_secs_f64()
                );
                result
            }
            Err(message) => PipelineResult::failure(task, &message, &self.stats),
        }
    }

    fn run_single(
        &self,
        chunk: &Chunk,
        project: &ProjectMetadata,
        task: TaskKind,
        policy: RetryPolicy,
        log: &mut RunLog,
    ) -> std::result::Result<PipelineResult, Failure> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled.into());
        }

        debug!("Single chunk: sending the document directly");
        let prompt = self.prompts.build_direct_prompt(&chunk.content, project, task)?;
        self.synthesize(&prompt, project, task, policy, log)
    }

    fn run_chained(
        &self,
        chunks: &[Chunk],
        project: &ProjectMetadata,
        task: TaskKind,
        policy: RetryPolicy,
        log: &mut RunLog,
    ) -> std::result::Result<PipelineResult, Failure> {
        let extractions = self.extract_all(chunks, project, log)?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled.into());
        }

        let consolidated = consolidate(chunks, &extractions);
        let prompt = self
            .prompts
            .build_synthesis_prompt(&consolidated, project, task)?;
        self.synthesize(&prompt, project, task, policy, log)
    }

    /// Extraction phase: one summary per chunk, in order. A failed chunk
    /// becomes a placeholder; only cancellation stops the phase.
    fn extract_all(
        &self,
        chunks: &[Chunk],
        project: &ProjectMetadata,
        log: &mut RunLog,
    ) -> std::result::Result<Vec<String>, Failure> {
        let total = chunks.len();
        let policy = self.config.extraction_retry_policy();
        let mut extractions = Vec::with_capacity(total);

        if self.clients.prose().is_none() {
            warn!("No prose client configured; raw chunk text stands in for extractions");
        }

        for (i, chunk) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled.into());
            }

            let summary = match self.clients.prose() {
                None => truncate_chars(chunk.body(), self.config.extraction_fallback_chars),
                Some(client) => {
                    debug!("Extracting chunk {} ({})", chunk.index, chunk.section);
                    let label = format!("Extraction of chunk {}", chunk.index);
                    let result = self
                        .prompts
                        .build_extraction_prompt(chunk, total, project)
                        .map_err(Failure::from)
                        .and_then(|prompt| {
                            self.with_retry(policy, &label, log, || call_prose(client.as_ref(), &prompt))
                        });

                    match result {
                        Ok(summary) => summary,
                        Err(failure) if failure.last.is_cancelled() => return Err(failure),
                        Err(failure) => {
                            log.extraction_failures += 1;
                            format!(
                                "[Chunk {} ({}) could not be processed: {}]",
                                chunk.index, chunk.section, failure.last
                            )
                        }
                    }
                }
            };

            extractions.push(summary);
            self.notify(Phase::Extraction {
                current: i + 1,
                total,
            });
        }

        Ok(extractions)
    }

    /// The single final call, with retries.
    fn synthesize(
        &self,
        prompt: &str,
        project: &ProjectMetadata,
        task: TaskKind,
        policy: RetryPolicy,
        log: &mut RunLog,
    ) -> std::result::Result<PipelineResult, Failure> {
        self.check_prompt_size(prompt, task);
        self.notify(Phase::Synthesis { task });

        match task {
            TaskKind::Narrative => {
                let client = self
                    .clients
                    .prose()
                    .ok_or(Error::MissingCapability { capability: "prose" })?;
                let text = self.with_retry(policy, "Narrative synthesis", log, || {
                    call_prose(client.as_ref(), prompt)
                })?;
                Ok(PipelineResult::Narrative(text))
            }
            TaskKind::Budget => {
                let client = self
                    .clients
                    .structured()
                    .ok_or(Error::MissingCapability { capability: "structured" })?;
                let schema = budget_schema();
                let rates = self.config.budget_rates(project.donor().as_deref());
                let (direct, indirect) = (project.beneficiaries_direct(), project.beneficiaries_indirect());

                let budget = self.with_retry(policy, "Budget synthesis", log, || {
                    let mut budget = Budget::from_value(call_structured(client.as_ref(), prompt, &schema)?)?;
                    budget.normalize(&rates);
                    budget.assess_cost_effectiveness(direct, indirect);
                    Ok(budget)
                })?;
                Ok(PipelineResult::Budget(budget))
            }
        }
    }

    /// Runs `op` up to `policy.max_attempts` times, sleeping
    /// `base × 2^(n-1)` after failed attempt `n`. Every failure is logged.
    fn with_retry<T>(
        &self,
        policy: RetryPolicy,
        label: &str,
        log: &mut RunLog,
        mut op: impl FnMut() -> Result<T>,
    ) -> std::result::Result<T, Failure> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    log.record(format!(
                        "{label} attempt {attempt}/{} failed: {error}",
                        policy.max_attempts
                    ));

                    if attempt >= policy.max_attempts {
                        return Err(Failure {
                            attempts: attempt,
                            last: error,
                        });
                    }

                    let delay = policy.backoff(attempt);
                    info!("Retrying {} in {:.1}s", label, delay.as_secs_f64());
                    if !self.cancel.sleep(delay) {
                        return Err(Failure {
                            attempts: attempt,
                            last: Error::Cancelled,
                        });
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Provider and usable prompt tokens of the client that receives the
    /// synthesis call for `task`.
    ///
    /// A client that names its provider wins. Otherwise narratives use the
    /// configured provider and budgets the structured default.
    fn synthesis_budget(&self, task: TaskKind) -> (Provider, usize) {
        let provider = match task {
            TaskKind::Narrative => self
                .clients
                .prose()
                .and_then(|client| client.provider())
                .unwrap_or(self.config.provider),
            TaskKind::Budget => self
                .clients
                .structured()
                .and_then(|client| client.provider())
                .unwrap_or(Provider::Sonnet),
        };
        let budget = TokenBudget::for_provider(provider, self.config.prompt_overhead);
        (provider, budget.usable_tokens())
    }

    fn check_prompt_size(&self, prompt: &str, task: TaskKind) {
        let tokens = self.estimator.estimate(prompt);
        let (provider, limit) = self.synthesis_budget(task);
        if tokens > limit {
            warn!(
                "Synthesis prompt is ~{} tokens, over the {} token budget of {}",
                tokens, limit, provider
            );
        } else {
            debug!("Synthesis prompt is ~{} of {} tokens", tokens, limit);
        }
    }

    fn notify(&self, phase: Phase) {
        (self.progress)(&Progress::new(phase));
    }
}

fn call_prose(client: &dyn ProseClient, prompt: &str) -> Result<String> {
    let text = client.generate(prompt)?;

    if has_error_marker(&text) {
        let first_line = text.trim().lines().next().unwrap_or_default();
        return Err(ClientError::InvalidResponse(format!(
            "{} reported: {}",
            client.name(),
            truncate_chars(first_line, 200)
        ))
        .into());
    }

    if text.trim().is_empty() {
        return Err(ClientError::InvalidResponse(format!("{} returned no text", client.name())).into());
    }

    Ok(text)
}

fn call_structured(client: &dyn StructuredClient, prompt: &str, schema: &Value) -> Result<Value> {
    let value = client.generate_json(prompt, schema)?;

    match value.get("error") {
        None | Some(Value::Null) => Ok(value),
        Some(error) => Err(ClientError::InvalidResponse(format!(
            "{} returned an error object: {}",
            client.name(),
            error.as_str().map_or_else(|| error.to_string(), str::to_string)
        ))
        .into()),
    }
}

/// Joins extractions in chunk order under one header per chunk.
fn consolidate(chunks: &[Chunk], extractions: &[String]) -> String {
    chunks
        .iter()
        .zip(extractions)
        .map(|(chunk, summary)| {
            format!("=== Section {}: {} ===\n{}", chunk.index, chunk.section, summary.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn describe_failure(task: TaskKind, failure: &Failure) -> String {
    if failure.last.is_cancelled() {
        return format!("{task} generation cancelled");
    }
    if failure.attempts == 0 {
        return format!("{task} generation failed: {}", failure.last);
    }
    format!(
        "{task} generation failed after {} attempt(s): {}",
        failure.attempts, failure.last
    )
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkIndex, chunk_id};
    use crate::client::mock::{ScriptedProseClient, ScriptedStructuredClient};
    use std::sync::Mutex;

    const BUDGET_JSON: &str = r#"Here is the budget:
```json
{"currency": "USD", "items": [
  {"category": "personnel", "description": "Field technician", "quantity": 2, "unit_cost": 900, "months": 12},
  {"category": "equipment", "description": "Water test kits", "quantity": 4, "unit_cost": 150, "total_cost": 600}
], "financial_totals": {"subtotal": 1}}
```"#;

    fn chunk(index: ChunkIndex, position: usize, section: &str, content: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            section: section.to_string(),
            index,
            position,
            tokens_estimated: content.len() / 4,
            chunk_id: chunk_id(content),
            word_count: content.split_whitespace().count(),
            char_count: content.chars().count(),
            overlap_len: 0,
        }
    }

    fn three_chunks() -> Vec<Chunk> {
        vec![
            chunk(ChunkIndex::major(1), 0, "background", "Background text about rural water access in Jocotán."),
            chunk(ChunkIndex::major(2), 1, "objectives", "Objectives text about reducing diarrheal disease by half."),
            chunk(ChunkIndex::major(3), 2, "activities", "Activities text about installing forty household filters."),
        ]
    }

    fn project() -> ProjectMetadata {
        ProjectMetadata::new()
            .with("title", "Agua segura")
            .with("donor", "USAID")
    }

    fn config() -> Config {
        Config::builder()
            .retry_base_delay(Duration::ZERO)
            .build()
            .unwrap()
    }

    fn generator(clients: Clients) -> ChainedPromptGenerator {
        ChainedPromptGenerator::new(clients, &config()).unwrap()
    }

    fn recorder() -> (ProgressSink, Arc<Mutex<Vec<Progress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: ProgressSink = Arc::new(move |p: &Progress| sink_events.lock().unwrap().push(p.clone()));
        (sink, events)
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert!(policy.backoff(usize::MAX) > Duration::ZERO);
    }

    #[test]
    fn test_empty_narrative_returns_error_string_without_calls() {
        let prose = Arc::new(ScriptedProseClient::new("unused"));
        let mut generator = generator(Clients::new().with_prose(prose.clone()));

        let result = generator.process(&[], &project(), TaskKind::Narrative, 3);

        assert!(result.is_error());
        assert!(result.as_narrative().unwrap().starts_with("Error generating narrative"));
        assert_eq!(prose.call_count(), 0);
        assert_eq!(generator.stats().errors.len(), 1);
        assert_eq!(generator.stats().chunks_processed, 0);
    }

    #[test]
    fn test_empty_budget_returns_error_budget() {
        let structured = Arc::new(ScriptedStructuredClient::new(BUDGET_JSON));
        let mut generator = generator(Clients::new().with_structured(structured.clone()));

        let result = generator.process(&[], &project(), TaskKind::Budget, 3);
        let budget = result.as_budget().unwrap();

        assert!(budget.is_error());
        assert!(budget.items.is_empty());
        assert_eq!(budget.total(), 0.0);
        assert!(budget.processing_stats.is_some());
        assert_eq!(structured.call_count(), 0);
    }

    #[test]
    fn test_single_chunk_goes_direct() {
        let prose = Arc::new(ScriptedProseClient::new("Narrativa completa."));
        let mut generator = generator(Clients::new().with_prose(prose.clone()));
        let chunks = vec![chunk(ChunkIndex::major(0), 0, "complete", "Short ToR about safe water.")];

        let result = generator.process(&chunks, &project(), TaskKind::Narrative, 3);

        assert_eq!(result, PipelineResult::Narrative("Narrativa completa.".to_string()));
        assert_eq!(prose.call_count(), 1);
        let prompt = &prose.prompts()[0];
        assert!(prompt.contains("Short ToR about safe water."));
        assert!(prompt.contains("TÉRMINOS DE REFERENCIA"));
    }

    #[test]
    fn test_single_chunk_retries_then_succeeds() {
        let prose = Arc::new(
            ScriptedProseClient::new("Narrativa.")
                .then_err(ClientError::Timeout("deepseek".to_string()))
                .then_ok("Error: rate limit exceeded"),
        );
        let mut generator = generator(Clients::new().with_prose(prose.clone()));
        let chunks = vec![chunk(ChunkIndex::major(0), 0, "complete", "Short ToR.")];

        let result = generator.process(&chunks, &project(), TaskKind::Narrative, 3);

        assert!(!result.is_error());
        assert_eq!(prose.call_count(), 3);
        assert_eq!(generator.stats().errors.len(), 2);
        assert!(generator.stats().errors[1].contains("rate limit exceeded"));
    }

    #[test]
    fn test_single_chunk_exhaustion_reports_context() {
        let prose = Arc::new(ScriptedProseClient::new("unused").fail_when_contains("Short ToR"));
        let mut generator = generator(Clients::new().with_prose(prose.clone()));
        let chunks = vec![chunk(ChunkIndex::major(0), 0, "complete", "Short ToR.")];

        let result = generator.process(&chunks, &project(), TaskKind::Narrative, 2);
        let text = result.as_narrative().unwrap();

        assert!(result.is_error());
        assert!(text.contains("narrative generation failed after 2 attempt(s)"));
        assert!(text.contains("scripted failure"));
        assert_eq!(prose.call_count(), 2);
    }

    #[test]
    fn test_chained_budget() {
        let prose = Arc::new(ScriptedProseClient::new("Resumen del fragmento."));
        let structured = Arc::new(ScriptedStructuredClient::new(BUDGET_JSON));
        let clients = Clients::new()
            .with_prose(prose.clone())
            .with_structured(structured.clone());
        let mut generator = generator(clients);

        let result = generator.process(&three_chunks(), &project(), TaskKind::Budget, 3);
        let budget = result.as_budget().unwrap();

        assert!(!budget.is_error());
        assert_eq!(prose.call_count(), 3);
        assert_eq!(structured.call_count(), 1);
        assert!((budget.financial_totals.subtotal - 22_200.0).abs() < 1e-9);
        // USAID indirect rate
        let administrative = budget.financial_totals.administrative_cost.unwrap();
        assert!((administrative - 2_220.0).abs() < 1e-6);
        assert!(budget.is_consistent());

        let prompt = &structured.prompts()[0];
        let first = prompt.find("=== Section 1: background ===").unwrap();
        let second = prompt.find("=== Section 2: objectives ===").unwrap();
        let third = prompt.find("=== Section 3: activities ===").unwrap();
        assert!(first < second && second < third);
        assert_eq!(structured.schemas()[0], budget_schema());
        assert_eq!(generator.stats().chunks_processed, 3);
    }

    #[test]
    fn test_budget_checks_donor_categories_and_beneficiaries() {
        let clients = Clients::new()
            .with_prose(Arc::new(ScriptedProseClient::new("Resumen.")))
            .with_structured(Arc::new(ScriptedStructuredClient::new(BUDGET_JSON)));
        let project = project()
            .with("beneficiaries_direct", "120 familias")
            .with("beneficiaries_indirect", 480);

        let result = generator(clients).process(&three_chunks(), &project, TaskKind::Budget, 3);
        let budget = result.as_budget().unwrap();

        let note = budget
            .compliance_notes
            .iter()
            .find(|note| note.starts_with("Missing required budget categories"))
            .unwrap();
        assert!(note.contains("Travel"));
        assert!(!note.contains("Equipment"));

        let cost = budget.cost_effectiveness.unwrap();
        assert!((cost.cost_per_direct_beneficiary - budget.total() / 120.0).abs() < 1e-9);
        assert!((cost.cost_per_total_beneficiary - budget.total() / 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_budget_without_beneficiaries_has_no_cost_rating() {
        let clients = Clients::new()
            .with_prose(Arc::new(ScriptedProseClient::new("Resumen.")))
            .with_structured(Arc::new(ScriptedStructuredClient::new(BUDGET_JSON)));

        let result = generator(clients).process(&three_chunks(), &project(), TaskKind::Budget, 3);

        assert!(result.as_budget().unwrap().cost_effectiveness.is_none());
    }

    #[test]
    fn test_synthesis_budget_follows_client_provider() {
        let config = config();
        let overhead = config.prompt_overhead;
        let usable = |provider| TokenBudget::for_provider(provider, overhead).usable_tokens();

        let unnamed = generator(
            Clients::new()
                .with_prose(Arc::new(ScriptedProseClient::new("Resumen.")))
                .with_structured(Arc::new(ScriptedStructuredClient::new(BUDGET_JSON))),
        );
        assert_eq!(unnamed.synthesis_budget(TaskKind::Narrative), (config.provider, usable(config.provider)));
        assert_eq!(unnamed.synthesis_budget(TaskKind::Budget), (Provider::Sonnet, usable(Provider::Sonnet)));

        let named = generator(
            Clients::new()
                .with_prose(Arc::new(ScriptedProseClient::new("Resumen.").with_provider(Provider::Sonnet)))
                .with_structured(Arc::new(
                    ScriptedStructuredClient::new(BUDGET_JSON).with_provider(Provider::DeepSeek),
                )),
        );
        assert_eq!(named.synthesis_budget(TaskKind::Narrative), (Provider::Sonnet, usable(Provider::Sonnet)));
        assert_eq!(named.synthesis_budget(TaskKind::Budget), (Provider::DeepSeek, usable(Provider::DeepSeek)));
        assert!(usable(Provider::Sonnet) > usable(Provider::DeepSeek));
    }

    #[test]
    fn test_partial_extraction_failure() {
        let prose = Arc::new(ScriptedProseClient::new("Resumen.").fail_when_contains("diarrheal disease"));
        let mut generator = generator(Clients::new().with_prose(prose.clone()));

        let result = generator.process(&three_chunks(), &project(), TaskKind::Narrative, 3);

        assert!(!result.is_error());
        assert_eq!(generator.stats().extraction_failures, 1);

        let synthesis_prompt = prose.prompts().last().unwrap().clone();
        assert!(synthesis_prompt.contains("[Chunk 2 (objectives) could not be processed: LLM error: scripted failure]"));
        assert_eq!(synthesis_prompt.matches("Resumen.").count(), 2);
    }

    #[test]
    fn test_synthesis_fails_twice_then_succeeds() {
        let prose = Arc::new(
            ScriptedProseClient::new("Narrativa final.")
                .then_ok("Resumen 1.")
                .then_ok("Resumen 2.")
                .then_ok("Resumen 3.")
                .then_err(ClientError::Communication("connection reset".to_string()))
                .then_err(ClientError::ErrorResponse {
                    status: 503,
                    message: "overloaded".to_string(),
                }),
        );
        let mut generator = generator(Clients::new().with_prose(prose.clone()));

        let result = generator.process(&three_chunks(), &project(), TaskKind::Narrative, 3);

        assert_eq!(result, PipelineResult::Narrative("Narrativa final.".to_string()));
        assert_eq!(prose.call_count(), 6);
        let errors = &generator.stats().errors;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("connection reset"));
        assert!(errors[1].contains("overloaded"));
    }

    #[test]
    fn test_progress_order() {
        let (sink, events) = recorder();
        let prose = Arc::new(ScriptedProseClient::new("Resumen."));
        let mut generator = generator(Clients::new().with_prose(prose)).with_progress(sink);

        generator.process(&three_chunks(), &project(), TaskKind::Narrative, 3);

        let events = events.lock().unwrap();
        let phases: Vec<Phase> = events.iter().map(|p| p.phase).collect();
        assert_eq!(phases.len(), 6);
        assert!(matches!(phases[0], Phase::Start { chunks: 3, .. }));
        for (i, phase) in phases[1..4].iter().enumerate() {
            assert_eq!(*phase, Phase::Extraction { current: i + 1, total: 3 });
        }
        assert_eq!(phases[4], Phase::Synthesis { task: TaskKind::Narrative });
        assert!(matches!(phases[5], Phase::Complete { .. }));
        assert!(phases.windows(2).all(|w| w[0].index() <= w[1].index()));
    }

    #[test]
    fn test_fallback_without_prose_client() {
        let structured = Arc::new(ScriptedStructuredClient::new(BUDGET_JSON));
        let config = Config::builder()
            .retry_base_delay(Duration::ZERO)
            .extraction_fallback_chars(20)
            .build()
            .unwrap();
        let mut generator =
            ChainedPromptGenerator::new(Clients::new().with_structured(structured.clone()), &config).unwrap();

        let result = generator.process(&three_chunks(), &project(), TaskKind::Budget, 3);

        assert!(!result.is_error());
        let prompt = &structured.prompts()[0];
        assert!(prompt.contains("Background text abou..."));
        assert!(!prompt.contains("rural water access"));
        assert_eq!(generator.stats().extraction_failures, 0);
    }

    #[test]
    fn test_missing_structured_client() {
        let prose = Arc::new(ScriptedProseClient::new("Resumen."));
        let mut generator = generator(Clients::new().with_prose(prose));

        let result = generator.process(&three_chunks(), &project(), TaskKind::Budget, 3);
        let budget = result.as_budget().unwrap();

        assert!(budget.is_error());
        assert!(budget.error.as_deref().unwrap().contains("No structured client configured"));
    }

    #[test]
    fn test_structured_error_field_is_retried() {
        let structured = Arc::new(
            ScriptedStructuredClient::new(BUDGET_JSON)
                .then_raw(r#"{"error": "schema violation"}"#)
                .then_raw("not json at all"),
        );
        let mut generator = generator(Clients::new().with_structured(structured.clone()));
        let chunks = vec![chunk(ChunkIndex::major(0), 0, "complete", "Short ToR.")];

        let result = generator.process(&chunks, &project(), TaskKind::Budget, 3);

        assert!(!result.is_error());
        assert_eq!(structured.call_count(), 3);
        let errors = &generator.stats().errors;
        assert!(errors[0].contains("schema violation"));
        assert!(errors[1].contains("could not parse JSON"));
    }

    #[test]
    fn test_cancelled_before_start() {
        let prose = Arc::new(ScriptedProseClient::new("Resumen."));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut generator = generator(Clients::new().with_prose(prose.clone())).with_cancel_token(cancel);

        let result = generator.process(&three_chunks(), &project(), TaskKind::Narrative, 3);

        assert!(result.is_error());
        assert!(result.as_narrative().unwrap().contains("cancelled"));
        assert_eq!(prose.call_count(), 0);
    }

    #[test]
    fn test_cancelled_at_chunk_boundary() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let sink: ProgressSink = Arc::new(move |p: &Progress| {
            if matches!(p.phase, Phase::Extraction { current: 1, .. }) {
                trigger.cancel();
            }
        });
        let prose = Arc::new(ScriptedProseClient::new("Resumen."));
        let mut generator = generator(Clients::new().with_prose(prose.clone()))
            .with_progress(sink)
            .with_cancel_token(cancel);

        let result = generator.process(&three_chunks(), &project(), TaskKind::Narrative, 3);

        assert!(result.is_error());
        assert_eq!(prose.call_count(), 1);
    }

    #[test]
    fn test_stats_reset_between_runs() {
        let prose = Arc::new(
            ScriptedProseClient::new("Narrativa.").then_err(ClientError::Other("boom".to_string())),
        );
        let mut generator = generator(Clients::new().with_prose(prose));
        let chunks = vec![chunk(ChunkIndex::major(0), 0, "complete", "Short ToR.")];

        generator.process(&chunks, &project(), TaskKind::Narrative, 3);
        assert_eq!(generator.stats().errors.len(), 1);

        generator.process(&chunks, &project(), TaskKind::Narrative, 3);
        assert!(generator.stats().errors.is_empty());
        assert_eq!(generator.stats().chunks_processed, 1);
    }

    #[test]
    fn test_process_is_total() {
        let cases: [(usize, Clients); 3] = [
            (0, Clients::new()),
            (1, Clients::new().with_prose(Arc::new(ScriptedProseClient::new("x").fail_when_contains("")))),
            (
                3,
                Clients::new()
                    .with_prose(Arc::new(ScriptedProseClient::new("Error")))
                    .with_structured(Arc::new(ScriptedStructuredClient::new("{}}"))),
            ),
        ];

        for (count, clients) in cases {
            let mut generator = generator(clients);
            let chunks: Vec<Chunk> = three_chunks().into_iter().take(count).collect();
            for task in TaskKind::all() {
                let result = generator.process(&chunks, &project(), *task, 2);
                assert_eq!(result.task(), *task);
            }
        }
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("ñandú", 2), "ña...");
    }
}
