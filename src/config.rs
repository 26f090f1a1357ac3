use crate::budget::BudgetRates;
use crate::donor::DonorStandards;
use crate::error::{Error, Result};
use crate::orchestrator::RetryPolicy;
use crate::prompt::{
    BUDGET_TEMPLATE, EXTRACTION_TEMPLATE, NARRATIVE_TEMPLATE, PROJECT_TEMPLATE, required_variables,
};
use crate::template_validator::TemplateValidator;
use crate::token::{DEFAULT_PROMPT_OVERHEAD, Provider, TokenBudget};
use crate::validator::DEFAULT_MIN_CHUNK_CHARS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_OVERLAP_TOKENS: usize = 150;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_EXTRACTION_ATTEMPTS: usize = 1;
const DEFAULT_EXTRACTION_FALLBACK_CHARS: usize = 2_000;
const DEFAULT_ADMINISTRATIVE_RATE: f64 = 0.08;
const DEFAULT_CONTINGENCY_RATE: f64 = 0.05;
const DEFAULT_OUTPUT_PATTERN: &str = "prompt_{index:03}.{ext}";

/// Configuration for the tor-proposal pipeline.
///
/// Use [`Config::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Provider whose context window sizes the chunks
    pub provider: Provider,

    /// Tokens reserved for prompt instructions and schema
    pub prompt_overhead: usize,

    /// Explicit chunk budget, overriding the provider-derived one
    pub max_tokens: Option<usize>,

    /// Overlap tokens between chunks for context continuity
    pub overlap_tokens: usize,

    /// Total attempts for single-chunk and synthesis calls
    pub max_retries: usize,

    /// Delay before the second attempt; doubles afterwards
    pub retry_base_delay: Duration,

    /// Attempts per chunk in the extraction phase
    pub extraction_attempts: usize,

    /// Characters of raw chunk text used as its summary when no prose
    /// client is configured
    pub extraction_fallback_chars: usize,

    /// Minimum chunk body length kept by the validator
    pub min_chunk_chars: usize,

    /// Administrative rate override; defaults to the donor's indirect rate
    pub administrative_rate: Option<f64>,

    /// Contingency as a fraction of the budget subtotal
    pub contingency_rate: f64,

    /// Directory of custom prompt templates
    pub template_dir: Option<PathBuf>,

    /// Output directory for dry-run prompts
    pub output_dir: PathBuf,

    /// Output filename pattern (supports {index}, {index:03}, {ext})
    pub output_pattern: String,

    /// Create backups of existing files
    pub backup_existing: bool,

    /// Inject donor standards into prompts and budget rates
    pub donor_standards: bool,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use tor_proposal::Config;
    ///
    /// let config = Config::builder()
    ///     .provider("sonnet".parse().unwrap())
    ///     .overlap_tokens(200)
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Token limits are invalid
    /// - Retry or rate settings are out of range
    /// - Output pattern is invalid
    /// - The template directory is missing or holds an invalid template
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == Some(0) {
            return Err(Error::config("max_tokens must be greater than 0"));
        }

        let chunk_tokens = self.effective_chunk_tokens();
        if self.overlap_tokens >= chunk_tokens {
            return Err(Error::config(format!(
                "overlap_tokens ({}) must be less than the chunk budget ({})",
                self.overlap_tokens, chunk_tokens
            )));
        }

        if self.max_retries == 0 {
            return Err(Error::config("max_retries must be at least 1"));
        }

        if self.extraction_attempts == 0 {
            return Err(Error::config("extraction_attempts must be at least 1"));
        }

        if self.min_chunk_chars == 0 {
            return Err(Error::config("min_chunk_chars must be at least 1"));
        }

        if let Some(rate) = self.administrative_rate {
            check_rate("administrative_rate", rate)?;
        }
        check_rate("contingency_rate", self.contingency_rate)?;

        if !self.output_pattern.contains("{index") {
            return Err(Error::config(format!(
                "Invalid output pattern '{}': must contain {{index}} or {{index:03}} placeholder",
                self.output_pattern
            )));
        }

        if !self.output_pattern.contains("{ext}") {
            return Err(Error::config(format!(
                "Invalid output pattern '{}': must contain {{ext}} placeholder",
                self.output_pattern
            )));
        }

        if let Some(ref dir) = self.template_dir {
            Self::validate_template_dir(dir)?;
        }

        Ok(())
    }

    fn validate_template_dir(dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "Template directory does not exist: {}",
                dir.display()
            )));
        }

        for name in [PROJECT_TEMPLATE, EXTRACTION_TEMPLATE, NARRATIVE_TEMPLATE, BUDGET_TEMPLATE] {
            let path = dir.join(name);
            if path.exists() {
                TemplateValidator::validate_template(&path, required_variables(name))?;
            }
        }

        Ok(())
    }

    /// Returns the token budget of the configured provider.
    #[must_use]
    pub fn token_budget(&self) -> TokenBudget {
        TokenBudget::for_provider(self.provider, self.prompt_overhead)
    }

    /// Returns the chunk budget: the explicit override, or the provider's
    /// content budget.
    #[must_use]
    pub fn effective_chunk_tokens(&self) -> usize {
        self.max_tokens
            .unwrap_or_else(|| self.token_budget().max_content_tokens())
    }

    /// Returns the retry policy for single-chunk and synthesis calls.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay)
    }

    /// Returns the retry policy for per-chunk extraction calls.
    #[must_use]
    pub const fn extraction_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.extraction_attempts, self.retry_base_delay)
    }

    /// Returns the rates used to normalize a budget for the given donor.
    ///
    /// The administrative rate is the explicit override, else the donor's
    /// indirect-cost ceiling, else 8%. Donor standards also supply the
    /// categories a compliant budget is expected to carry.
    #[must_use]
    pub fn budget_rates(&self, donor: Option<&str>) -> BudgetRates {
        let standards = self.donor_standards.then(|| DonorStandards::for_donor(donor));
        let indirect_limit = standards.as_ref().and_then(|s| s.indirect_rate);

        BudgetRates {
            administrative: self
                .administrative_rate
                .or(indirect_limit)
                .unwrap_or(DEFAULT_ADMINISTRATIVE_RATE),
            contingency: self.contingency_rate,
            indirect_limit,
            required_categories: standards.map(|s| s.budget_categories).unwrap_or_default(),
        }
    }
}

fn check_rate(name: &str, rate: f64) -> Result<()> {
    if (0.0..1.0).contains(&rate) {
        Ok(())
    } else {
        Err(Error::config(format!("{name} must be in [0, 1), got {rate}")))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            prompt_overhead: DEFAULT_PROMPT_OVERHEAD,
            max_tokens: None,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            extraction_attempts: DEFAULT_EXTRACTION_ATTEMPTS,
            extraction_fallback_chars: DEFAULT_EXTRACTION_FALLBACK_CHARS,
            min_chunk_chars: DEFAULT_MIN_CHUNK_CHARS,
            administrative_rate: None,
            contingency_rate: DEFAULT_CONTINGENCY_RATE,
            template_dir: None,
            output_dir: PathBuf::from("out"),
            output_pattern: DEFAULT_OUTPUT_PATTERN.to_string(),
            backup_existing: true,
            donor_standards: true,
        }
    }
}

/// Keys accepted in a TOML configuration file. All are optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    provider: Option<Provider>,
    prompt_overhead: Option<usize>,
    max_tokens: Option<usize>,
    overlap_tokens: Option<usize>,
    max_retries: Option<usize>,
    retry_base_delay_ms: Option<u64>,
    extraction_attempts: Option<usize>,
    extraction_fallback_chars: Option<usize>,
    min_chunk_chars: Option<usize>,
    administrative_rate: Option<f64>,
    contingency_rate: Option<f64>,
    template_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    output_pattern: Option<String>,
    backup_existing: Option<bool>,
    donor_standards: Option<bool>,
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    provider: Option<Provider>,
    prompt_overhead: Option<usize>,
    max_tokens: Option<usize>,
    overlap_tokens: Option<usize>,
    max_retries: Option<usize>,
    retry_base_delay: Option<Duration>,
    extraction_attempts: Option<usize>,
    extraction_fallback_chars: Option<usize>,
    min_chunk_chars: Option<usize>,
    administrative_rate: Option<f64>,
    contingency_rate: Option<f64>,
    template_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    output_pattern: Option<String>,
    backup_existing: Option<bool>,
    donor_standards: Option<bool>,
}

impl ConfigBuilder {
    /// Creates a builder preloaded from TOML text.
    ///
    /// Relative `template_dir` and `output_dir` paths are kept as written.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has unknown keys.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(toml)?;

        Ok(Self {
            provider: file.provider,
            prompt_overhead: file.prompt_overhead,
            max_tokens: file.max_tokens,
            overlap_tokens: file.overlap_tokens,
            max_retries: file.max_retries,
            retry_base_delay: file.retry_base_delay_ms.map(Duration::from_millis),
            extraction_attempts: file.extraction_attempts,
            extraction_fallback_chars: file.extraction_fallback_chars,
            min_chunk_chars: file.min_chunk_chars,
            administrative_rate: file.administrative_rate,
            contingency_rate: file.contingency_rate,
            template_dir: file.template_dir,
            output_dir: file.output_dir,
            output_pattern: file.output_pattern,
            backup_existing: file.backup_existing,
            donor_standards: file.donor_standards,
        })
    }

    /// Creates a builder preloaded from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let toml = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&toml)
    }

    /// Sets the provider.
    #[must_use]
    pub fn provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the prompt overhead in tokens.
    #[must_use]
    pub fn prompt_overhead(mut self, tokens: usize) -> Self {
        self.prompt_overhead = Some(tokens);
        self
    }

    /// Sets an explicit chunk budget.
    #[must_use]
    pub fn max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the overlap tokens between chunks.
    #[must_use]
    pub fn overlap_tokens(mut self, tokens: usize) -> Self {
        self.overlap_tokens = Some(tokens);
        self
    }

    /// Sets the total attempts for synthesis calls.
    #[must_use]
    pub fn max_retries(mut self, attempts: usize) -> Self {
        self.max_retries = Some(attempts);
        self
    }

    /// Sets the base backoff delay.
    #[must_use]
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    /// Sets the attempts per chunk extraction.
    #[must_use]
    pub fn extraction_attempts(mut self, attempts: usize) -> Self {
        self.extraction_attempts = Some(attempts);
        self
    }

    /// Sets how much raw text stands in for a summary without a prose client.
    #[must_use]
    pub fn extraction_fallback_chars(mut self, chars: usize) -> Self {
        self.extraction_fallback_chars = Some(chars);
        self
    }

    /// Sets the minimum chunk length.
    #[must_use]
    pub fn min_chunk_chars(mut self, chars: usize) -> Self {
        self.min_chunk_chars = Some(chars);
        self
    }

    /// Overrides the administrative rate.
    #[must_use]
    pub fn administrative_rate(mut self, rate: f64) -> Self {
        self.administrative_rate = Some(rate);
        self
    }

    /// Sets the contingency rate.
    #[must_use]
    pub fn contingency_rate(mut self, rate: f64) -> Self {
        self.contingency_rate = Some(rate);
        self
    }

    /// Sets the directory of custom prompt templates.
    ///
    /// Any of `extraction.tera`, `narrative.tera`, `budget.tera` and
    /// `project.tera` found there replaces the built-in template.
    #[must_use]
    pub fn template_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(path.into());
        self
    }

    /// Sets the output directory for generated files.
    #[must_use]
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Sets the output filename pattern.
    ///
    /// Pattern must contain `{index}` and `{ext}` placeholders.
    #[must_use]
    pub fn output_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.output_pattern = Some(pattern.into());
        self
    }

    /// Enables or disables backup creation.
    #[must_use]
    pub fn backup_existing(mut self, enabled: bool) -> Self {
        self.backup_existing = Some(enabled);
        self
    }

    /// Enables or disables donor standards.
    #[must_use]
    pub fn donor_standards(mut self, enabled: bool) -> Self {
        self.donor_standards = Some(enabled);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let defaults = Config::default();
        let config = Config {
            provider: self.provider.unwrap_or(defaults.provider),
            prompt_overhead: self.prompt_overhead.unwrap_or(defaults.prompt_overhead),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            overlap_tokens: self.overlap_tokens.unwrap_or(defaults.overlap_tokens),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_base_delay: self.retry_base_delay.unwrap_or(defaults.retry_base_delay),
            extraction_attempts: self
                .extraction_attempts
                .unwrap_or(defaults.extraction_attempts),
            extraction_fallback_chars: self
                .extraction_fallback_chars
                .unwrap_or(defaults.extraction_fallback_chars),
            min_chunk_chars: self.min_chunk_chars.unwrap_or(defaults.min_chunk_chars),
            administrative_rate: self.administrative_rate.or(defaults.administrative_rate),
            contingency_rate: self.contingency_rate.unwrap_or(defaults.contingency_rate),
            template_dir: self.template_dir,
            output_dir: self.output_dir.unwrap_or(defaults.output_dir),
            output_pattern: self.output_pattern.unwrap_or(defaults.output_pattern),
            backup_existing: self.backup_existing.unwrap_or(defaults.backup_existing),
            donor_standards: self.donor_standards.unwrap_or(defaults.donor_standards),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_default_config() {
        let config = Config::builder().build().unwrap();

        assert_eq!(config.provider, Provider::DeepSeek);
        assert_eq!(config.overlap_tokens, DEFAULT_OVERLAP_TOKENS);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.min_chunk_chars, 50);
        // 32k × 0.75 − 2500
        assert_eq!(config.effective_chunk_tokens(), 21_500);
    }

    #[test]
    fn test_max_tokens_override() {
        let config = Config::builder().max_tokens(6_000).build().unwrap();
        assert_eq!(config.effective_chunk_tokens(), 6_000);
    }

    #[test]
    fn test_invalid_token_limits() {
        let result = Config::builder().max_tokens(1000).overlap_tokens(1000).build();
        assert!(result.unwrap_err().is_config());

        assert!(Config::builder().max_tokens(0).build().is_err());
    }

    #[test]
    fn test_invalid_retries_and_rates() {
        assert!(Config::builder().max_retries(0).build().is_err());
        assert!(Config::builder().extraction_attempts(0).build().is_err());
        assert!(Config::builder().min_chunk_chars(0).build().is_err());
        assert!(Config::builder().contingency_rate(1.0).build().is_err());
        assert!(Config::builder().administrative_rate(-0.1).build().is_err());
    }

    #[test]
    fn test_invalid_pattern() {
        let result = Config::builder().output_pattern("invalid_pattern").build();
        assert!(result.is_err());

        let result = Config::builder().output_pattern("prompt_{index}.txt").build();
        assert!(result.unwrap_err().to_string().contains("{ext}"));
    }

    #[test]
    fn test_missing_template_dir() {
        let result = Config::builder()
            .template_dir("/nonexistent/templates")
            .build();
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_invalid_template_in_dir() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(BUDGET_TEMPLATE)
            .write_str("Budget for {{ ctx.content }}")
            .unwrap();

        let result = Config::builder().template_dir(temp.path()).build();
        assert!(result.unwrap_err().to_string().contains("schema"));
    }

    #[test]
    fn test_budget_rates() {
        let config = Config::default();

        let usaid = config.budget_rates(Some("USAID"));
        assert_eq!(usaid.administrative, 0.10);
        assert_eq!(usaid.indirect_limit, Some(0.10));
        assert!(usaid.required_categories.contains(&"Travel"));

        let aecid = config.budget_rates(Some("AECID"));
        assert_eq!(aecid.administrative, DEFAULT_ADMINISTRATIVE_RATE);
        assert_eq!(aecid.indirect_limit, None);

        let overridden = Config::builder()
            .administrative_rate(0.12)
            .donor_standards(false)
            .build()
            .unwrap()
            .budget_rates(Some("USAID"));
        assert_eq!(overridden.administrative, 0.12);
        assert_eq!(overridden.indirect_limit, None);
        assert!(overridden.required_categories.is_empty());
    }

    #[test]
    fn test_from_toml_str() {
        let config = ConfigBuilder::from_toml_str(
            r#"
            provider = "claude"
            overlap_tokens = 200
            retry_base_delay_ms = 250
            contingency_rate = 0.1
            donor_standards = false
            "#,
        )
        .unwrap()
        .max_retries(5)
        .build()
        .unwrap();

        assert_eq!(config.provider, Provider::Sonnet);
        assert_eq!(config.overlap_tokens, 200);
        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.contingency_rate, 0.1);
        assert_eq!(config.max_retries, 5);
        assert!(!config.donor_standards);
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        let err = ConfigBuilder::from_toml_str("max_tokenz = 10").unwrap_err();
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_from_toml_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("tor-proposal.toml");
        file.write_str("max_tokens = 6000\n").unwrap();

        let config = ConfigBuilder::from_toml_file(file.path()).unwrap().build().unwrap();
        assert_eq!(config.effective_chunk_tokens(), 6_000);

        let missing = ConfigBuilder::from_toml_file(&temp.path().join("none.toml"));
        assert!(missing.unwrap_err().is_io());
    }
}
