use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CHARS_PER_TOKEN: f64 = 4.0;
const WORD_MULTIPLIER: f64 = 1.3;

const SMALL_CONTEXT_WINDOW: usize = 32_000;
const LARGE_CONTEXT_WINDOW: usize = 200_000;
const DEFAULT_CONTEXT_WINDOW: usize = 8_000;

/// Fraction of the nominal context window the pipeline allows itself to use.
pub const SAFETY_MARGIN: f64 = 0.75;

/// Tokens reserved for instructions and schema when nothing else is configured.
pub const DEFAULT_PROMPT_OVERHEAD: usize = 2_500;

/// Small-context providers never reserve more than this for instructions.
pub const SMALL_TIER_OVERHEAD_CAP: usize = 3_000;

/// Floor for the content budget so tiny windows cannot cause endless splitting.
pub const MIN_CONTENT_TOKENS: usize = 1_000;

/// Trait for estimating token counts in text.
///
/// Implementations must be pure and thread-safe: the same text always
/// yields the same estimate.
pub trait TokenEstimator: Send + Sync {
    /// Estimates the number of tokens in the given text.
    ///
    /// Returns 0 for empty input.
    fn estimate(&self, text: &str) -> usize;
}

/// Word/character heuristic estimator.
///
/// Takes the larger of two conservative estimates:
/// - words × 1.3 (sub-word tokenization of long or non-ASCII words)
/// - characters ÷ 4
///
/// It does not track any real tokenizer; it only has to be a stable,
/// monotonic proxy that keeps prompts under a provider's ceiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let words = count_words(text) as f64;
        let chars = text.chars().count() as f64;

        let word_estimate = words * WORD_MULTIPLIER;
        let char_estimate = chars / CHARS_PER_TOKEN;

        word_estimate.max(char_estimate) as usize
    }
}

/// Counts words in text (whitespace-separated).
#[inline]
pub(crate) fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Size class of a provider's context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTier {
    /// Around 32k tokens; overhead is capped because the margin for error is small.
    Small,
    /// Around 200k tokens.
    Large,
    /// Unrecognised provider; a conservative window is assumed.
    Unknown,
}

/// Language-model provider the content budget is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// DeepSeek chat models (prose generation).
    #[default]
    DeepSeek,
    /// Anthropic Sonnet models (structured generation).
    #[serde(alias = "claude", alias = "anthropic")]
    Sonnet,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

impl Provider {
    /// Resolves a provider name, accepting common aliases case-insensitively.
    ///
    /// Unknown names map to [`Provider::Unknown`] rather than failing.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "deepseek" => Self::DeepSeek,
            "sonnet" | "claude" | "anthropic" => Self::Sonnet,
            _ => Self::Unknown,
        }
    }

    /// Returns the context tier of this provider.
    #[must_use]
    pub const fn tier(self) -> ContextTier {
        match self {
            Self::DeepSeek => ContextTier::Small,
            Self::Sonnet => ContextTier::Large,
            Self::Unknown => ContextTier::Unknown,
        }
    }

    /// Returns the nominal context window in tokens.
    #[must_use]
    pub const fn context_window(self) -> usize {
        match self.tier() {
            ContextTier::Small => SMALL_CONTEXT_WINDOW,
            ContextTier::Large => LARGE_CONTEXT_WINDOW,
            ContextTier::Unknown => DEFAULT_CONTEXT_WINDOW,
        }
    }
}

impl FromStr for Provider {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeepSeek => "deepseek",
            Self::Sonnet => "sonnet",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Per-provider token budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudget {
    /// Nominal context window in tokens
    pub context_window: usize,
    /// Usable fraction of the window
    pub safety_margin: f64,
    /// Tokens reserved for instructions and schema
    pub prompt_overhead: usize,
}

impl TokenBudget {
    /// Builds the budget for a provider, applying the small-tier overhead cap.
    #[must_use]
    pub fn for_provider(provider: Provider, prompt_overhead: usize) -> Self {
        let prompt_overhead = match provider.tier() {
            ContextTier::Small => prompt_overhead.min(SMALL_TIER_OVERHEAD_CAP),
            ContextTier::Large | ContextTier::Unknown => prompt_overhead,
        };

        Self {
            context_window: provider.context_window(),
            safety_margin: SAFETY_MARGIN,
            prompt_overhead,
        }
    }

    /// Tokens a whole rendered prompt may occupy: `window × margin`.
    #[must_use]
    pub fn usable_tokens(&self) -> usize {
        (self.context_window as f64 * self.safety_margin) as usize
    }

    /// Tokens available for document content:
    /// `window × margin − overhead`, floored at [`MIN_CONTENT_TOKENS`].
    #[must_use]
    pub fn max_content_tokens(&self) -> usize {
        self.usable_tokens()
            .saturating_sub(self.prompt_overhead)
            .max(MIN_CONTENT_TOKENS)
    }
}

/// Maximum content tokens for a provider given the prompt overhead.
#[must_use]
pub fn max_content_tokens(provider: Provider, prompt_overhead: usize) -> usize {
    TokenBudget::for_provider(provider, prompt_overhead).max_content_tokens()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_estimator_empty() {
        assert_eq!(HeuristicEstimator.estimate(""), 0);
    }

    #[test]
    fn test_estimator_char_dominated() {
        // 1000 chars, 1 word: 1000 / 4 = 250
        let text = "a".repeat(1000);
        assert_eq!(HeuristicEstimator.estimate(&text), 250);
    }

    #[test]
    fn test_estimator_word_dominated() {
        // 10 short words: 10 * 1.3 = 13 beats 19 / 4
        let text = "a b c d e f g h i j";
        assert_eq!(HeuristicEstimator.estimate(text), 13);
    }

    #[test]
    fn test_estimator_counts_unicode_chars_not_bytes() {
        let text = "ñ".repeat(40);
        assert_eq!(HeuristicEstimator.estimate(&text), 10);
    }

    #[test]
    fn test_count_words() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("hola"), 1);
        assert_eq!(count_words("  hola   mundo  "), 2);
    }

    #[test]
    fn test_provider_aliases() {
        assert_eq!(Provider::from_name("DeepSeek"), Provider::DeepSeek);
        assert_eq!(Provider::from_name("claude"), Provider::Sonnet);
        assert_eq!(Provider::from_name("anthropic"), Provider::Sonnet);
        assert_eq!(Provider::from_name("gpt-4"), Provider::Unknown);
        assert_eq!("sonnet".parse::<Provider>().unwrap(), Provider::Sonnet);
    }

    #[test]
    fn test_max_content_tokens_small_tier() {
        // 32000 * 0.75 - 2500
        assert_eq!(max_content_tokens(Provider::DeepSeek, 2_500), 21_500);
        // overhead capped at 3000
        assert_eq!(max_content_tokens(Provider::DeepSeek, 10_000), 21_000);
    }

    #[test]
    fn test_max_content_tokens_large_tier() {
        assert_eq!(max_content_tokens(Provider::Sonnet, 2_500), 147_500);
        assert_eq!(max_content_tokens(Provider::Sonnet, 10_000), 140_000);
    }

    #[test]
    fn test_max_content_tokens_unknown_and_floor() {
        assert_eq!(max_content_tokens(Provider::Unknown, 2_500), 3_500);
        assert_eq!(max_content_tokens(Provider::Unknown, 50_000), MIN_CONTENT_TOKENS);
    }

    #[test]
    fn test_default_budgets_are_positive() {
        for provider in [Provider::DeepSeek, Provider::Sonnet, Provider::Unknown] {
            assert!(max_content_tokens(provider, DEFAULT_PROMPT_OVERHEAD) > 0);
        }
    }

    proptest! {
        #[test]
        fn prop_estimate_is_deterministic(text in ".{0,400}") {
            prop_assert_eq!(HeuristicEstimator.estimate(&text), HeuristicEstimator.estimate(&text));
        }

        #[test]
        fn prop_estimate_is_monotonic_under_append(a in "[a-z ]{0,200}", b in "[a-z ]{0,200}") {
            let joined = format!("{a}{b}");
            prop_assert!(HeuristicEstimator.estimate(&joined) >= HeuristicEstimator.estimate(&a));
        }
    }
}
