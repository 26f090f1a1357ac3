//! Contracts for the two external language-model collaborators.
//!
//! The crate ships no HTTP clients. Callers implement [`ProseClient`] for a
//! narrative endpoint and [`StructuredClient`] for a JSON endpoint, then hand
//! them to the orchestrator through [`Clients`]. The kind of each client is
//! fixed when it is wrapped in [`LlmClient`], never inspected at call time.

use crate::token::Provider;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by external language-model clients.
///
/// Every variant is treated as retryable by the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Network or API communication error
    #[error("Communication error: {0}")]
    Communication(String),

    /// The request did not complete within the client's timeout
    #[error("Request to {0} timed out")]
    Timeout(String),

    /// The service answered with a non-success status
    #[error("Error response ({status}): {message}")]
    ErrorResponse {
        /// Status code reported by the service
        status: u16,
        /// Response body or message
        message: String,
    },

    /// The response could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Generic error
    #[error("LLM error: {0}")]
    Other(String),
}

/// Returns true when text starts with the error marker: `Error` followed by
/// a non-letter or nothing at all.
///
/// Both the document extractor and prose clients use this marker to signal
/// failure in-band.
#[must_use]
pub fn has_error_marker(text: &str) -> bool {
    text.trim_start()
        .strip_prefix("Error")
        .is_some_and(|rest| !rest.starts_with(char::is_alphabetic))
}

/// Client producing free text from a prompt.
///
/// A response whose content begins with the error marker (`Error` followed
/// by a non-letter) is treated as a failure, the same as returning `Err`.
pub trait ProseClient: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Generates text for the prompt.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] when the call fails.
    fn generate(&self, prompt: &str) -> Result<String, ClientError>;

    /// Provider behind this client, used to size synthesis prompts.
    ///
    /// `None` defers to the configured provider.
    fn provider(&self) -> Option<Provider> {
        None
    }
}

/// Client producing a JSON object constrained by a schema.
///
/// Implementations must recover JSON wrapped in fences or commentary
/// themselves (see [`crate::json::recover_json`]). A returned object with an
/// `error` field is treated as a failure.
pub trait StructuredClient: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Generates a JSON value for the prompt and schema.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] when the call fails.
    fn generate_json(&self, prompt: &str, schema: &Value) -> Result<Value, ClientError>;

    /// Provider behind this client, used to size synthesis prompts.
    ///
    /// `None` means the structured default, [`Provider::Sonnet`].
    fn provider(&self) -> Option<Provider> {
        None
    }
}

/// A language-model client tagged with its capability.
#[derive(Clone)]
pub enum LlmClient {
    /// Prompt to free text
    Prose(Arc<dyn ProseClient>),
    /// Prompt plus schema to JSON
    Structured(Arc<dyn StructuredClient>),
}

impl LlmClient {
    /// Returns the client's name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Prose(client) => client.name(),
            Self::Structured(client) => client.name(),
        }
    }
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prose(client) => f.debug_tuple("Prose").field(&client.name()).finish(),
            Self::Structured(client) => f.debug_tuple("Structured").field(&client.name()).finish(),
        }
    }
}

/// The set of clients available to a pipeline run.
#[derive(Clone, Default)]
pub struct Clients {
    prose: Option<Arc<dyn ProseClient>>,
    structured: Option<Arc<dyn StructuredClient>>,
}

impl Clients {
    /// Creates an empty client set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prose client.
    #[must_use]
    pub fn with_prose(mut self, client: Arc<dyn ProseClient>) -> Self {
        self.prose = Some(client);
        self
    }

    /// Sets the structured client.
    #[must_use]
    pub fn with_structured(mut self, client: Arc<dyn StructuredClient>) -> Self {
        self.structured = Some(client);
        self
    }

    /// Adds a tagged client, replacing any client of the same kind.
    #[must_use]
    pub fn with(self, client: LlmClient) -> Self {
        match client {
            LlmClient::Prose(client) => self.with_prose(client),
            LlmClient::Structured(client) => self.with_structured(client),
        }
    }

    /// Returns the prose client, if any.
    #[must_use]
    pub fn prose(&self) -> Option<&Arc<dyn ProseClient>> {
        self.prose.as_ref()
    }

    /// Returns the structured client, if any.
    #[must_use]
    pub fn structured(&self) -> Option<&Arc<dyn StructuredClient>> {
        self.structured.as_ref()
    }
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients")
            .field("prose", &self.prose.as_ref().map(|c| c.name().to_string()))
            .field(
                "structured",
                &self.structured.as_ref().map(|c| c.name().to_string()),
            )
            .finish()
    }
}

/// What the current run can do, computed once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// A prose client is configured
    pub prose_generation: bool,
    /// A structured client is configured
    pub structured_generation: bool,
    /// Donor guidance is injected into prompts
    pub donor_standards: bool,
}

impl Capabilities {
    /// Derives capabilities from the configured clients.
    #[must_use]
    pub fn detect(clients: &Clients, donor_standards: bool) -> Self {
        Self {
            prose_generation: clients.prose.is_some(),
            structured_generation: clients.structured.is_some(),
            donor_standards,
        }
    }
}

/// Deterministic scripted clients for tests and dry runs.
pub mod mock {
    use super::{ClientError, ProseClient, StructuredClient};
    use crate::json::recover_json;
    use crate::token::Provider;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prose client that replays queued responses.
    ///
    /// When the queue is empty the default response is returned. Prompts
    /// containing a registered fragment always fail.
    #[derive(Debug)]
    pub struct ScriptedProseClient {
        name: String,
        provider: Option<Provider>,
        default_response: String,
        queue: Mutex<VecDeque<Result<String, ClientError>>>,
        failing_fragments: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProseClient {
        /// Creates a client answering every prompt with `default_response`.
        #[must_use]
        pub fn new(default_response: impl Into<String>) -> Self {
            Self {
                name: "scripted-prose".to_string(),
                provider: None,
                default_response: default_response.into(),
                queue: Mutex::new(VecDeque::new()),
                failing_fragments: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        /// Queues a successful response.
        #[must_use]
        pub fn then_ok(self, response: impl Into<String>) -> Self {
            lock(&self.queue).push_back(Ok(response.into()));
            self
        }

        /// Queues a failure.
        #[must_use]
        pub fn then_err(self, error: ClientError) -> Self {
            lock(&self.queue).push_back(Err(error));
            self
        }

        /// Reports `provider` as the model behind this client.
        #[must_use]
        pub fn with_provider(mut self, provider: Provider) -> Self {
            self.provider = Some(provider);
            self
        }

        /// Fails every prompt that contains `fragment`.
        #[must_use]
        pub fn fail_when_contains(self, fragment: impl Into<String>) -> Self {
            lock(&self.failing_fragments).push(fragment.into());
            self
        }

        /// Returns every prompt received so far.
        #[must_use]
        pub fn prompts(&self) -> Vec<String> {
            lock(&self.prompts).clone()
        }

        /// Returns the number of calls made.
        #[must_use]
        pub fn call_count(&self) -> usize {
            lock(&self.prompts).len()
        }
    }

    impl ProseClient for ScriptedProseClient {
        fn name(&self) -> &str {
            &self.name
        }

        fn provider(&self) -> Option<Provider> {
            self.provider
        }

        fn generate(&self, prompt: &str) -> Result<String, ClientError> {
            lock(&self.prompts).push(prompt.to_string());

            if lock(&self.failing_fragments)
                .iter()
                .any(|fragment| prompt.contains(fragment.as_str()))
            {
                return Err(ClientError::Other("scripted failure".to_string()));
            }

            lock(&self.queue)
                .pop_front()
                .unwrap_or_else(|| Ok(self.default_response.clone()))
        }
    }

    /// Structured client that replays queued raw text responses.
    ///
    /// Raw text goes through [`recover_json`], so fenced or chatty output
    /// can be scripted directly.
    #[derive(Debug)]
    pub struct ScriptedStructuredClient {
        name: String,
        provider: Option<Provider>,
        default_response: String,
        queue: Mutex<VecDeque<Result<String, ClientError>>>,
        prompts: Mutex<Vec<String>>,
        schemas: Mutex<Vec<Value>>,
    }

    impl ScriptedStructuredClient {
        /// Creates a client answering every prompt with `default_raw`.
        #[must_use]
        pub fn new(default_raw: impl Into<String>) -> Self {
            Self {
                name: "scripted-structured".to_string(),
                provider: None,
                default_response: default_raw.into(),
                queue: Mutex::new(VecDeque::new()),
                prompts: Mutex::new(Vec::new()),
                schemas: Mutex::new(Vec::new()),
            }
        }

        /// Reports `provider` as the model behind this client.
        #[must_use]
        pub fn with_provider(mut self, provider: Provider) -> Self {
            self.provider = Some(provider);
            self
        }

        /// Queues a raw text response.
        #[must_use]
        pub fn then_raw(self, raw: impl Into<String>) -> Self {
            lock(&self.queue).push_back(Ok(raw.into()));
            self
        }

        /// Queues a failure.
        #[must_use]
        pub fn then_err(self, error: ClientError) -> Self {
            lock(&self.queue).push_back(Err(error));
            self
        }

        /// Returns every prompt received so far.
        #[must_use]
        pub fn prompts(&self) -> Vec<String> {
            lock(&self.prompts).clone()
        }

        /// Returns every schema received so far.
        #[must_use]
        pub fn schemas(&self) -> Vec<Value> {
            lock(&self.schemas).clone()
        }

        /// Returns the number of calls made.
        #[must_use]
        pub fn call_count(&self) -> usize {
            lock(&self.prompts).len()
        }
    }

    impl StructuredClient for ScriptedStructuredClient {
        fn name(&self) -> &str {
            &self.name
        }

        fn provider(&self) -> Option<Provider> {
            self.provider
        }

        fn generate_json(&self, prompt: &str, schema: &Value) -> Result<Value, ClientError> {
            lock(&self.prompts).push(prompt.to_string());
            lock(&self.schemas).push(schema.clone());

            let raw = lock(&self.queue)
                .pop_front()
                .unwrap_or_else(|| Ok(self.default_response.clone()))?;
            recover_json(&raw)
        }
    }
}
