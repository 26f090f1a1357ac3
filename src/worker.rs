//! One background thread per generation request.
//!
//! The worker chunks the document once, then runs each requested task in
//! order against the same chunks. Events stream back over a channel so the
//! caller's thread never blocks on a client call.

use crate::{
    cancel::CancelToken,
    client::Clients,
    config::Config,
    error::Error,
    orchestrator::{ChainedPromptGenerator, PipelineResult, ProcessingStats},
    progress::{Progress, ProgressSink},
    project::ProjectMetadata,
    prompt::TaskKind,
    splitter::Splitter,
    validator::ChunkValidator,
};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Input of one generation run.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Extracted ToR text
    pub text: String,
    /// Project metadata from the wizard
    pub project: ProjectMetadata,
    /// Tasks to run, in order
    pub tasks: Vec<TaskKind>,
}

impl GenerationRequest {
    /// Requests the narrative and then the budget.
    #[must_use]
    pub fn new(text: impl Into<String>, project: ProjectMetadata) -> Self {
        Self {
            text: text.into(),
            project,
            tasks: TaskKind::all().to_vec(),
        }
    }

    /// Restricts the request to the given tasks.
    #[must_use]
    pub fn tasks(mut self, tasks: &[TaskKind]) -> Self {
        self.tasks = tasks.to_vec();
        self
    }
}

/// Notification sent from the worker thread.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Document chunked; `chunks` may be zero
    Chunked {
        /// Validated chunks
        chunks: usize,
    },
    /// Orchestrator progress
    Progress(Progress),
    /// One task finished, successfully or with an error-shaped result
    TaskFinished {
        /// Final artifact
        result: PipelineResult,
        /// Statistics of that task's run
        stats: ProcessingStats,
    },
    /// The worker could not start a run
    Failed(Error),
    /// Remaining tasks were skipped after cancellation
    Cancelled,
    /// Last event of every run
    Done,
}

/// Spawns generation runs.
pub struct GenerationWorker;

impl GenerationWorker {
    /// Starts `request` on a new thread.
    #[must_use]
    pub fn spawn(request: GenerationRequest, clients: Clients, config: &Config) -> WorkerHandle {
        let (sender, events) = mpsc::channel();
        let cancel = CancelToken::new();
        let config = config.clone();
        let token = cancel.clone();

        let thread = thread::spawn(move || {
            run(&request, clients, &config, token, &sender);
            // Receiver may already be gone
            let _ = sender.send(WorkerEvent::Done);
        });

        WorkerHandle {
            events,
            cancel,
            thread,
        }
    }
}

fn run(
    request: &GenerationRequest,
    clients: Clients,
    config: &Config,
    cancel: CancelToken,
    sender: &Sender<WorkerEvent>,
) {
    let raw = Splitter::new(config).split(&request.text);
    let chunks = ChunkValidator::new(config).process(raw);
    let _ = sender.send(WorkerEvent::Chunked {
        chunks: chunks.len(),
    });

    let progress_sender = sender.clone();
    let progress: ProgressSink = Arc::new(move |p: &Progress| {
        let _ = progress_sender.send(WorkerEvent::Progress(p.clone()));
    });

    let mut generator = match ChainedPromptGenerator::new(clients, config) {
        Ok(generator) => generator
            .with_progress(progress)
            .with_cancel_token(cancel.clone()),
        Err(e) => {
            warn!("Generation worker could not start: {}", e);
            let _ = sender.send(WorkerEvent::Failed(e));
            return;
        }
    };

    for task in &request.tasks {
        if cancel.is_cancelled() {
            info!("Generation cancelled, skipping {}", task);
            let _ = sender.send(WorkerEvent::Cancelled);
            return;
        }

        let result = generator.process(&chunks, &request.project, *task, config.max_retries);
        let _ = sender.send(WorkerEvent::TaskFinished {
            result,
            stats: generator.stats().clone(),
        });
    }

    if cancel.is_cancelled() {
        let _ = sender.send(WorkerEvent::Cancelled);
    }
}

/// Caller side of a running worker.
pub struct WorkerHandle {
    events: Receiver<WorkerEvent>,
    cancel: CancelToken,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Requests cooperative cancellation.
    ///
    /// Takes effect at the next chunk boundary or backoff sleep; a client
    /// call already in flight completes first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the next event; `None` once the worker has finished.
    #[must_use]
    pub fn recv(&self) -> Option<WorkerEvent> {
        self.events.recv().ok()
    }

    /// Returns the next event if one is ready.
    #[must_use]
    pub fn try_recv(&self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }

    /// Iterates over events until the worker finishes.
    pub fn events(&self) -> impl Iterator<Item = WorkerEvent> + '_ {
        self.events.iter()
    }

    /// Drains the remaining events and waits for the thread.
    #[must_use]
    pub fn join(self) -> Vec<WorkerEvent> {
        let events: Vec<WorkerEvent> = self.events.iter().collect();
        if self.thread.join().is_err() {
            warn!("Generation worker panicked");
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{ScriptedProseClient, ScriptedStructuredClient};
    use crate::progress::Phase;
    use std::time::Duration;

    const BUDGET_JSON: &str = r#"{"items": [{"category": "personnel", "description": "Coordinator", "quantity": 1, "unit_cost": 1000, "months": 12}]}"#;

    fn config() -> Config {
        Config::builder()
            .max_tokens(200)
            .overlap_tokens(20)
            .retry_base_delay(Duration::ZERO)
            .build()
            .unwrap()
    }

    fn long_tor() -> String {
        let mut text = String::new();
        for (header, topic) in [
            ("ANTECEDENTES", "water access"),
            ("OBJETIVOS", "disease reduction"),
            ("ACTIVIDADES", "filter installation"),
        ] {
            text.push_str(header);
            text.push_str("\n\n");
            for i in 0..12 {
                text.push_str(&format!(
                    "Paragraph {i} describes {topic} in the rural communities of the department. "
                ));
            }
            text.push_str("\n\n");
        }
        text
    }

    fn clients() -> Clients {
        Clients::new()
            .with_prose(Arc::new(ScriptedProseClient::new("Resumen.")))
            .with_structured(Arc::new(ScriptedStructuredClient::new(BUDGET_JSON)))
    }

    #[test]
    fn test_runs_narrative_then_budget() {
        let project = ProjectMetadata::new().with("title", "Agua segura");
        let handle = GenerationWorker::spawn(GenerationRequest::new(long_tor(), project), clients(), &config());

        let events = handle.join();

        assert!(matches!(events.first(), Some(WorkerEvent::Chunked { chunks }) if *chunks > 1));
        assert!(matches!(events.last(), Some(WorkerEvent::Done)));

        let results: Vec<&PipelineResult> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::TaskFinished { result, .. } => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].task(), TaskKind::Narrative);
        assert_eq!(results[1].task(), TaskKind::Budget);
        assert!(results.iter().all(|r| !r.is_error()));
    }

    #[test]
    fn test_progress_is_ordered_per_task() {
        let handle = GenerationWorker::spawn(
            GenerationRequest::new(long_tor(), ProjectMetadata::new()).tasks(&[TaskKind::Narrative]),
            clients(),
            &config(),
        );

        let phases: Vec<Phase> = handle
            .join()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress(p) => Some(p.phase),
                _ => None,
            })
            .collect();

        assert!(matches!(phases.first(), Some(Phase::Start { .. })));
        assert!(matches!(phases.last(), Some(Phase::Complete { .. })));
        assert!(phases.windows(2).all(|w| w[0].index() <= w[1].index()));
    }

    #[test]
    fn test_empty_document_yields_error_results() {
        let handle = GenerationWorker::spawn(
            GenerationRequest::new("Error: could not read file", ProjectMetadata::new()),
            clients(),
            &config(),
        );

        let events = handle.join();

        assert!(matches!(events.first(), Some(WorkerEvent::Chunked { chunks: 0 })));
        let errors = events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::TaskFinished { result, .. } if result.is_error()))
            .count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn test_too_short_document_never_reaches_clients() {
        let prose = Arc::new(ScriptedProseClient::new("Resumen."));
        let clients = Clients::new()
            .with_prose(prose.clone())
            .with_structured(Arc::new(ScriptedStructuredClient::new(BUDGET_JSON)));
        let handle = GenerationWorker::spawn(
            GenerationRequest::new("Short ToR", ProjectMetadata::new()).tasks(&[TaskKind::Narrative]),
            clients,
            &config(),
        );

        let events = handle.join();

        assert!(matches!(events.first(), Some(WorkerEvent::Chunked { chunks: 0 })));
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkerEvent::TaskFinished { result, .. } if result.is_error())));
        assert_eq!(prose.call_count(), 0);
    }

    /// Blocks every call until the paired sender is dropped.
    struct GatedClient {
        gate: std::sync::Mutex<Receiver<()>>,
    }

    impl crate::client::ProseClient for GatedClient {
        fn name(&self) -> &str {
            "gated"
        }

        fn generate(&self, _prompt: &str) -> Result<String, crate::client::ClientError> {
            let _ = self.gate.lock().unwrap().recv();
            Ok("Resumen.".to_string())
        }
    }

    #[test]
    fn test_cancel_mid_run_skips_remaining_tasks() {
        let (release, gate) = mpsc::channel::<()>();
        let clients = Clients::new()
            .with_prose(Arc::new(GatedClient {
                gate: std::sync::Mutex::new(gate),
            }))
            .with_structured(Arc::new(ScriptedStructuredClient::new(BUDGET_JSON)));
        let handle = GenerationWorker::spawn(GenerationRequest::new(long_tor(), ProjectMetadata::new()), clients, &config());

        // First extraction call is now blocked on the gate
        loop {
            match handle.recv() {
                Some(WorkerEvent::Progress(p)) if matches!(p.phase, Phase::Start { .. }) => break,
                Some(_) => {}
                None => panic!("worker finished before the first extraction started"),
            }
        }
        handle.cancel();
        drop(release);

        let events = handle.join();

        let results: Vec<&PipelineResult> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::TaskFinished { result, .. } => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_error());
        assert!(results[0].as_narrative().unwrap().contains("cancelled"));
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Cancelled)));
        assert!(matches!(events.last(), Some(WorkerEvent::Done)));
    }
}
