use crate::prompt::TaskKind;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Stage of a run, in the order the orchestrator goes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    /// Run accepted
    Start {
        /// Final artifact requested
        task: TaskKind,
        /// Chunks to process
        chunks: usize,
    },
    /// One chunk extracted (1-based)
    Extraction {
        /// Chunk just processed
        current: usize,
        /// Chunks in the run
        total: usize,
    },
    /// Final call about to start
    Synthesis {
        /// Final artifact requested
        task: TaskKind,
    },
    /// Run finished, successfully or not
    Complete {
        /// Final artifact requested
        task: TaskKind,
        /// Wall time of the run in milliseconds
        elapsed_ms: u64,
    },
}

impl Phase {
    /// Position of this phase in a run; never decreases within one run.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Start { .. } => 0,
            Self::Extraction { .. } => 1,
            Self::Synthesis { .. } => 2,
            Self::Complete { .. } => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start { task, chunks } => {
                write!(f, "Processing {chunks} chunk(s) for {task}")
            }
            Self::Extraction { current, total } => {
                write!(f, "Extracted chunk {current} of {total}")
            }
            Self::Synthesis { task } => write!(f, "Synthesizing {task}"),
            Self::Complete { task, elapsed_ms } => {
                write!(f, "Completed {task} in {:.1}s", *elapsed_ms as f64 / 1000.0)
            }
        }
    }
}

/// A progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Structured phase
    #[serde(flatten)]
    pub phase: Phase,
    /// Human-readable message
    pub message: String,
}

impl Progress {
    /// Creates a notification with the phase's default message.
    #[must_use]
    pub fn new(phase: Phase) -> Self {
        Self {
            message: phase.to_string(),
            phase,
        }
    }
}

/// Callback receiving progress notifications on the worker thread.
///
/// Must return quickly; it is called at least once per chunk.
pub type ProgressSink = Arc<dyn Fn(&Progress) + Send + Sync>;

/// A sink that discards every notification.
#[must_use]
pub fn noop_sink() -> ProgressSink {
    Arc::new(|_| {})
}
