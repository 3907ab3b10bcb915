//! Progress notifications emitted while a session runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use super::mutant::ResultStatus;
use super::score::MutationScore;

/// One progress step of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Unmutated compilation started.
    BaselineCompileStarted,
    /// A compilation produced no runnable artifact.
    CompilationFailed {
        /// Error diagnostics.
        errors: usize,
        /// Warning diagnostics.
        warnings: usize,
    },
    /// Unmutated test run started.
    BaselineTestsStarted,
    /// The unmutated test run did not pass.
    BaselineTestsFailed {
        /// Result message of the failed run.
        message: String,
    },
    /// Mutated compilation started.
    MutationCompileStarted,
    /// Mutants are known.
    MutantsGenerated {
        /// Number of mutants.
        count: usize,
    },
    /// One mutant's test run started.
    MutantStarted {
        /// 1-based position.
        position: usize,
        /// Number of mutants.
        total: usize,
        /// Mutant id.
        mutant_id: u32,
        /// Mutant display name.
        display_name: String,
    },
    /// One mutant was classified.
    MutantFinished {
        /// 1-based position.
        position: usize,
        /// Number of mutants.
        total: usize,
        /// Mutant id.
        mutant_id: u32,
        /// Classification.
        status: ResultStatus,
    },
    /// Unit test mode finished its run.
    TestsFinished {
        /// Result message.
        message: String,
    },
    /// Mutation score computed.
    SessionCompleted {
        /// Final score.
        score: MutationScore,
    },
    /// The session stopped on cancellation.
    SessionCancelled {
        /// Mutants classified before the stop.
        classified: usize,
        /// Number of mutants.
        total: usize,
    },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaselineCompileStarted => {
                f.write_str("Performing initial compilation (without mutating the source)")
            }
            Self::CompilationFailed { errors, warnings } => write!(
                f,
                "Compilation failed with {errors} errors and {warnings} warnings"
            ),
            Self::BaselineTestsStarted => f.write_str("Performing initial test run (without mutants)"),
            Self::BaselineTestsFailed { message } => {
                write!(f, "Initial test run failed: {message}")
            }
            Self::MutationCompileStarted => f.write_str("Adding mutants.."),
            Self::MutantsGenerated { count } => write!(f, "Generated {count} mutant(s)"),
            Self::MutantStarted {
                position,
                total,
                display_name,
                ..
            } => write!(
                f,
                "Running test suite for mutant {position}/{total}: {display_name}"
            ),
            Self::MutantFinished {
                position,
                total,
                status,
                ..
            } => write!(f, "Mutant {position}/{total}: {status}"),
            Self::TestsFinished { message } => f.write_str(message),
            Self::SessionCompleted { score } => write!(f, "Mutation score: {score}"),
            Self::SessionCancelled { classified, total } => write!(
                f,
                "Session cancelled after {classified} of {total} mutant(s)"
            ),
        }
    }
}

/// Receiver of progress notifications. Shared across the mutant pool, so it
/// must be usable from any task.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: SessionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SessionEvent) {}
}

impl EventSink for UnboundedSender<SessionEvent> {
    fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is watching progress.
        let _ = self.send(event);
    }
}

impl<F> EventSink for F
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn emit(&self, event: SessionEvent) {
        self(event)
    }
}
