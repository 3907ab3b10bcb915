//! Mutation test session state machine.
//!
//! A session compiles the program, proves the unmutated tests pass, compiles
//! again with mutants injected, then evaluates every mutant in its own
//! sandbox under a hard timeout. Compilation and baseline failures end the
//! session before any mutant runs.

use std::pin::pin;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::compile::{
    Artifact, CompilationInput, CompilationResult, CompileError, Compiler, Diagnostic,
    DiagnosticSummary, SourceDocument,
};
use super::config::SessionConfig;
use super::events::{EventSink, SessionEvent};
use super::mutant::{MutantRegistry, RegistryError, ResultStatus};
use super::report::SessionReport;
use super::sandbox::{
    ExecutionRequest, IsolatedRun, SandboxError, SandboxProvider, TestRunResult, TestRunStatus,
    run_isolated,
};

/// Session-fatal infrastructure errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The compiler could not run.
    #[error("compiler error: {0}")]
    Compile(#[from] CompileError),
    /// A sandbox failed where failures are not isolated.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    /// The injector produced an inconsistent mutant set.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Terminal state of a mutation test session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Baseline or mutated compilation produced no runnable artifact.
    CompilationFailed {
        /// Compiler messages.
        diagnostics: Vec<Diagnostic>,
    },
    /// The unmutated program failed its own tests.
    BaselineTestsFailed {
        /// The failing baseline run.
        result: TestRunResult,
    },
    /// Stopped by the cancellation token. Unevaluated mutants stay `NotRun`.
    Cancelled {
        /// Mutants at the time of cancellation, if they had been generated.
        registry: Option<MutantRegistry>,
    },
    /// Every mutant was classified.
    Completed(SessionReport),
}

/// Terminal state of a plain test run.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitTestOutcome {
    /// Compilation produced no runnable artifact.
    CompilationFailed {
        /// Compiler messages.
        diagnostics: Vec<Diagnostic>,
    },
    /// The tests ran.
    Finished(TestRunResult),
    /// Stopped by the cancellation token.
    Cancelled,
}

/// Drives compilation, baseline verification and mutant evaluation.
#[derive(Debug, Clone)]
pub struct Orchestrator<C, P> {
    compiler: C,
    sandboxes: P,
    config: SessionConfig,
}

struct Evaluation {
    mutant_id: u32,
    verdict: Option<Verdict>,
}

enum Verdict {
    Status(ResultStatus),
    Error(String),
}

impl<C, P> Orchestrator<C, P>
where
    C: Compiler,
    P: SandboxProvider,
{
    /// Wire collaborators and configuration.
    pub fn new(compiler: C, sandboxes: P, config: SessionConfig) -> Self {
        Self {
            compiler,
            sandboxes,
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run a full mutation test session.
    pub async fn run_session(
        &self,
        input: &CompilationInput,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, SessionError> {
        let cancelled = || SessionOutcome::Cancelled { registry: None };
        if cancel.is_cancelled() {
            return Ok(cancelled());
        }

        events.emit(SessionEvent::BaselineCompileStarted);
        info!("compiling baseline");
        let baseline = self.compiler.compile(input).await?;
        let Some(baseline_artifact) = baseline.runnable_artifact() else {
            return Ok(SessionOutcome::CompilationFailed {
                diagnostics: Self::compilation_failed(&baseline, events),
            });
        };
        if cancel.is_cancelled() {
            return Ok(cancelled());
        }

        events.emit(SessionEvent::BaselineTestsStarted);
        info!("running baseline tests");
        let request = ExecutionRequest {
            artifact: baseline_artifact,
            active_mutant: None,
            stop_on_error: false,
        };
        let baseline_result = match run_isolated(
            &self.sandboxes,
            request,
            self.config.baseline_timeout(),
            cancel,
        )
        .await?
        {
            IsolatedRun::Finished(result) => result,
            IsolatedRun::Cancelled => return Ok(cancelled()),
        };
        if baseline_result.status != TestRunStatus::Passed {
            warn!(status = ?baseline_result.status, "baseline tests did not pass");
            events.emit(SessionEvent::BaselineTestsFailed {
                message: baseline_result.result_message(),
            });
            return Ok(SessionOutcome::BaselineTestsFailed {
                result: baseline_result,
            });
        }
        if cancel.is_cancelled() {
            return Ok(cancelled());
        }

        events.emit(SessionEvent::MutationCompileStarted);
        info!("compiling with mutations");
        let mut mutated = self.compiler.compile_with_mutations(input).await?;
        let Some(artifact) = mutated.runnable_artifact().cloned() else {
            return Ok(SessionOutcome::CompilationFailed {
                diagnostics: Self::compilation_failed(&mutated, events),
            });
        };
        let document = mutated
            .original_document
            .take()
            .unwrap_or_else(|| SourceDocument {
                path: "source".to_string(),
                language: "text".to_string(),
                text: input.source_code.clone(),
            });
        let mut registry = MutantRegistry::new(std::mem::take(&mut mutated.mutants))?;
        events.emit(SessionEvent::MutantsGenerated {
            count: registry.len(),
        });
        info!(mutants = registry.len(), "mutants generated");

        if !self.evaluate_mutants(&artifact, &mut registry, events, cancel).await? {
            let classified = registry.len() - registry.pending().count();
            events.emit(SessionEvent::SessionCancelled {
                classified,
                total: registry.len(),
            });
            info!(classified, total = registry.len(), "session cancelled");
            return Ok(SessionOutcome::Cancelled {
                registry: Some(registry),
            });
        }

        let report = SessionReport::assemble(&document, registry, self.config.thresholds);
        events.emit(SessionEvent::SessionCompleted {
            score: report.score,
        });
        info!(score = %report.score, "session completed");
        Ok(SessionOutcome::Completed(report))
    }

    /// Compile once and run the tests without any mutant.
    pub async fn run_unit_tests(
        &self,
        input: &CompilationInput,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<UnitTestOutcome, SessionError> {
        events.emit(SessionEvent::BaselineCompileStarted);
        let compilation = self.compiler.compile(input).await?;
        let Some(artifact) = compilation.runnable_artifact() else {
            return Ok(UnitTestOutcome::CompilationFailed {
                diagnostics: Self::compilation_failed(&compilation, events),
            });
        };

        events.emit(SessionEvent::BaselineTestsStarted);
        let request = ExecutionRequest {
            artifact,
            active_mutant: None,
            stop_on_error: false,
        };
        match run_isolated(&self.sandboxes, request, self.config.baseline_timeout(), cancel).await? {
            IsolatedRun::Finished(result) => {
                events.emit(SessionEvent::TestsFinished {
                    message: result.result_message(),
                });
                Ok(UnitTestOutcome::Finished(result))
            }
            IsolatedRun::Cancelled => Ok(UnitTestOutcome::Cancelled),
        }
    }

    fn compilation_failed(result: &CompilationResult, events: &dyn EventSink) -> Vec<Diagnostic> {
        let summary = DiagnosticSummary::from_diagnostics(&result.diagnostics);
        warn!(
            errors = summary.errors,
            warnings = summary.warnings,
            "compilation failed"
        );
        events.emit(SessionEvent::CompilationFailed {
            errors: summary.errors,
            warnings: summary.warnings,
        });
        result.diagnostics.clone()
    }

    /// Evaluate every mutant through a bounded pool. Results arrive in mutant
    /// order and are recorded here, by the only registry writer. Returns
    /// false when cancelled before every mutant was classified.
    ///
    /// A session-fatal error stops scheduling and cancels the runs in flight,
    /// which are drained so each of them releases its sandbox first.
    async fn evaluate_mutants(
        &self,
        artifact: &Artifact,
        registry: &mut MutantRegistry,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<bool, SessionError> {
        let total = registry.len();
        let plan: Vec<(usize, u32, String)> = registry
            .mutants()
            .iter()
            .enumerate()
            .map(|(idx, m)| (idx + 1, m.id, m.display_name.clone()))
            .collect();

        let stop = cancel.child_token();
        let stop_ref = &stop;
        let mut evaluations = pin!(stream::iter(plan)
            .take_while(move |_| futures::future::ready(!stop_ref.is_cancelled()))
            .map(move |(position, mutant_id, display_name)| {
                self.evaluate_mutant(artifact, position, total, mutant_id, display_name, events, stop_ref)
            })
            .buffered(self.config.effective_concurrency()));

        let mut failure = None;
        let mut position = 0;
        while let Some(evaluation) = evaluations.next().await {
            position += 1;
            if failure.is_some() {
                continue;
            }
            match evaluation.and_then(|evaluation| Self::record(registry, evaluation)) {
                Ok(Some((mutant_id, status))) => {
                    debug!(mutant_id, status = %status, "mutant classified");
                    events.emit(SessionEvent::MutantFinished {
                        position,
                        total,
                        mutant_id,
                        status,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "aborting mutant evaluation");
                    stop.cancel();
                    failure = Some(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(registry.pending().next().is_none()),
        }
    }

    fn record(
        registry: &mut MutantRegistry,
        evaluation: Evaluation,
    ) -> Result<Option<(u32, ResultStatus)>, SessionError> {
        let Evaluation { mutant_id, verdict } = evaluation;
        let status = match verdict {
            None => return Ok(None),
            Some(Verdict::Status(status)) => {
                registry.record(mutant_id, status)?;
                status
            }
            Some(Verdict::Error(reason)) => {
                registry.record_error(mutant_id, reason)?;
                ResultStatus::ExecutionError
            }
        };
        Ok(Some((mutant_id, status)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_mutant(
        &self,
        artifact: &Artifact,
        position: usize,
        total: usize,
        mutant_id: u32,
        display_name: String,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, SessionError> {
        events.emit(SessionEvent::MutantStarted {
            position,
            total,
            mutant_id,
            display_name,
        });

        let request = ExecutionRequest {
            artifact,
            active_mutant: Some(mutant_id),
            stop_on_error: true,
        };
        let verdict = match run_isolated(
            &self.sandboxes,
            request,
            Some(self.config.mutant_timeout()),
            cancel,
        )
        .await
        {
            Ok(IsolatedRun::Finished(result)) => {
                Some(Verdict::Status(ResultStatus::from_test_status(result.status)))
            }
            Ok(IsolatedRun::Cancelled) => None,
            Err(err) if self.config.isolate_sandbox_failures => {
                warn!(mutant_id, error = %err, "sandbox failed, mutant not evaluated");
                Some(Verdict::Error(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Evaluation { mutant_id, verdict })
    }
}
