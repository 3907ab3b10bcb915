//! Mutation test session orchestration.

pub mod compile;
pub mod config;
pub mod events;
pub mod mutant;
pub mod orchestrator;
pub mod report;
pub mod sandbox;
pub mod score;

pub use compile::{
    Artifact, CommandCompiler, CompilationInput, CompilationResult, CompileError, Compiler,
    Diagnostic, DiagnosticSummary, Reference, Severity, SourceDocument,
};
pub use config::{ConfigError, SessionConfig, Thresholds};
pub use events::{EventSink, NullSink, SessionEvent};
pub use mutant::{Mutant, MutantRegistry, Position, RegistryError, ResultStatus, SourceSpan};
pub use orchestrator::{Orchestrator, SessionError, SessionOutcome, UnitTestOutcome};
pub use report::{
    ReportFormat, ReportStatus, ReportTree, ScoreBand, SessionReport, build_report, render_report,
};
pub use sandbox::{
    ExecutionRequest, IsolatedRun, ProcessSandbox, ProcessSandboxProvider, Sandbox, SandboxError,
    SandboxProvider, TestRunResult, TestRunStatus, run_isolated,
};
pub use score::{MutationScore, ScoreSummary, compute_score};
