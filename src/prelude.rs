//! Prelude module for convenient imports.
//!
//! # Example
//!
//! ```rust,ignore
//! use mutant_playground::prelude::*;
//! ```

pub use crate::session::{
    CommandCompiler, CompilationInput, Compiler, EventSink, MutationScore, Orchestrator,
    ProcessSandboxProvider, ReportFormat, ResultStatus, SandboxProvider, SessionConfig,
    SessionEvent, SessionOutcome, render_report,
};

pub use tokio_util::sync::CancellationToken;
