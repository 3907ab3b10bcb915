//! Compilation data model, the compiler contract and a build-command adapter.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use super::mutant::{Mutant, Position, SourceSpan};

/// File the build command must leave behind.
pub const ARTIFACT_FILE: &str = "artifact";
/// Mutant manifest written by mutated builds.
pub const MUTANT_MANIFEST_FILE: &str = "mutants.json";

/// Set to `1` for mutated builds, `0` otherwise.
pub const ENV_MUTATE: &str = "MUTANT_PLAYGROUND_MUTATE";
/// Directory holding the binary references.
pub const ENV_REFS_DIR: &str = "MUTANT_PLAYGROUND_REFS_DIR";
/// Comma-separated implicit namespace imports.
pub const ENV_NAMESPACES: &str = "MUTANT_PLAYGROUND_NAMESPACES";

/// A binary reference made available to the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// File name of the reference.
    pub name: String,
    /// Reference contents.
    pub bytes: Vec<u8>,
}

/// Everything needed for one compilation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompilationInput {
    /// Program source.
    pub source_code: String,
    /// Test suite source.
    pub test_code: String,
    /// Binary references.
    pub references: Vec<Reference>,
    /// Namespaces imported implicitly into both sources.
    pub namespaces: Vec<String>,
}

/// Compiled, runnable output. Cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact(Arc<[u8]>);

impl Artifact {
    /// Raw artifact bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Artifact {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Artifact({} bytes)", self.0.len())
    }
}

/// Diagnostic severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Not shown to users.
    Hidden,
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error; fails the compilation.
    Error,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One compiler message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity.
    pub severity: Severity,
    /// Message text.
    pub message: String,
    /// File the message refers to.
    pub file: Option<String>,
    /// Source region the message refers to.
    pub span: Option<SourceSpan>,
}

impl Diagnostic {
    /// Diagnostic without a location.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            span: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
            if let Some(span) = &self.span {
                write!(f, "{}:{}:", span.start.line, span.start.column)?;
            }
            f.write_str(" ")?;
        }
        write!(f, "{}: {}", self.severity.as_str(), self.message)
    }
}

/// Diagnostics grouped by severity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticSummary<'a> {
    /// Error count.
    pub errors: usize,
    /// Warning count.
    pub warnings: usize,
    /// The error diagnostics, in order.
    pub error_diagnostics: Vec<&'a Diagnostic>,
}

impl<'a> DiagnosticSummary<'a> {
    /// Group a diagnostic list.
    pub fn from_diagnostics(diagnostics: &'a [Diagnostic]) -> Self {
        let error_diagnostics: Vec<&Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        Self {
            errors: error_diagnostics.len(),
            warnings: diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Warning)
                .count(),
            error_diagnostics,
        }
    }

    /// One-line headline for the transcript.
    pub fn headline(&self) -> String {
        format!(
            "Compilation failed with {} errors and {} warnings",
            self.errors, self.warnings
        )
    }
}

/// Handle to the unmutated source, used to anchor the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Document path as shown in reports.
    pub path: String,
    /// Source language.
    pub language: String,
    /// Full original text.
    pub text: String,
}

/// Output of one compilation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompilationResult {
    /// Whether the compiler reported success.
    pub success: bool,
    /// Runnable artifact.
    pub artifact: Option<Artifact>,
    /// Compiler messages in emission order.
    pub diagnostics: Vec<Diagnostic>,
    /// Mutants, only for mutated compilations.
    pub mutants: Vec<Mutant>,
    /// Original document, only for mutated compilations.
    pub original_document: Option<SourceDocument>,
}

impl CompilationResult {
    /// Successful compilation with an artifact.
    pub fn succeeded(artifact: Artifact) -> Self {
        Self {
            success: true,
            artifact: Some(artifact),
            ..Self::default()
        }
    }

    /// Failed compilation.
    pub fn failed(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            success: false,
            diagnostics,
            ..Self::default()
        }
    }

    /// Attach mutants and the original document.
    pub fn with_mutants(mut self, mutants: Vec<Mutant>, document: SourceDocument) -> Self {
        self.mutants = mutants;
        self.original_document = Some(document);
        self
    }

    /// The artifact, if the compilation can be executed.
    pub fn runnable_artifact(&self) -> Option<&Artifact> {
        if self.success { self.artifact.as_ref() } else { None }
    }
}

/// Compiler infrastructure errors. Ordinary compile errors are diagnostics, not this.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Build program is not installed.
    #[error("build program `{0}` was not found")]
    MissingProgram(String),
    /// Mutant manifest is malformed.
    #[error("invalid mutant manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compiler contract. Must be deterministic for identical input.
pub trait Compiler {
    /// Compile without mutations.
    fn compile(
        &self,
        input: &CompilationInput,
    ) -> impl Future<Output = Result<CompilationResult, CompileError>> + Send;

    /// Compile with every mutant injected. The artifact activates one mutant
    /// at runtime by id. Also returns the mutant list and the original document.
    fn compile_with_mutations(
        &self,
        input: &CompilationInput,
    ) -> impl Future<Output = Result<CompilationResult, CompileError>> + Send;
}

/// Runs a user-supplied build command in a scratch directory.
///
/// The command finds `source.txt` and `tests.txt` (names configurable) in its
/// working directory, references under `refs/`, and must leave the runnable
/// test artifact in `artifact`. Mutated builds also write `mutants.json`.
/// Output lines shaped like `[path:line:col: ]error: message` become diagnostics.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
    source_file: String,
    test_file: String,
    language: String,
}

impl CommandCompiler {
    /// Build command with arguments.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            source_file: "source.txt".to_string(),
            test_file: "tests.txt".to_string(),
            language: "text".to_string(),
        }
    }

    /// Override the file names the sources are written to.
    pub fn with_file_names(mut self, source: impl Into<String>, tests: impl Into<String>) -> Self {
        self.source_file = source.into();
        self.test_file = tests.into();
        self
    }

    /// Language recorded in reports.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    async fn build(
        &self,
        input: &CompilationInput,
        mutate: bool,
    ) -> Result<CompilationResult, CompileError> {
        let scratch = tempfile::Builder::new()
            .prefix("mutant-playground-build-")
            .tempdir()?;
        let dir = scratch.path();

        tokio::fs::write(dir.join(&self.source_file), &input.source_code).await?;
        tokio::fs::write(dir.join(&self.test_file), &input.test_code).await?;
        let refs_dir = dir.join("refs");
        tokio::fs::create_dir_all(&refs_dir).await?;
        for (idx, reference) in input.references.iter().enumerate() {
            let name = Path::new(&reference.name)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("reference-{idx}"));
            tokio::fs::write(refs_dir.join(name), &reference.bytes).await?;
        }

        debug!(program = %self.program, mutate, "running build command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(dir)
            .env(ENV_MUTATE, if mutate { "1" } else { "0" })
            .env(ENV_REFS_DIR, &refs_dir)
            .env(ENV_NAMESPACES, input.namespaces.join(","))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => CompileError::MissingProgram(self.program.clone()),
                _ => CompileError::Io(err),
            })?;

        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let mut diagnostics = Self::parse_diagnostics(&text);
        let has_errors = diagnostics.iter().any(|d| d.severity == Severity::Error);

        if !output.status.success() {
            if !has_errors {
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    format!("build command exited with {}", output.status),
                ));
            }
            return Ok(CompilationResult::failed(diagnostics));
        }
        if has_errors {
            return Ok(CompilationResult::failed(diagnostics));
        }

        let artifact = match tokio::fs::read(dir.join(ARTIFACT_FILE)).await {
            Ok(bytes) => Artifact::from(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    format!("build command did not produce `{ARTIFACT_FILE}`"),
                ));
                return Ok(CompilationResult::failed(diagnostics));
            }
            Err(err) => return Err(err.into()),
        };

        let mut result = CompilationResult::succeeded(artifact);
        result.diagnostics = diagnostics;
        if !mutate {
            return Ok(result);
        }

        let mutants = match tokio::fs::read_to_string(dir.join(MUTANT_MANIFEST_FILE)).await {
            Ok(raw) => serde_json::from_str::<Vec<Mutant>>(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let document = SourceDocument {
            path: self.source_file.clone(),
            language: self.language.clone(),
            text: input.source_code.clone(),
        };
        Ok(result.with_mutants(mutants, document))
    }

    fn parse_diagnostics(text: &str) -> Vec<Diagnostic> {
        text.lines().filter_map(Self::parse_diagnostic).collect()
    }

    fn parse_diagnostic(line: &str) -> Option<Diagnostic> {
        const MARKERS: [(&str, Severity); 4] = [
            ("error: ", Severity::Error),
            ("warning: ", Severity::Warning),
            ("info: ", Severity::Info),
            ("hidden: ", Severity::Hidden),
        ];

        let line = line.trim();
        // (marker start, message start, severity); earliest marker wins.
        let mut best: Option<(usize, usize, Severity)> = None;
        for (marker, severity) in MARKERS {
            let found = if line.starts_with(marker) {
                Some((0, marker.len()))
            } else {
                line.find(&format!(": {marker}"))
                    .map(|at| (at, at + 2 + marker.len()))
            };
            if let Some((at, message_at)) = found {
                if best.is_none_or(|(current, _, _)| at < current) {
                    best = Some((at, message_at, severity));
                }
            }
        }

        let (at, message_at, severity) = best?;
        let mut diagnostic = Diagnostic::new(severity, line[message_at..].trim());
        if at > 0 {
            let (file, span) = Self::parse_location(&line[..at]);
            diagnostic.file = Some(file);
            diagnostic.span = span;
        }
        Some(diagnostic)
    }

    fn parse_location(location: &str) -> (String, Option<SourceSpan>) {
        let parts: Vec<&str> = location.rsplitn(3, ':').collect();
        if let [column, line, file] = parts.as_slice() {
            if let (Ok(line), Ok(column)) = (line.parse(), column.parse()) {
                let position = Position { line, column };
                return (
                    file.to_string(),
                    Some(SourceSpan {
                        start: position,
                        end: position,
                    }),
                );
            }
        }
        (location.to_string(), None)
    }
}

impl Compiler for CommandCompiler {
    async fn compile(&self, input: &CompilationInput) -> Result<CompilationResult, CompileError> {
        self.build(input, false).await
    }

    async fn compile_with_mutations(
        &self,
        input: &CompilationInput,
    ) -> Result<CompilationResult, CompileError> {
        self.build(input, true).await
    }
}
