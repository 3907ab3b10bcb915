use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mutant_playground::session::{
    CommandCompiler, CompilationInput, Diagnostic, DiagnosticSummary, Orchestrator,
    ProcessSandboxProvider, Reference, ReportFormat, SessionConfig, SessionEvent, SessionOutcome,
    TestRunStatus, UnitTestOutcome, render_report,
};

#[derive(Debug, Parser)]
#[command(name = "mutant-playground")]
#[command(about = "Run a mutation test session over one program and its tests")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile, verify the baseline, then evaluate every mutant.
    Mutate {
        #[command(flatten)]
        session: SessionArgs,
        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,
        /// Write the report to this file instead of stdout.
        #[arg(long)]
        report_out: Option<PathBuf>,
    },
    /// Compile and run the tests once, without mutants.
    Test {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Program source file.
    #[arg(long)]
    source: PathBuf,
    /// Test suite source file.
    #[arg(long)]
    tests: PathBuf,
    /// Build program, run in a scratch directory.
    #[arg(long, env = "MUTANT_PLAYGROUND_BUILD")]
    build: String,
    /// Extra argument for the build program. Repeatable.
    #[arg(long = "build-arg", allow_hyphen_values = true)]
    build_args: Vec<String>,
    /// Program used to launch the test artifact, e.g. `sh`.
    #[arg(long, env = "MUTANT_PLAYGROUND_LAUNCHER")]
    launcher: Option<String>,
    /// Binary reference handed to the build. Repeatable.
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    /// Namespace imported implicitly into both sources. Repeatable.
    #[arg(long = "namespace")]
    namespaces: Vec<String>,
    /// Session config file (JSON). Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Per-mutant timeout in milliseconds.
    #[arg(long, env = "MUTANT_PLAYGROUND_TIMEOUT_MS")]
    timeout_ms: Option<u64>,
    /// Baseline test run timeout in milliseconds.
    #[arg(long, env = "MUTANT_PLAYGROUND_BASELINE_TIMEOUT_MS")]
    baseline_timeout_ms: Option<u64>,
    /// Mutants evaluated at once.
    #[arg(long, env = "MUTANT_PLAYGROUND_CONCURRENCY")]
    concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
    /// JSON safe to embed in an HTML page
    HtmlJson,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Md => ReportFormat::Markdown,
            OutputFormat::Json => ReportFormat::Json,
            OutputFormat::HtmlJson => ReportFormat::HtmlSafeJson,
        }
    }
}

fn make_config(args: &SessionArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config = config.with_mutant_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(timeout_ms) = args.baseline_timeout_ms {
        config = config.with_baseline_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    Ok(config)
}

fn read_input(args: &SessionArgs) -> Result<CompilationInput> {
    let read = |path: &Path| {
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    };
    let references = args
        .references
        .iter()
        .map(|path| {
            let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            Ok(Reference { name, bytes })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CompilationInput {
        source_code: read(&args.source)?,
        test_code: read(&args.tests)?,
        references,
        namespaces: args.namespaces.clone(),
    })
}

fn make_orchestrator(
    args: &SessionArgs,
    config: SessionConfig,
) -> Orchestrator<CommandCompiler, ProcessSandboxProvider> {
    let compiler = CommandCompiler::new(args.build.clone(), args.build_args.clone());
    let mut sandboxes = ProcessSandboxProvider::new();
    if let Some(launcher) = &args.launcher {
        sandboxes = sandboxes.with_launcher(launcher.clone());
    }
    Orchestrator::new(compiler, sandboxes, config)
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    let summary = DiagnosticSummary::from_diagnostics(diagnostics);
    println!("{}", summary.headline());
    for diagnostic in summary.error_diagnostics {
        println!("{diagnostic}");
    }
}

fn print_event(event: SessionEvent) {
    // Compilation failures are reported with their diagnostics, test results
    // after the test output.
    if !matches!(
        event,
        SessionEvent::CompilationFailed { .. } | SessionEvent::TestsFinished { .. }
    ) {
        println!("{event}");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || on_interrupt.cancel()).context("installing Ctrl-C handler")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;

    let succeeded = match cli.command {
        Command::Mutate {
            session,
            format,
            report_out,
        } => {
            let config = make_config(&session)?;
            let input = read_input(&session)?;
            let orchestrator = make_orchestrator(&session, config);
            let outcome =
                runtime.block_on(orchestrator.run_session(&input, &print_event, &cancel))?;
            match outcome {
                SessionOutcome::CompilationFailed { diagnostics } => {
                    print_diagnostics(&diagnostics);
                    false
                }
                SessionOutcome::BaselineTestsFailed { .. } => false,
                SessionOutcome::Cancelled { .. } => {
                    println!("Session cancelled");
                    false
                }
                SessionOutcome::Completed(report) => {
                    let rendered = render_report(&report, format.into())?;
                    match report_out {
                        Some(path) => fs::write(&path, rendered)
                            .with_context(|| format!("writing {}", path.display()))?,
                        None => println!("{rendered}"),
                    }
                    true
                }
            }
        }
        Command::Test { session } => {
            let config = make_config(&session)?;
            let input = read_input(&session)?;
            let orchestrator = make_orchestrator(&session, config);
            let outcome =
                runtime.block_on(orchestrator.run_unit_tests(&input, &print_event, &cancel))?;
            match outcome {
                UnitTestOutcome::CompilationFailed { diagnostics } => {
                    print_diagnostics(&diagnostics);
                    false
                }
                UnitTestOutcome::Finished(result) => {
                    for line in &result.output {
                        println!("{line}");
                    }
                    println!("{}", result.result_message());
                    result.status == TestRunStatus::Passed
                }
                UnitTestOutcome::Cancelled => {
                    println!("Test run cancelled");
                    false
                }
            }
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
