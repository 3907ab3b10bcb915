//! Report tree assembly and rendering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::compile::SourceDocument;
use super::config::Thresholds;
use super::mutant::{Mutant, MutantRegistry, ResultStatus, SourceSpan};
use super::score::{MutationScore, ScoreSummary, compute_score};

/// Version of the report layout.
pub const REPORT_SCHEMA_VERSION: &str = "1";

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary and mutant table.
    Markdown,
    /// Pretty-printed JSON report tree.
    Json,
    /// Compact JSON safe to embed in HTML.
    HtmlSafeJson,
}

/// Report status names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    /// Detected by a failing test.
    Killed,
    /// Not detected.
    Survived,
    /// Did not finish in time.
    Timeout,
    /// Sandbox failure.
    RuntimeError,
    /// Not evaluated.
    Pending,
}

impl From<ResultStatus> for ReportStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Killed => Self::Killed,
            ResultStatus::Survived => Self::Survived,
            ResultStatus::Timeout => Self::Timeout,
            ResultStatus::ExecutionError => Self::RuntimeError,
            ResultStatus::NotRun => Self::Pending,
        }
    }
}

/// Grade of a score against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBand {
    /// At or above the high threshold.
    High,
    /// Between the thresholds.
    Medium,
    /// Below the low threshold.
    Low,
    /// No score.
    #[serde(rename = "n/a")]
    NotApplicable,
}

impl ScoreBand {
    /// Grade a score.
    pub fn grade(score: MutationScore, thresholds: &Thresholds) -> Self {
        match score {
            MutationScore::NotApplicable => Self::NotApplicable,
            MutationScore::Percent(value) if value >= thresholds.high => Self::High,
            MutationScore::Percent(value) if value >= thresholds.low => Self::Medium,
            MutationScore::Percent(_) => Self::Low,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::NotApplicable => "n/a",
        }
    }
}

/// One mutant in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutantReport {
    /// Mutant id.
    pub id: String,
    /// Mutation operator.
    pub mutator_name: String,
    /// Display name.
    pub description: String,
    /// Replacement snippet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// Mutated region.
    pub location: SourceSpan,
    /// Classification.
    pub status: ReportStatus,
    /// Error detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

impl From<&Mutant> for MutantReport {
    fn from(mutant: &Mutant) -> Self {
        Self {
            id: mutant.id.to_string(),
            mutator_name: mutant.mutator_name.clone(),
            description: mutant.display_name.clone(),
            replacement: mutant.replacement.clone(),
            location: mutant.location,
            status: mutant.status.into(),
            status_reason: mutant.status_reason.clone(),
        }
    }
}

/// One source document and its mutants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    /// Source language.
    pub language: String,
    /// Original source text.
    pub source: String,
    /// Mutants in injection order.
    pub mutants: Vec<MutantReport>,
    /// Grade of the document's score.
    pub score_band: ScoreBand,
}

/// Serializable, format-independent view of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTree {
    /// Layout version.
    pub schema_version: String,
    /// Thresholds used for grading.
    pub thresholds: Thresholds,
    /// Overall score.
    pub mutation_score: MutationScore,
    /// Documents keyed by path.
    pub files: BTreeMap<String, FileReport>,
}

impl ReportTree {
    /// JSON that can be placed inside a `<script>` element or attribute
    /// without further escaping.
    pub fn to_json_html_safe(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(escape_json_for_html(&json))
    }
}

fn escape_json_for_html(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        // These only occur inside JSON strings, where \u escapes are equivalent.
        match ch {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\'' => out.push_str("\\u0027"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    out
}

/// Build the report tree from the original document and the classified mutants.
pub fn build_report(
    document: &SourceDocument,
    registry: &MutantRegistry,
    thresholds: Thresholds,
) -> ReportTree {
    let mutation_score = compute_score(registry);
    let file = FileReport {
        language: document.language.clone(),
        source: document.text.clone(),
        mutants: registry.mutants().iter().map(MutantReport::from).collect(),
        score_band: ScoreBand::grade(mutation_score, &thresholds),
    };

    ReportTree {
        schema_version: REPORT_SCHEMA_VERSION.to_string(),
        thresholds,
        mutation_score,
        files: BTreeMap::from([(document.path.clone(), file)]),
    }
}

/// Everything a completed session produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// Classified mutants.
    pub registry: MutantRegistry,
    /// Status counts.
    pub summary: ScoreSummary,
    /// Overall score.
    pub score: MutationScore,
    /// Report tree.
    pub tree: ReportTree,
}

impl SessionReport {
    /// Assemble score, summary and tree from a classified registry.
    pub fn assemble(
        document: &SourceDocument,
        registry: MutantRegistry,
        thresholds: Thresholds,
    ) -> Self {
        let summary = ScoreSummary::from_registry(&registry);
        let tree = build_report(document, &registry, thresholds);
        Self {
            score: summary.score(),
            summary,
            registry,
            tree,
        }
    }
}

/// Render a session report.
pub fn render_report(
    report: &SessionReport,
    format: ReportFormat,
) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Json => serde_json::to_string_pretty(&report.tree),
        ReportFormat::HtmlSafeJson => report.tree.to_json_html_safe(),
        ReportFormat::Markdown => Ok(render_markdown(report)),
    }
}

fn render_markdown(report: &SessionReport) -> String {
    let summary = &report.summary;
    let mut out = String::from("# Mutation Report\n\n");

    out.push_str("| metric | count |\n|---|---:|\n");
    out.push_str(&format!("| total | {} |\n", summary.total));
    out.push_str(&format!("| killed | {} |\n", summary.killed));
    out.push_str(&format!("| survived | {} |\n", summary.survived));
    out.push_str(&format!("| timeout | {} |\n", summary.timeout));
    out.push_str(&format!("| execution error | {} |\n", summary.execution_error));
    out.push_str(&format!("| not run | {} |\n", summary.not_run));
    out.push_str(&format!("| mutation score | {} |\n", report.score));

    for (path, file) in &report.tree.files {
        out.push_str(&format!("\n## {path} ({})\n\n", file.score_band.as_str()));
        if file.mutants.is_empty() {
            out.push_str("No mutants were generated.\n");
            continue;
        }
        out.push_str("| id | mutator | status | location | description |\n");
        out.push_str("|---:|---|---|---|---|\n");
        for m in &file.mutants {
            out.push_str(&format!(
                "| {} | {} | {:?} | {}:{}-{}:{} | {} |\n",
                m.id,
                m.mutator_name,
                m.status,
                m.location.start.line,
                m.location.start.column,
                m.location.end.line,
                m.location.end.column,
                m.description.replace('|', "\\|"),
            ));
        }
    }

    out
}
