use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use colored::Colorize;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ReviewError;
use crate::pipeline::Stage;
use crate::review::{Issue, ReviewResult, ReviewStatus, Severity};

const HTML_TEMPLATE_NAME: &str = "report";
const HTML_TEMPLATE: &str = include_str!("templates/report.html.hbs");

const CONSOLE_ISSUES: usize = 3;
const CONSOLE_IMPROVEMENTS: usize = 2;
const CONSOLE_POSITIVES: usize = 2;
const CONSOLE_COMMENTARY_CHARS: usize = 500;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Done,
    Failed { stage: Stage, message: String },
}

/// Everything produced by one run, in enumeration order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub target: String,
    pub model: String,
    pub generated_at: DateTime<Local>,
    pub elapsed: Duration,
    pub outcome: RunOutcome,
    pub results: Vec<ReviewResult>,
}

/// Aggregate counts derived from a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_files: usize,
    pub reviewed: usize,
    pub errors: usize,
    pub skipped: usize,
    /// Mean over files with a structured score, rounded to one decimal.
    pub average_score: Option<f32>,
    pub total_issues: usize,
}

impl RunReport {
    pub fn new(
        target: String,
        model: String,
        elapsed: Duration,
        outcome: RunOutcome,
        results: Vec<ReviewResult>,
    ) -> Self {
        Self {
            target,
            model,
            generated_at: Local::now(),
            elapsed,
            outcome,
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Done
    }

    pub fn summary(&self) -> Summary {
        let count = |status: ReviewStatus| self.results.iter().filter(|r| r.status == status).count();
        let scores: Vec<f32> = self.results.iter().filter_map(ReviewResult::score).collect();
        let average_score = if scores.is_empty() {
            None
        } else {
            let mean = scores.iter().sum::<f32>() / scores.len() as f32;
            Some((mean * 10.0).round() / 10.0)
        };
        Summary {
            total_files: self.results.len(),
            reviewed: count(ReviewStatus::Ok),
            errors: count(ReviewStatus::Error),
            skipped: count(ReviewStatus::Skipped),
            average_score,
            total_issues: self.results.iter().map(ReviewResult::issue_count).sum(),
        }
    }
}

/// Output styles for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
    Html,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Human => "txt",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
        }
    }
}

/// Produce a report string in the requested format.
pub fn render_report(report: &RunReport, format: OutputFormat) -> Result<String, ReviewError> {
    match format {
        OutputFormat::Human => render_human(report),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&JsonReport::from(report))?),
        OutputFormat::Html => render_html(report),
    }
}

/// Render and save the report under `dir`, creating it when missing.
pub fn write_report(
    report: &RunReport,
    format: OutputFormat,
    dir: &Path,
) -> Result<PathBuf, ReviewError> {
    let rendered = render_report(report, format)?;
    fs::create_dir_all(dir).map_err(|err| ReviewError::io(dir.display(), err))?;
    let path = dir.join(report_file_name(
        &report.target,
        &report.generated_at,
        format.extension(),
    ));
    fs::write(&path, rendered).map_err(|err| ReviewError::io(path.display(), err))?;
    info!(path = %path.display(), "report written");
    Ok(path)
}

/// `code_review_{target}_{YYYYmmdd_HHMMSS}.{ext}` with the target made
/// filesystem-safe.
pub fn report_file_name(target: &str, at: &DateTime<Local>, extension: &str) -> String {
    let safe: String = target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = if safe.trim_matches('_').is_empty() {
        "local".to_string()
    } else {
        safe
    };
    format!(
        "code_review_{safe}_{}.{extension}",
        at.format("%Y%m%d_%H%M%S")
    )
}

pub fn score_badge(score: f32) -> &'static str {
    match ScoreBand::of(score) {
        ScoreBand::High => "✅",
        ScoreBand::Medium => "⚠️",
        ScoreBand::Low => "❌",
    }
}

/// Score bands shared by the badge, console colour and HTML class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoreBand {
    High,
    Medium,
    Low,
}

impl ScoreBand {
    fn of(score: f32) -> Self {
        if score >= 8.0 {
            ScoreBand::High
        } else if score >= 6.0 {
            ScoreBand::Medium
        } else {
            ScoreBand::Low
        }
    }

    fn css_class(self) -> &'static str {
        match self {
            ScoreBand::High => "high",
            ScoreBand::Medium => "medium",
            ScoreBand::Low => "low",
        }
    }
}

fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::High => "🔴",
        Severity::Medium => "🟡",
        Severity::Low => "🟢",
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    humantime::format_duration(Duration::from_millis(millis)).to_string()
}

fn render_human(report: &RunReport) -> Result<String, ReviewError> {
    let summary = report.summary();
    let rule = "=".repeat(60);
    let mut out = String::new();

    writeln!(out, "{rule}")?;
    writeln!(out, "{} {}", "Code review:".bold(), report.target.bold())?;
    writeln!(out, "{rule}")?;
    writeln!(
        out,
        "Model: {}  Generated: {}",
        report.model,
        report.generated_at.format("%Y-%m-%d %H:%M:%S")
    )?;
    if let RunOutcome::Failed { stage, message } = &report.outcome {
        writeln!(
            out,
            "{}",
            format!("Run failed while {stage}: {message}").red().bold()
        )?;
    }

    writeln!(out)?;
    writeln!(out, "{}", "Summary:".bold())?;
    writeln!(
        out,
        "   • Files: {} (reviewed {}, errors {}, skipped {})",
        summary.total_files, summary.reviewed, summary.errors, summary.skipped
    )?;
    match summary.average_score {
        Some(score) => writeln!(out, "   • Average score: {score:.1}/10")?,
        None => writeln!(out, "   • Average score: n/a")?,
    }
    writeln!(out, "   • Total issues: {}", summary.total_issues)?;
    let secs = report.elapsed.as_secs_f64();
    let throughput = if secs > 0.0 {
        summary.reviewed as f64 / secs
    } else {
        0.0
    };
    writeln!(
        out,
        "   • Elapsed: {} ({throughput:.2} files/s)",
        format_elapsed(report.elapsed)
    )?;

    if report.results.is_empty() {
        writeln!(out)?;
        writeln!(out, "No files were reviewed.")?;
        return Ok(out);
    }

    writeln!(out)?;
    writeln!(out, "{}", "Results:".bold())?;
    writeln!(out, "{}", "-".repeat(60))?;
    for (idx, result) in report.results.iter().enumerate() {
        if idx > 0 {
            writeln!(out, "{}", "-".repeat(40))?;
        }
        render_human_result(&mut out, idx + 1, result)?;
    }
    writeln!(out, "{rule}")?;
    Ok(out)
}

fn render_human_result(
    out: &mut String,
    number: usize,
    result: &ReviewResult,
) -> Result<(), ReviewError> {
    match result.status {
        ReviewStatus::Error => {
            writeln!(out, "{number}. ❌ {}", result.path)?;
            writeln!(out, "   {} {}", "error:".red(), result.commentary)?;
            return Ok(());
        }
        ReviewStatus::Skipped => {
            writeln!(out, "{number}. ⏭️  {}", result.path)?;
            writeln!(out, "   {} {}", "skipped:".yellow(), result.commentary)?;
            return Ok(());
        }
        ReviewStatus::Ok => {}
    }

    let Some(review) = &result.review else {
        writeln!(out, "{number}. 💬 {}", result.path)?;
        writeln!(out, "   {}", truncate(&result.commentary, CONSOLE_COMMENTARY_CHARS))?;
        return Ok(());
    };

    match review.overall_score {
        Some(score) => {
            writeln!(out, "{number}. {} {}", score_badge(score), result.path)?;
            let label = format!("{score:.1}/10");
            let painted = match ScoreBand::of(score) {
                ScoreBand::High => label.green(),
                ScoreBand::Medium => label.yellow(),
                ScoreBand::Low => label.red(),
            };
            writeln!(out, "   Score: {painted}")?;
        }
        None => writeln!(out, "{number}. 💬 {}", result.path)?,
    }
    if !review.summary.trim().is_empty() {
        writeln!(out, "   {}", review.summary.trim())?;
    }
    if !review.issues.is_empty() {
        writeln!(out, "   Issues ({}):", review.issues.len())?;
        for issue in review.issues.iter().take(CONSOLE_ISSUES) {
            writeln!(out, "      {} {}", severity_marker(issue.severity), describe_issue(issue))?;
        }
        if review.issues.len() > CONSOLE_ISSUES {
            writeln!(out, "      ... and {} more", review.issues.len() - CONSOLE_ISSUES)?;
        }
    }
    if !review.improvements.is_empty() {
        writeln!(out, "   Improvements:")?;
        for item in review.improvements.iter().take(CONSOLE_IMPROVEMENTS) {
            writeln!(out, "      • {item}")?;
        }
    }
    if !review.positive_points.is_empty() {
        writeln!(out, "   Positives:")?;
        for item in review.positive_points.iter().take(CONSOLE_POSITIVES) {
            writeln!(out, "      • {item}")?;
        }
    }
    Ok(())
}

fn describe_issue(issue: &Issue) -> String {
    let message = if issue.message.trim().is_empty() {
        "N/A"
    } else {
        issue.message.trim()
    };
    match issue.line {
        Some(line) => format!("[{}] line {line}: {message}", issue.kind),
        None => format!("[{}] {message}", issue.kind),
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    let trimmed = input.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().take(max_chars).collect::<String>() + "…"
}

fn render_html(report: &RunReport) -> Result<String, ReviewError> {
    let mut registry = Handlebars::new();
    registry
        .register_template_string(HTML_TEMPLATE_NAME, HTML_TEMPLATE)
        .map_err(|err| ReviewError::Template(format!("HTML report: {err}")))?;

    let summary = report.summary();
    let (failure_stage, failure_message) = match &report.outcome {
        RunOutcome::Done => (None, None),
        RunOutcome::Failed { stage, message } => (Some(stage.to_string()), Some(message.clone())),
    };
    let files: Vec<_> = report
        .results
        .iter()
        .map(|result| {
            let review = result.review.as_ref();
            let score = result.score();
            json!({
                "path": result.path,
                "status": result.status,
                "commentary": result.commentary,
                "score": score.map(|s| format!("{s:.1}")),
                "score_class": score.map(|s| ScoreBand::of(s).css_class()),
                "badge": score.map(score_badge),
                "diff": result.diff,
                "issues": review.map(|r| r.issues.iter().map(|issue| json!({
                    "kind": issue.kind.to_uppercase(),
                    "severity": issue.severity.as_str(),
                    "line": issue.line,
                    "message": issue.message,
                    "suggestion": issue.suggestion,
                })).collect::<Vec<_>>()).unwrap_or_default(),
                "improvements": review.map(|r| r.improvements.clone()).unwrap_or_default(),
                "positive_points": review.map(|r| r.positive_points.clone()).unwrap_or_default(),
            })
        })
        .collect();

    let context = json!({
        "target": report.target,
        "model": report.model,
        "generated_at": report.generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        "elapsed": format_elapsed(report.elapsed),
        "failed": failure_stage.is_some(),
        "failure_stage": failure_stage,
        "failure_message": failure_message,
        "summary": summary,
        "average_score": summary
            .average_score
            .map(|score| format!("{score:.1}/10"))
            .unwrap_or_else(|| "n/a".into()),
        "files": files,
    });

    registry
        .render(HTML_TEMPLATE_NAME, &context)
        .map_err(|err| ReviewError::Template(format!("rendering HTML report failed: {err}")))
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    target: &'a str,
    model: &'a str,
    generated_at: &'a DateTime<Local>,
    elapsed_secs: f64,
    outcome: &'a RunOutcome,
    summary: Summary,
    files: &'a [ReviewResult],
}

impl<'a> From<&'a RunReport> for JsonReport<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            target: &report.target,
            model: &report.model,
            generated_at: &report.generated_at,
            elapsed_secs: (report.elapsed.as_secs_f64() * 10.0).round() / 10.0,
            outcome: &report.outcome,
            summary: report.summary(),
            files: &report.results,
        }
    }
}
