use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use llm_review_core::{
    check_connectivity, render_findings, render_report, write_report, ConfigSources,
    OllamaClient, OutputFormat, Overrides, Pipeline, ProgressSink, ReviewResult, RunConfig,
    SecretScanner, SourceInfo, SourceRef, Stage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "llm-review",
    author,
    version,
    about = "Review GitHub repositories, pull requests and local code with a local Ollama model",
    arg_required_else_help = true
)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["test", "repo", "pr", "local"])
))]
struct Cli {
    /// Check the GitHub token and the model server, then exit
    #[arg(long)]
    test: bool,

    /// Review the default branch of a repository
    #[arg(long, value_name = "OWNER/NAME")]
    repo: Option<String>,

    /// Review the files changed by a pull request (owner/name/number or owner/name#number)
    #[arg(long, value_name = "OWNER/NAME/NUMBER")]
    pr: Option<String>,

    /// Review a local directory
    #[arg(long, value_name = "DIR")]
    local: Option<PathBuf>,

    /// Only scan the local directory for hard-coded secrets
    #[arg(long, requires = "local")]
    security_check: bool,

    /// Do not scan the local directory for secrets before reviewing
    #[arg(long, requires = "local", conflicts_with = "security_check")]
    skip_security: bool,

    /// Maximum number of files to review
    #[arg(long, value_name = "N")]
    max_files: Option<usize>,

    /// Where the report goes
    #[arg(long, value_enum, default_value_t = OutputMode::All)]
    output: OutputMode,

    /// `.env` file with settings; ignored when missing
    #[arg(long, value_name = "FILE", default_value = ".env")]
    env_file: PathBuf,

    /// Optional TOML, YAML or JSON settings file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for saved reports
    #[arg(long, value_name = "DIR")]
    reports_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputMode {
    Console,
    Html,
    Json,
    All,
}

impl OutputMode {
    fn formats(self) -> &'static [OutputFormat] {
        match self {
            OutputMode::Console => &[OutputFormat::Human],
            OutputMode::Html => &[OutputFormat::Html],
            OutputMode::Json => &[OutputFormat::Json],
            OutputMode::All => &[OutputFormat::Human, OutputFormat::Json, OutputFormat::Html],
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(err) => {
                print_error(&err);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n{}", "Interrupted.".yellow());
            ExitCode::from(INTERRUPTED)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let sources = ConfigSources {
        env_file: Some(cli.env_file.clone()),
        config_file: cli.config.clone(),
        environment: None,
    };
    let overrides = Overrides {
        max_files: cli.max_files,
        reports_dir: cli.reports_dir.clone(),
    };
    let config = RunConfig::load(&sources, &overrides).context("failed to load configuration")?;

    if cli.test {
        return connectivity(&config).await;
    }
    if let Some(dir) = &cli.local {
        if cli.security_check {
            return security_only(dir);
        }
        if !cli.skip_security && !security_gate(dir).await? {
            println!("Review cancelled.");
            return Ok(ExitCode::FAILURE);
        }
        return review(&config, SourceRef::local(dir), cli.output).await;
    }
    if let Some(repo) = &cli.repo {
        let source = SourceRef::parse_repository(repo)?;
        return review(&config, source, cli.output).await;
    }
    if let Some(pr) = &cli.pr {
        let source = SourceRef::parse_pull_request(pr)?;
        return review(&config, source, cli.output).await;
    }
    Ok(ExitCode::SUCCESS)
}

async fn connectivity(config: &RunConfig) -> Result<ExitCode> {
    let client = OllamaClient::new(&config.model)?;
    let outcomes = check_connectivity(config, &client).await;
    for outcome in &outcomes {
        let verdict = if outcome.ok {
            "ok".green()
        } else {
            "FAILED".red().bold()
        };
        println!("Checking {} ... {verdict} ({})", outcome.name, outcome.detail);
    }
    if outcomes.iter().all(|outcome| outcome.ok) {
        println!("{}", "All checks passed.".green());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn security_only(dir: &Path) -> Result<ExitCode> {
    let findings = SecretScanner::new()?
        .scan_directory(dir)
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    print!("{}", render_findings(&findings));
    Ok(if findings.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Scan before a local review; `false` when the user declines to continue.
async fn security_gate(dir: &Path) -> Result<bool> {
    let findings = SecretScanner::new()?
        .scan_directory(dir)
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    if findings.is_empty() {
        return Ok(true);
    }
    print!("{}", render_findings(&findings));
    println!("Continue with the review anyway? [y/N] ");
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .context("failed to read answer")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn review(config: &RunConfig, source: SourceRef, output: OutputMode) -> Result<ExitCode> {
    let client = OllamaClient::new(&config.model)?;
    let progress = BarProgress::new();
    let pipeline = Pipeline::new(config, &client)?.with_progress(&progress);
    let outcome = pipeline.run(&source).await;
    progress.finish();
    let report = outcome?;

    for format in output.formats() {
        match format {
            OutputFormat::Human => print!("{}", render_report(&report, *format)?),
            _ => {
                let path = write_report(&report, *format, &config.reports_dir)
                    .context("failed to save report")?;
                println!("Report saved to {}", path.display());
            }
        }
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Progress bar on stderr; hidden when stderr is not a terminal.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let bar = if std::io::stderr().is_terminal() {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg} ({elapsed})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        } else {
            ProgressBar::hidden()
        };
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarProgress {
    fn stage(&self, stage: Stage) {
        self.bar.set_message(stage.to_string());
    }

    fn source_opened(&self, info: &SourceInfo) {
        let line = match info {
            SourceInfo::Repository(repo) => format!(
                "Repository {} ({} stars, branch {}){}",
                repo.full_name,
                repo.stars,
                repo.default_branch,
                repo.description
                    .as_deref()
                    .map(|text| format!(": {text}"))
                    .unwrap_or_default()
            ),
            SourceInfo::PullRequest(pr) => format!(
                "Pull request #{} by {} [{}]: {}",
                pr.number, pr.author, pr.state, pr.title
            ),
            SourceInfo::Local { root } => format!("Local directory {}", root.display()),
        };
        self.bar.println(line);
    }

    fn batches_planned(&self, files: usize, batches: usize) {
        self.bar.set_length(self.bar.position() + files as u64);
        self.bar
            .println(format!("Reviewing {files} file(s) in {batches} batch(es)"));
    }

    fn file_finished(&self, result: &ReviewResult) {
        self.bar.inc(1);
        tracing::debug!(path = %result.path, status = ?result.status, "file finished");
    }
}

/// Print the error and any causes not already part of its message.
fn print_error(err: &anyhow::Error) {
    let mut message = err.to_string();
    for cause in err.chain().skip(1) {
        let cause = cause.to_string();
        if !message.contains(&cause) {
            message.push_str(": ");
            message.push_str(&cause);
        }
    }
    eprintln!("{} {message}", "error:".red().bold());
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
