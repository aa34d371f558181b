//! Model-backed review of fetched files.

pub mod ollama;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ReviewError;
use crate::retry::RetryPolicy;
use crate::source::{DiffStats, FileCandidate};

pub use ollama::OllamaClient;
pub use prompt::{detect_language, parse_review_response, PromptTemplate, SourceDocument};

/// Raw model text kept as commentary when a review has no summary.
const COMMENTARY_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

impl From<String> for Severity {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" | "error" => Severity::High,
            "low" | "info" | "minor" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type", default = "default_issue_kind", deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, deserialize_with = "lenient_line")]
    pub line: Option<u32>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: String,
    #[serde(default, deserialize_with = "lenient_optional_string")]
    pub suggestion: Option<String>,
}

fn default_issue_kind() -> String {
    "general".into()
}

/// Structured review of a single file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileReview {
    /// 0 to 10; out-of-range values are clamped.
    #[serde(default, deserialize_with = "lenient_score")]
    pub overall_score: Option<f32>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub summary: String,
    #[serde(default, deserialize_with = "lenient_issues")]
    pub issues: Vec<Issue>,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub improvements: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub positive_points: Vec<String>,
}

/// Outcome for one file that survived filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewResult {
    pub path: String,
    pub status: ReviewStatus,
    pub commentary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<FileReview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffStats>,
    #[serde(skip)]
    pub ordinal: usize,
}

impl ReviewResult {
    pub fn ok(candidate: &FileCandidate, commentary: String, review: Option<FileReview>) -> Self {
        Self::build(candidate, ReviewStatus::Ok, commentary, review)
    }

    pub fn error(candidate: &FileCandidate, message: impl Into<String>) -> Self {
        Self::build(candidate, ReviewStatus::Error, message.into(), None)
    }

    pub fn skipped(candidate: &FileCandidate, reason: impl Into<String>) -> Self {
        Self::build(candidate, ReviewStatus::Skipped, reason.into(), None)
    }

    fn build(
        candidate: &FileCandidate,
        status: ReviewStatus,
        commentary: String,
        review: Option<FileReview>,
    ) -> Self {
        Self {
            path: candidate.path.clone(),
            status,
            commentary,
            review,
            diff: candidate.diff,
            ordinal: candidate.ordinal,
        }
    }

    pub fn score(&self) -> Option<f32> {
        self.review.as_ref().and_then(|review| review.overall_score)
    }

    pub fn issue_count(&self) -> usize {
        self.review.as_ref().map_or(0, |review| review.issues.len())
    }
}

/// Models pulled on the model server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelHealth {
    pub available_models: Vec<String>,
}

impl ModelHealth {
    /// `codellama` matches `codellama` and any tag such as `codellama:latest`.
    pub fn has_model(&self, model: &str) -> bool {
        self.available_models.iter().any(|name| {
            name == model
                || (!model.contains(':')
                    && name
                        .strip_prefix(model)
                        .is_some_and(|rest| rest.starts_with(':')))
        })
    }
}

/// Request/response access to a text generation model.
#[async_trait]
pub trait ReviewClient: Send + Sync {
    /// Model name used for generation.
    fn model(&self) -> &str;

    /// List the models the server can run; an unreachable server is
    /// [`ReviewError::ServiceUnavailable`].
    async fn health(&self) -> Result<ModelHealth, ReviewError>;

    async fn generate(&self, prompt: &str) -> Result<String, ReviewError>;
}

/// A file whose content was fetched and is ready for review.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub candidate: FileCandidate,
    pub content: String,
}

impl LoadedFile {
    fn document(&self) -> SourceDocument {
        SourceDocument::new(self.candidate.path.clone(), self.content.clone())
    }
}

/// Sends batches to a [`ReviewClient`] and attributes the answer to files.
pub struct Reviewer<'a> {
    client: &'a dyn ReviewClient,
    template: &'a PromptTemplate,
    retry: RetryPolicy,
}

impl<'a> Reviewer<'a> {
    pub fn new(client: &'a dyn ReviewClient, template: &'a PromptTemplate, retry: RetryPolicy) -> Self {
        Self {
            client,
            template,
            retry,
        }
    }

    /// Review a batch and return one result per file, in batch order.
    ///
    /// Only terminal errors are returned as `Err`; anything else becomes an
    /// error result for the affected files.
    pub async fn review_batch(&self, files: &[LoadedFile]) -> Result<Vec<ReviewResult>, ReviewError> {
        match files {
            [] => return Ok(Vec::new()),
            [single] => return Ok(vec![self.review_single(single).await?]),
            _ => {}
        }

        let raw = match self.generate(files).await {
            Ok(raw) => raw,
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => {
                warn!(files = files.len(), error = %err, "batch review failed");
                let message = err.to_string();
                return Ok(files
                    .iter()
                    .map(|file| ReviewResult::error(&file.candidate, message.clone()))
                    .collect());
            }
        };

        let mut entries = parse_review_response(&raw).unwrap_or_default();
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            match take_entry(&mut entries, &file.candidate.path, false) {
                Some(review) => results.push(structured_result(&file.candidate, review, &raw)),
                None => {
                    debug!(path = %file.candidate.path, "not covered by batch response, reviewing alone");
                    results.push(self.review_single(file).await?);
                }
            }
        }
        Ok(results)
    }

    async fn review_single(&self, file: &LoadedFile) -> Result<ReviewResult, ReviewError> {
        let raw = match self.generate(std::slice::from_ref(file)).await {
            Ok(raw) => raw,
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => {
                warn!(path = %file.candidate.path, error = %err, "review failed");
                return Ok(ReviewResult::error(&file.candidate, err.to_string()));
            }
        };
        let mut entries = parse_review_response(&raw).unwrap_or_default();
        Ok(match take_entry(&mut entries, &file.candidate.path, true) {
            Some(review) => structured_result(&file.candidate, review, &raw),
            None => ReviewResult::ok(&file.candidate, raw, None),
        })
    }

    async fn generate(&self, files: &[LoadedFile]) -> Result<String, ReviewError> {
        let documents: Vec<SourceDocument> = files.iter().map(LoadedFile::document).collect();
        let prompt = self.template.render(&documents)?;
        let label = match files {
            [single] => format!("review {}", single.candidate.path),
            _ => format!("review batch of {} files", files.len()),
        };
        self.retry
            .run(&label, || self.client.generate(&prompt))
            .await
    }
}

fn structured_result(candidate: &FileCandidate, review: FileReview, raw: &str) -> ReviewResult {
    let commentary = if review.summary.trim().is_empty() {
        preview(raw)
    } else {
        review.summary.clone()
    };
    ReviewResult::ok(candidate, commentary, Some(review))
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= COMMENTARY_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().take(COMMENTARY_PREVIEW_CHARS).collect::<String>() + "…"
}

fn normalize_path(path: &str) -> &str {
    path.trim().trim_start_matches("./").trim_start_matches('/')
}

/// Remove and return the entry for `path`. A lone entry without a path is
/// accepted when `sole_file` is set.
fn take_entry(
    entries: &mut Vec<prompt::ResponseEntry>,
    path: &str,
    sole_file: bool,
) -> Option<FileReview> {
    let wanted = normalize_path(path);
    let position = entries
        .iter()
        .position(|entry| entry.path.as_deref().map(normalize_path) == Some(wanted))
        .or_else(|| {
            let name = wanted.rsplit('/').next().unwrap_or(wanted);
            entries.iter().position(|entry| {
                entry
                    .path
                    .as_deref()
                    .map(normalize_path)
                    .is_some_and(|candidate| !candidate.contains('/') && candidate == name)
            })
        })
        .or_else(|| (sole_file && entries.len() == 1).then_some(0));
    position.map(|idx| entries.remove(idx).review)
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_string(Value::deserialize(deserializer)?).unwrap_or_default())
}

fn lenient_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_string(Value::deserialize(deserializer)?).filter(|text| !text.trim().is_empty()))
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Object(map) => ["message", "text", "description"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str).map(str::to_string))
            .or_else(|| Some(Value::Object(map).to_string())),
        other => Some(other.to_string()),
    }
}

fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(value_to_string)
            .filter(|text| !text.trim().is_empty())
            .collect(),
        other => value_to_string(other)
            .filter(|text| !text.trim().is_empty())
            .into_iter()
            .collect(),
    })
}

fn lenient_issues<'de, D>(deserializer: D) -> Result<Vec<Issue>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(message) => Some(Issue {
                kind: default_issue_kind(),
                severity: Severity::Medium,
                line: None,
                message,
                suggestion: None,
            }),
            other => serde_json::from_value(other).ok(),
        })
        .collect())
}

fn lenient_line<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_u64().and_then(|line| u32::try_from(line).ok()),
        Value::String(text) => {
            let digits: String = text
                .trim()
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse().ok()
        }
        _ => None,
    })
    .map(|line| line.filter(|line| *line > 0))
}

fn lenient_score<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    let score = match Value::deserialize(deserializer)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text
            .trim()
            .split('/')
            .next()
            .and_then(|head| head.trim().parse::<f64>().ok()),
        _ => None,
    };
    Ok(score
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(0.0, 10.0) as f32))
}
