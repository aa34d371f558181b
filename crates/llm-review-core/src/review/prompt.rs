use handlebars::Handlebars;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::FileReview;
use crate::error::ReviewError;

const REVIEW_TEMPLATE_NAME: &str = "review_prompt";
const REVIEW_TEMPLATE: &str = include_str!("../templates/review_prompt.hbs");

/// Keys that mark a bare JSON object as a review rather than unrelated output.
const REVIEW_KEYS: &[&str] = &[
    "overall_score",
    "summary",
    "issues",
    "improvements",
    "positive_points",
];

/// A file as presented to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDocument {
    pub path: String,
    pub language: &'static str,
    pub content: String,
}

impl SourceDocument {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            language: detect_language(&path),
            path,
            content: content.into(),
        }
    }
}

/// Language name for a file path, from its extension.
pub fn detect_language(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hxx" | "hh" => "cpp",
        "go" => "go",
        "rb" => "ruby",
        "php" => "php",
        "html" | "htm" => "html",
        "css" => "css",
        "rs" => "rust",
        "kt" | "kts" => "kotlin",
        "swift" => "swift",
        "cs" => "csharp",
        "sh" | "bash" => "bash",
        "sql" => "sql",
        _ => "text",
    }
}

/// The review instruction template. Rendering never HTML-escapes, so source
/// text reaches the model untouched.
pub struct PromptTemplate {
    registry: Handlebars<'static>,
}

impl PromptTemplate {
    pub fn new() -> Result<Self, ReviewError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(REVIEW_TEMPLATE_NAME, REVIEW_TEMPLATE)
            .map_err(|err| ReviewError::Template(format!("review prompt: {err}")))?;
        Ok(Self { registry })
    }

    pub fn render(&self, files: &[SourceDocument]) -> Result<String, ReviewError> {
        let context = json!({
            "file_count": files.len(),
            "files": files,
        });
        self.registry
            .render(REVIEW_TEMPLATE_NAME, &context)
            .map_err(|err| ReviewError::Template(format!("rendering review prompt failed: {err}")))
    }
}

impl std::fmt::Debug for PromptTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTemplate").finish_non_exhaustive()
    }
}

/// One per-file entry recovered from a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEntry {
    pub path: Option<String>,
    pub review: FileReview,
}

/// Recover structured per-file reviews from free-form model output.
///
/// Accepts `{"files": [...]}`, a bare array of entries or a single review
/// object. Returns `None` when no review can be recovered.
pub fn parse_review_response(raw: &str) -> Option<Vec<ResponseEntry>> {
    let payload = extract_json_payload(raw);
    let value = parse_lenient(&payload)?;
    let items = match value {
        Value::Object(mut map) if map.contains_key("files") => match map.remove("files") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        Value::Array(items) => items,
        Value::Object(map) if REVIEW_KEYS.iter().any(|key| map.contains_key(*key)) => {
            vec![Value::Object(map)]
        }
        _ => return None,
    };

    let entries: Vec<ResponseEntry> = items
        .into_iter()
        .filter_map(|item| {
            let path = ["path", "file", "file_path"]
                .iter()
                .find_map(|key| item.get(*key).and_then(Value::as_str))
                .map(str::to_string);
            match serde_json::from_value::<FileReview>(item) {
                Ok(review) => Some(ResponseEntry { path, review }),
                Err(err) => {
                    debug!(error = %err, "dropping malformed review entry");
                    None
                }
            }
        })
        .collect();

    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

fn parse_lenient(payload: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(payload) {
        return Some(value);
    }
    let sanitized = sanitize_json_strings(payload);
    if let Ok(value) = serde_json::from_str::<Value>(&sanitized) {
        return Some(value);
    }
    match json5::from_str::<Value>(&sanitized) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = %err, "model response is not JSON");
            None
        }
    }
}

/// Strip code fences and surrounding prose, keeping the outermost JSON value.
pub fn extract_json_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed.to_string();
    }
    let body = strip_code_fence(trimmed).unwrap_or_else(|| trimmed.to_string());
    if body.starts_with('{') || body.starts_with('[') {
        return body;
    }
    let start = body.find(['{', '[']);
    let Some(start) = start else {
        return body;
    };
    let closing = if body[start..].starts_with('[') { ']' } else { '}' };
    match body.rfind(closing) {
        Some(end) if end > start => body[start..=end].to_string(),
        _ => body[start..].to_string(),
    }
}

fn strip_code_fence(input: &str) -> Option<String> {
    let start = input.find("```")?;
    let mut rest = &input[start + 3..];
    rest = rest.trim_start_matches(|c: char| c == ' ' || c == '\t');
    if let Some(stripped) = rest.strip_prefix("json") {
        rest = stripped;
    }
    rest = rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let end = rest.rfind("```").unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

/// Escape raw newlines inside string literals and close anything left open.
fn sanitize_json_strings(payload: &str) -> String {
    let mut result = String::with_capacity(payload.len());
    let mut in_string = false;
    let mut escape = false;
    let mut open: Vec<char> = Vec::new();

    for ch in payload.chars() {
        if in_string {
            if escape {
                result.push(ch);
                escape = false;
                continue;
            }
            match ch {
                '\\' => {
                    result.push(ch);
                    escape = true;
                }
                '"' => {
                    result.push(ch);
                    in_string = false;
                }
                '\n' => result.push_str("\\n"),
                '\r' => {}
                '\t' => result.push_str("\\t"),
                _ => result.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
        result.push(ch);
    }

    if in_string {
        result.push('"');
    }
    while let Some(closer) = open.pop() {
        result.push(closer);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::Severity;
    use proptest::prelude::*;

    #[test]
    fn renders_every_file_without_escaping() {
        let template = PromptTemplate::new().unwrap();
        let prompt = template
            .render(&[
                SourceDocument::new("src/app.py", "if a < b and c > d:\n    pass\n"),
                SourceDocument::new("web/index.html", "<div class=\"x\">&amp;</div>"),
            ])
            .unwrap();
        assert!(prompt.contains("### File: src/app.py"));
        assert!(prompt.contains("Language: python"));
        assert!(prompt.contains("if a < b and c > d:"));
        assert!(prompt.contains("<div class=\"x\">&amp;</div>"));
        assert!(prompt.contains("Review each of the 2 file(s)"));
        assert!(prompt.contains("\"positive_points\""));
    }

    #[test]
    fn detects_languages() {
        assert_eq!(detect_language("a/b/Main.JAVA"), "java");
        assert_eq!(detect_language("lib.rs"), "rust");
        assert_eq!(detect_language("Makefile"), "text");
    }

    #[test]
    fn parses_files_envelope_inside_prose() {
        let raw = "Here is my review:\n```json\n{\"files\": [{\"path\": \"a.py\", \"overall_score\": 8, \"summary\": \"Clean\", \"issues\": [{\"type\": \"bug\", \"severity\": \"HIGH\", \"line\": \"12\", \"message\": \"m\"}]}]}\n```\nHope this helps.";
        let entries = parse_review_response(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path.as_deref(), Some("a.py"));
        let review = &entries[0].review;
        assert_eq!(review.overall_score, Some(8.0));
        assert_eq!(review.issues[0].severity, Severity::High);
        assert_eq!(review.issues[0].line, Some(12));
    }

    #[test]
    fn parses_single_object_with_raw_newlines() {
        let raw = "{\"overall_score\": \"6.5\", \"summary\": \"first line\nsecond line\", \"improvements\": [\"x\"";
        let entries = parse_review_response(raw).unwrap();
        assert_eq!(entries[0].path, None);
        assert_eq!(entries[0].review.overall_score, Some(6.5));
        assert_eq!(entries[0].review.summary, "first line\nsecond line");
        assert_eq!(entries[0].review.improvements, vec!["x".to_string()]);
    }

    #[test]
    fn parses_json5_fallback() {
        let raw = "{files: [{path: 'b.py', overall_score: 11, positive_points: ['tidy',],},],}";
        let entries = parse_review_response(raw).unwrap();
        assert_eq!(entries[0].path.as_deref(), Some("b.py"));
        assert_eq!(entries[0].review.overall_score, Some(10.0));
        assert_eq!(entries[0].review.positive_points, vec!["tidy".to_string()]);
    }

    #[test]
    fn rejects_unrelated_output() {
        assert!(parse_review_response("The code looks fine to me.").is_none());
        assert!(parse_review_response("{\"greeting\": \"hello\"}").is_none());
    }

    #[test]
    fn sanitizer_closes_open_structures() {
        assert_eq!(sanitize_json_strings("{\"a\": [1, {\"b\": \"x"), "{\"a\": [1, {\"b\": \"x\"}]}");
    }

    fn json_body_strategy() -> impl Strategy<Value = String> {
        "[a-z]{1,8}".prop_map(|key| format!("{{\"{key}\": 1}}"))
    }

    proptest! {
        #[test]
        fn extract_json_payload_strips_fences(body in json_body_strategy()) {
            let fenced = format!("```json\n{}\n```", body);
            prop_assert_eq!(extract_json_payload(&fenced), body.clone());

            let chatty = format!("Sure! Here you go:\n```\n{}\n```\nAnything else?", body);
            prop_assert_eq!(extract_json_payload(&chatty), body);
        }

        #[test]
        fn extract_json_payload_preserves_unfenced(body in json_body_strategy()) {
            let decorated = format!("\n  {}\n ", body);
            prop_assert_eq!(extract_json_payload(&decorated), body);
        }
    }
}
