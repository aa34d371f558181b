//! Regex scan for credentials committed to a local checkout.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ReviewError;
use crate::source::local::{relative_path, walk};

const EXCERPT_CHARS: usize = 50;

/// Files that legitimately hold secrets or document them.
const EXCLUDED_FILES: &[&str] = &[".env", ".env.example", "README.md"];

const SECRET_PATTERNS: &[(&str, &str)] = &[
    (r"ghp_[a-zA-Z0-9]{36}", "GitHub personal access token"),
    (r"sk-[a-zA-Z0-9]{48}", "OpenAI API key"),
    (r"AKIA[0-9A-Z]{16}", "AWS access key"),
    (r#"password\s*=\s*["'][^"']{3,}["']"#, "Hard-coded password"),
    (r#"secret\s*=\s*["'][^"']{3,}["']"#, "Hard-coded secret"),
    (r#"token\s*=\s*["'][^"']{10,}["']"#, "Hard-coded token"),
    (r#"api[_-]?key\s*=\s*["'][^"']{10,}["']"#, "API key"),
];

/// One suspicious line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretFinding {
    /// Path relative to the scanned directory.
    pub file: String,
    /// 1-based line number.
    pub line: usize,
    pub kind: String,
    pub excerpt: String,
}

#[derive(Debug, Clone)]
pub struct SecretScanner {
    patterns: Vec<(Regex, &'static str)>,
}

impl SecretScanner {
    pub fn new() -> Result<Self, ReviewError> {
        let patterns = SECRET_PATTERNS
            .iter()
            .map(|(pattern, kind)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (regex, *kind))
                    .map_err(|err| ReviewError::Config(format!("invalid secret pattern {pattern}: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Scan every file under `root`. Unreadable and binary files are ignored.
    pub fn scan_directory(&self, root: &Path) -> Result<Vec<SecretFinding>, ReviewError> {
        if !root.is_dir() {
            return Err(ReviewError::io(
                root.display(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "directory not found"),
            ));
        }
        let mut findings = Vec::new();
        for entry in walk(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if EXCLUDED_FILES.contains(&&*name) {
                continue;
            }
            let path: PathBuf = entry.path().to_path_buf();
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "ignoring unreadable file");
                    continue;
                }
            };
            if bytes.contains(&0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            findings.extend(self.scan_text(&relative_path(root, &path), &text));
        }
        Ok(findings)
    }

    /// Scan one file's text; each matching pattern on a line is one finding.
    pub fn scan_text(&self, file: &str, text: &str) -> Vec<SecretFinding> {
        let mut findings = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            for (regex, kind) in &self.patterns {
                if regex.is_match(line) {
                    findings.push(SecretFinding {
                        file: file.to_string(),
                        line: idx + 1,
                        kind: (*kind).to_string(),
                        excerpt: excerpt(line),
                    });
                }
            }
        }
        findings
    }
}

fn excerpt(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() > EXCERPT_CHARS {
        trimmed.chars().take(EXCERPT_CHARS).collect::<String>() + "..."
    } else {
        trimmed.to_string()
    }
}

/// Human-readable findings grouped by kind, with remediation steps.
pub fn render_findings(findings: &[SecretFinding]) -> String {
    let mut out = String::new();
    if findings.is_empty() {
        out.push_str("Security check passed: no hard-coded secrets found.\n");
        return out;
    }

    let mut kinds: Vec<&str> = Vec::new();
    for finding in findings {
        if !kinds.contains(&finding.kind.as_str()) {
            kinds.push(&finding.kind);
        }
    }

    // Writing to a String cannot fail.
    let _ = writeln!(out, "{} potential secret(s) found!\n", findings.len());
    for kind in kinds {
        let group: Vec<_> = findings.iter().filter(|f| f.kind == kind).collect();
        let _ = writeln!(out, "🚨 {kind} ({}):", group.len());
        for finding in group {
            let _ = writeln!(out, "   {}:{}", finding.file, finding.line);
            let _ = writeln!(out, "      {}", finding.excerpt);
        }
        out.push('\n');
    }
    out.push_str("How to fix:\n");
    out.push_str("   1. Move the secrets into a .env file and load them from the environment\n");
    out.push_str("   2. Add that file to .gitignore\n");
    out.push_str("   3. Unstage it with git reset and rotate any credential already pushed\n");
    out
}
