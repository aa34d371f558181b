//! Enumerating and fetching candidate files from GitHub repositories, pull
//! requests and local directories.

pub mod github;
pub mod local;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ReviewError;
use crate::settings::RunConfig;

pub use github::{GitHubClient, PullRequestInfo, RepositoryInfo};
pub use local::{LocalEnumerator, LocalFetcher};

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Remote,
    Local,
    PrDiff,
}

/// Status of a file in a pull request diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Added,
    Modified,
    Renamed,
    Copied,
    Changed,
    Unchanged,
    Removed,
}

impl DiffStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "added" => DiffStatus::Added,
            "renamed" => DiffStatus::Renamed,
            "copied" => DiffStatus::Copied,
            "changed" => DiffStatus::Changed,
            "unchanged" => DiffStatus::Unchanged,
            "removed" => DiffStatus::Removed,
            _ => DiffStatus::Modified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub status: DiffStatus,
    pub additions: u64,
    pub deletions: u64,
}

/// A file proposed for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCandidate {
    /// Position in enumeration order.
    pub ordinal: usize,
    /// `/`-separated path relative to the source root.
    pub path: String,
    /// Size in bytes; unknown for pull request entries until fetched.
    pub size: Option<u64>,
    pub kind: SourceKind,
    pub diff: Option<DiffStats>,
}

impl FileCandidate {
    /// Lowercase extension without the dot, if the file name has one.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        name.rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty())
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

/// `owner/name` pair identifying a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ReviewError> {
        let trimmed = raw.trim().trim_end_matches('/');
        match trimmed.split('/').collect::<Vec<_>>().as_slice() {
            [owner, name] if valid_segment(owner) && valid_segment(name) => {
                Ok(Self::new(*owner, *name))
            }
            _ => Err(ReviewError::Config(format!(
                "invalid repository `{raw}`; expected owner/name"
            ))),
        }
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// What the user asked to review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Repository(RepoSlug),
    PullRequest { repo: RepoSlug, number: u64 },
    Local(PathBuf),
}

impl SourceRef {
    pub fn parse_repository(raw: &str) -> Result<Self, ReviewError> {
        RepoSlug::parse(raw).map(SourceRef::Repository)
    }

    /// Accepts `owner/name/NUMBER` and `owner/name#NUMBER`.
    pub fn parse_pull_request(raw: &str) -> Result<Self, ReviewError> {
        let invalid = || {
            ReviewError::Config(format!(
                "invalid pull request `{raw}`; expected owner/name/NUMBER or owner/name#NUMBER"
            ))
        };
        let trimmed = raw.trim();
        let (repo, number) = match trimmed.rsplit_once('#') {
            Some(parts) => parts,
            None => trimmed.rsplit_once('/').ok_or_else(invalid)?,
        };
        let number: u64 = number.parse().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }
        let repo = RepoSlug::parse(repo).map_err(|_| invalid())?;
        Ok(SourceRef::PullRequest { repo, number })
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        SourceRef::Local(path.into())
    }

    /// Human label, also used to name report files.
    pub fn label(&self) -> String {
        match self {
            SourceRef::Repository(repo) => repo.to_string(),
            SourceRef::PullRequest { repo, number } => format!("{repo}_PR{number}"),
            SourceRef::Local(path) => {
                // `.` and `..` have no file name until resolved.
                let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                resolved
                    .file_name()
                    .or_else(|| path.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string())
            }
        }
    }

    pub fn requires_github(&self) -> bool {
        !matches!(self, SourceRef::Local(_))
    }
}

/// Metadata gathered while opening a source, before any file is listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceInfo {
    Repository(RepositoryInfo),
    PullRequest(PullRequestInfo),
    Local { root: PathBuf },
}

/// Lazy, finite, non-restartable sequence of candidates.
#[async_trait]
pub trait SourceEnumerator: Send {
    /// Next candidate, or `None` once the source is exhausted.
    async fn next_candidate(&mut self) -> Result<Option<FileCandidate>, ReviewError>;
}

/// Retrieves the raw bytes of a candidate.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, candidate: &FileCandidate) -> Result<Vec<u8>, ReviewError>;
}

/// An opened source: its metadata plus the enumerator and fetcher for it.
pub struct OpenedSource {
    pub info: SourceInfo,
    pub enumerator: Box<dyn SourceEnumerator>,
    pub fetcher: Box<dyn ContentFetcher>,
}

impl fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedSource")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Resolve a reference into an enumerator and fetcher.
///
/// GitHub references need a token; the repository or pull request is looked
/// up immediately so a bad reference fails before any listing starts.
pub async fn open(source: &SourceRef, config: &RunConfig) -> Result<OpenedSource, ReviewError> {
    match source {
        SourceRef::Repository(repo) => {
            let client = GitHubClient::from_settings(&config.github)?;
            let info = client.repository(repo).await?;
            info!(
                repository = %info.full_name,
                branch = %info.default_branch,
                stars = info.stars,
                "opened repository"
            );
            let enumerator = github::RepositoryEnumerator::new(
                client.clone(),
                repo.clone(),
                info.default_branch.clone(),
                config.github.request_delay,
            );
            let fetcher = github::GitHubFetcher::new(client, repo.clone(), info.default_branch.clone());
            Ok(OpenedSource {
                info: SourceInfo::Repository(info),
                enumerator: Box::new(enumerator),
                fetcher: Box::new(fetcher),
            })
        }
        SourceRef::PullRequest { repo, number } => {
            let client = GitHubClient::from_settings(&config.github)?;
            let info = client.pull_request(repo, *number).await?;
            info!(
                pull_request = *number,
                title = %info.title,
                author = %info.author,
                "opened pull request"
            );
            let enumerator = github::PullRequestEnumerator::new(
                client.clone(),
                repo.clone(),
                *number,
                config.github.request_delay,
            );
            let fetcher =
                github::GitHubFetcher::new(client, info.head_repo.clone(), info.head_sha.clone());
            Ok(OpenedSource {
                info: SourceInfo::PullRequest(info),
                enumerator: Box::new(enumerator),
                fetcher: Box::new(fetcher),
            })
        }
        SourceRef::Local(root) => {
            let enumerator = LocalEnumerator::open(root)?;
            let fetcher = LocalFetcher::new(root.clone());
            Ok(OpenedSource {
                info: SourceInfo::Local { root: root.clone() },
                enumerator: Box::new(enumerator),
                fetcher: Box::new(fetcher),
            })
        }
    }
}

/// Drain an enumerator into a vector. Mostly useful in tests.
pub async fn collect_all(
    enumerator: &mut dyn SourceEnumerator,
) -> Result<Vec<FileCandidate>, ReviewError> {
    let mut out = Vec::new();
    while let Some(candidate) = enumerator.next_candidate().await? {
        out.push(candidate);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repository_slug() {
        let source = SourceRef::parse_repository("rust-lang/rust").unwrap();
        assert_eq!(source, SourceRef::Repository(RepoSlug::new("rust-lang", "rust")));
        assert_eq!(source.label(), "rust-lang/rust");
        assert!(SourceRef::parse_repository("just-owner").is_err());
        assert!(SourceRef::parse_repository("a/b/c").is_err());
    }

    #[test]
    fn parses_pull_request_forms() {
        let slash = SourceRef::parse_pull_request("octo/hello/42").unwrap();
        let hash = SourceRef::parse_pull_request("octo/hello#42").unwrap();
        assert_eq!(slash, hash);
        assert_eq!(slash.label(), "octo/hello_PR42");

        let err = SourceRef::parse_pull_request("octo/hello").unwrap_err();
        assert!(matches!(err, ReviewError::Config(_)));
        assert!(err.to_string().contains("owner/name/NUMBER"));
        assert!(SourceRef::parse_pull_request("octo/hello/abc").is_err());
        assert!(SourceRef::parse_pull_request("octo/hello#0").is_err());
    }

    #[test]
    fn local_label_uses_directory_name() {
        let source = SourceRef::local("/tmp/projects/widget");
        assert_eq!(source.label(), "widget");
        assert!(!source.requires_github());
    }

    #[test]
    fn relative_local_paths_are_labelled_by_resolved_name() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("widget")).unwrap();
        let dotted = SourceRef::local(temp.path().join("widget").join("."));
        assert_eq!(dotted.label(), "widget");
        let parent = SourceRef::local(temp.path().join("widget").join(".."));
        assert_eq!(
            parent.label(),
            temp.path().canonicalize().unwrap().file_name().unwrap().to_string_lossy()
        );

        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        let here = SourceRef::local(".");
        assert_eq!(here.label(), cwd.file_name().unwrap().to_string_lossy());
        assert_ne!(here.label(), ".");
    }

    #[test]
    fn extension_ignores_dotfiles() {
        let mut candidate = FileCandidate {
            ordinal: 0,
            path: "src/Main.PY".into(),
            size: None,
            kind: SourceKind::Local,
            diff: None,
        };
        assert_eq!(candidate.extension().as_deref(), Some("py"));
        candidate.path = "config/.env".into();
        assert_eq!(candidate.extension(), None);
    }

    #[test]
    fn unknown_diff_status_is_modified() {
        assert_eq!(DiffStatus::parse("renamed"), DiffStatus::Renamed);
        assert_eq!(DiffStatus::parse("weird"), DiffStatus::Modified);
    }
}
