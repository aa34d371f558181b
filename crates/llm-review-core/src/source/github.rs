//! GitHub REST client plus the repository and pull request enumerators built
//! on it.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, instrument};

use super::{
    ContentFetcher, DiffStats, DiffStatus, FileCandidate, RepoSlug, SourceEnumerator, SourceKind,
};
use crate::error::{ReviewError, Service};
use crate::retry::RetryPolicy;
use crate::settings::GithubSettings;

const USER_AGENT: &str = concat!("llm-review/", env!("CARGO_PKG_VERSION"));
const GITHUB_MEDIA_TYPE: &str = "application/vnd.github+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PR_FILES_PER_PAGE: usize = 100;

/// Repository metadata shown before the review starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub full_name: String,
    pub description: Option<String>,
    pub stars: u64,
    pub default_branch: String,
}

/// Pull request metadata; content is read from `head_repo` at `head_sha`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub state: String,
    pub head_sha: String,
    pub head_repo: RepoSlug,
}

#[derive(Debug, Deserialize)]
struct ApiRepository {
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    title: String,
    state: String,
    user: Option<ApiUser>,
    head: ApiHead,
}

#[derive(Debug, Deserialize)]
struct ApiHead {
    sha: String,
    repo: Option<ApiHeadRepo>,
}

#[derive(Debug, Deserialize)]
struct ApiHeadRepo {
    full_name: String,
}

/// One entry of a Contents API directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
}

/// One entry of the pull request files listing.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestFile {
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

#[derive(Debug, Deserialize)]
struct ApiFileContent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

/// Thin authenticated client over the endpoints the reviewer needs.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ReviewError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ReviewError::Config(format!("failed to build GitHub client: {err}")))?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            token: token.into(),
        })
    }

    /// Build a client from settings; a missing token is an auth failure.
    pub fn from_settings(settings: &GithubSettings) -> Result<Self, ReviewError> {
        let token = settings.token.as_deref().ok_or_else(|| {
            ReviewError::Auth(
                "GITHUB_TOKEN is not set; add a GitHub personal access token to your .env file"
                    .into(),
            )
        })?;
        Self::new(settings.api_url.clone(), token)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ReviewError> {
        let mut url = Url::parse(&self.api_url).map_err(|err| {
            ReviewError::Config(format!("invalid GITHUB_API_URL `{}`: {err}", self.api_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                ReviewError::Config(format!(
                    "GITHUB_API_URL `{}` cannot be used as a base URL",
                    self.api_url
                ))
            })?
            .pop_if_empty()
            .extend(
                segments
                    .iter()
                    .flat_map(|segment| segment.split('/'))
                    .filter(|segment| !segment.is_empty()),
            );
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, ReviewError> {
        debug!(%url, "GitHub request");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(ACCEPT, GITHUB_MEDIA_TYPE)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|err| transport_error(err, what))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, body, what));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| ReviewError::Decode(format!("GitHub response for {what}: {err}")))
    }

    /// Login of the token owner.
    pub async fn current_user(&self) -> Result<String, ReviewError> {
        let url = self.endpoint(&["user"])?;
        let user: ApiUser = self.get_json(url, "the authenticated user").await?;
        Ok(user.login)
    }

    pub async fn repository(&self, repo: &RepoSlug) -> Result<RepositoryInfo, ReviewError> {
        let url = self.endpoint(&["repos", &repo.owner, &repo.name])?;
        let api: ApiRepository = self.get_json(url, &format!("repository {repo}")).await?;
        Ok(RepositoryInfo {
            full_name: api.full_name,
            description: api.description.filter(|text| !text.trim().is_empty()),
            stars: api.stargazers_count,
            default_branch: api.default_branch,
        })
    }

    pub async fn list_directory(
        &self,
        repo: &RepoSlug,
        path: &str,
        reference: &str,
    ) -> Result<Vec<ContentEntry>, ReviewError> {
        let mut url = self.endpoint(&["repos", &repo.owner, &repo.name, "contents", path])?;
        url.query_pairs_mut().append_pair("ref", reference);
        let label = if path.is_empty() { "/" } else { path };
        self.get_json(url, &format!("directory {label} in {repo}"))
            .await
    }

    pub async fn pull_request(
        &self,
        repo: &RepoSlug,
        number: u64,
    ) -> Result<PullRequestInfo, ReviewError> {
        let url = self.endpoint(&["repos", &repo.owner, &repo.name, "pulls", &number.to_string()])?;
        let api: ApiPullRequest = self
            .get_json(url, &format!("pull request #{number} in {repo}"))
            .await?;
        // A deleted fork leaves `head.repo` empty; the base repository still
        // serves the head commit.
        let head_repo = api
            .head
            .repo
            .and_then(|head| RepoSlug::parse(&head.full_name).ok())
            .unwrap_or_else(|| repo.clone());
        Ok(PullRequestInfo {
            number: api.number,
            title: api.title,
            author: api.user.map(|user| user.login).unwrap_or_default(),
            state: api.state,
            head_sha: api.head.sha,
            head_repo,
        })
    }

    pub async fn pull_request_files(
        &self,
        repo: &RepoSlug,
        number: u64,
        page: u32,
    ) -> Result<Vec<PullRequestFile>, ReviewError> {
        let mut url = self.endpoint(&[
            "repos",
            &repo.owner,
            &repo.name,
            "pulls",
            &number.to_string(),
            "files",
        ])?;
        url.query_pairs_mut()
            .append_pair("per_page", &PR_FILES_PER_PAGE.to_string())
            .append_pair("page", &page.to_string());
        self.get_json(url, &format!("files of pull request #{number} in {repo}"))
            .await
    }

    /// Decoded content of a file at `reference`.
    pub async fn file_content(
        &self,
        repo: &RepoSlug,
        path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, ReviewError> {
        let mut url = self.endpoint(&["repos", &repo.owner, &repo.name, "contents", path])?;
        url.query_pairs_mut().append_pair("ref", reference);
        let api: ApiFileContent = self.get_json(url, &format!("file {path}")).await?;
        if api.encoding != "base64" {
            return Err(ReviewError::Decode(format!(
                "content of {path}: unsupported encoding `{}`",
                api.encoding
            )));
        }
        decode_base64(&api.content)
            .map_err(|err| ReviewError::Decode(format!("base64 content of {path}: {err}")))
    }
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact)
}

fn transport_error(err: reqwest::Error, what: &str) -> ReviewError {
    if err.is_timeout() {
        ReviewError::Timeout(format!("GitHub request for {what}"))
    } else {
        ReviewError::Network(format!("GitHub request for {what}: {err}"))
    }
}

fn status_error(status: StatusCode, headers: &HeaderMap, body: String, what: &str) -> ReviewError {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    map_status(
        status.as_u16(),
        header("x-ratelimit-remaining").as_deref(),
        header("x-ratelimit-reset").as_deref(),
        body,
        what,
    )
}

/// Translate a GitHub error status into the error taxonomy.
fn map_status(
    status: u16,
    rate_remaining: Option<&str>,
    rate_reset: Option<&str>,
    body: String,
    what: &str,
) -> ReviewError {
    let exhausted = rate_remaining.map(str::trim) == Some("0");
    match status {
        401 => ReviewError::Auth("GitHub rejected the token (401); check GITHUB_TOKEN".into()),
        403 | 429 if exhausted || status == 429 => {
            let reset = rate_reset
                .and_then(|raw| raw.trim().parse::<i64>().ok())
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                .map(|at| {
                    format!(
                        "; resets at {}",
                        at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
                    )
                })
                .unwrap_or_default();
            ReviewError::Auth(format!("GitHub API rate limit exceeded{reset}"))
        }
        403 => ReviewError::Auth(format!("GitHub denied access to {what} (403)")),
        404 => ReviewError::NotFound(format!("{what} on GitHub")),
        _ => ReviewError::Api {
            service: Service::GitHub,
            status,
            body: truncate_body(body),
        },
    }
}

fn truncate_body(body: String) -> String {
    const LIMIT: usize = 300;
    if body.chars().count() <= LIMIT {
        return body;
    }
    body.chars().take(LIMIT).collect::<String>() + "…"
}

/// Depth-first walk of the Contents API; directories are listed only when
/// the consumer reaches them.
pub struct RepositoryEnumerator {
    client: GitHubClient,
    repo: RepoSlug,
    reference: String,
    delay: Duration,
    retry: RetryPolicy,
    stack: Vec<VecDeque<ContentEntry>>,
    started: bool,
    listings: usize,
    next_ordinal: usize,
}

impl RepositoryEnumerator {
    pub fn new(client: GitHubClient, repo: RepoSlug, reference: String, delay: Duration) -> Self {
        Self {
            client,
            repo,
            reference,
            delay,
            retry: RetryPolicy::listing(),
            stack: Vec::new(),
            started: false,
            listings: 0,
            next_ordinal: 0,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of directory listings requested so far.
    pub fn listings(&self) -> usize {
        self.listings
    }

    async fn list(&mut self, path: &str) -> Result<VecDeque<ContentEntry>, ReviewError> {
        if self.listings > 0 && !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.listings += 1;
        let (client, repo, reference) = (&self.client, &self.repo, self.reference.as_str());
        let label = format!("list {repo}:{path}");
        let entries = self
            .retry
            .run(&label, || client.list_directory(repo, path, reference))
            .await?;
        debug!(path, entries = entries.len(), "listed directory");
        Ok(entries.into())
    }
}

#[async_trait]
impl SourceEnumerator for RepositoryEnumerator {
    async fn next_candidate(&mut self) -> Result<Option<FileCandidate>, ReviewError> {
        if !self.started {
            self.started = true;
            let root = self.list("").await?;
            self.stack.push(root);
        }
        loop {
            let Some(level) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(entry) = level.pop_front() else {
                self.stack.pop();
                continue;
            };
            match entry.kind.as_str() {
                "file" => {
                    let ordinal = self.next_ordinal;
                    self.next_ordinal += 1;
                    return Ok(Some(FileCandidate {
                        ordinal,
                        path: entry.path,
                        size: Some(entry.size),
                        kind: SourceKind::Remote,
                        diff: None,
                    }));
                }
                "dir" => {
                    let listing = self.list(&entry.path).await?;
                    self.stack.push(listing);
                }
                other => debug!(path = %entry.path, kind = other, "skipping non-file entry"),
            }
        }
    }
}

/// Pages through the files changed by a pull request.
pub struct PullRequestEnumerator {
    client: GitHubClient,
    repo: RepoSlug,
    number: u64,
    delay: Duration,
    retry: RetryPolicy,
    page: u32,
    buffer: VecDeque<PullRequestFile>,
    exhausted: bool,
    next_ordinal: usize,
}

impl PullRequestEnumerator {
    pub fn new(client: GitHubClient, repo: RepoSlug, number: u64, delay: Duration) -> Self {
        Self {
            client,
            repo,
            number,
            delay,
            retry: RetryPolicy::listing(),
            page: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            next_ordinal: 0,
        }
    }

    #[instrument(skip(self), fields(pull_request = self.number))]
    async fn fetch_page(&mut self) -> Result<(), ReviewError> {
        if self.page > 0 && !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.page += 1;
        let (client, repo, number, page) = (&self.client, &self.repo, self.number, self.page);
        let files = self
            .retry
            .run(&format!("list files of {repo}#{number}"), || {
                client.pull_request_files(repo, number, page)
            })
            .await?;
        if files.len() < PR_FILES_PER_PAGE {
            self.exhausted = true;
        }
        debug!(page, files = files.len(), "listed pull request files");
        self.buffer.extend(files);
        Ok(())
    }
}

#[async_trait]
impl SourceEnumerator for PullRequestEnumerator {
    async fn next_candidate(&mut self) -> Result<Option<FileCandidate>, ReviewError> {
        loop {
            if let Some(file) = self.buffer.pop_front() {
                let status = DiffStatus::parse(&file.status);
                if status == DiffStatus::Removed {
                    debug!(path = %file.filename, "skipping removed file");
                    continue;
                }
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                return Ok(Some(FileCandidate {
                    ordinal,
                    path: file.filename,
                    size: None,
                    kind: SourceKind::PrDiff,
                    diff: Some(DiffStats {
                        status,
                        additions: file.additions,
                        deletions: file.deletions,
                    }),
                }));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }
}

/// Reads file content through the Contents API at a fixed ref.
#[derive(Debug, Clone)]
pub struct GitHubFetcher {
    client: GitHubClient,
    repo: RepoSlug,
    reference: String,
}

impl GitHubFetcher {
    pub fn new(client: GitHubClient, repo: RepoSlug, reference: String) -> Self {
        Self {
            client,
            repo,
            reference,
        }
    }
}

#[async_trait]
impl ContentFetcher for GitHubFetcher {
    async fn fetch(&self, candidate: &FileCandidate) -> Result<Vec<u8>, ReviewError> {
        self.client
            .file_content(&self.repo, &candidate.path, &self.reference)
            .await
    }
}
