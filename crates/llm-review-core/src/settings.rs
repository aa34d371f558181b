use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, File, FileFormat, Map, Source, Value};
use serde::Deserialize;

use crate::error::ReviewError;
use crate::filter::FilterRules;
use crate::retry::RetryPolicy;

const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_GITHUB_REQUEST_DELAY: &str = "100ms";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "codellama";
const DEFAULT_OLLAMA_TIMEOUT: &str = "120s";
const DEFAULT_OLLAMA_MAX_RETRIES: u32 = 2;
const DEFAULT_EXTENSIONS: &str = ".py,.js,.ts,.java,.cpp,.c,.go,.rb,.php,.html,.css";
const DEFAULT_MAX_FILE_SIZE: u64 = 50_000;
const DEFAULT_MAX_FILES: usize = 20;
const DEFAULT_MAX_BATCH_CHARS: usize = 60_000;
const DEFAULT_REPORTS_DIR: &str = "reports";

/// Keys recognised in the environment, `.env` and config files.
const KNOWN_KEYS: &[&str] = &[
    "GITHUB_TOKEN",
    "GITHUB_API_URL",
    "GITHUB_REQUEST_DELAY",
    "OLLAMA_URL",
    "OLLAMA_MODEL",
    "OLLAMA_TIMEOUT",
    "OLLAMA_MAX_RETRIES",
    "SUPPORTED_EXTENSIONS",
    "MAX_FILE_SIZE",
    "MAX_FILES_PER_ANALYSIS",
    "MAX_BATCH_CHARS",
    "REPORTS_DIR",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubSettings {
    pub token: Option<String>,
    pub api_url: String,
    /// Pause between directory listing calls.
    pub request_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Resolved settings for one invocation. Built once, then only borrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub github: GithubSettings,
    pub model: ModelSettings,
    pub filter: FilterRules,
    pub reports_dir: PathBuf,
}

/// Where settings are read from, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// `.env`-style `KEY=value` file; missing files are ignored.
    pub env_file: Option<PathBuf>,
    /// Optional TOML/YAML/JSON file with the same keys in lowercase.
    pub config_file: Option<PathBuf>,
    /// Environment snapshot; `None` reads the process environment.
    pub environment: Option<HashMap<String, String>>,
}

/// Values supplied on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_files: Option<usize>,
    pub reports_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            github: GithubSettings {
                token: None,
                api_url: DEFAULT_GITHUB_API_URL.to_string(),
                request_delay: Duration::from_millis(100),
            },
            model: ModelSettings {
                url: DEFAULT_OLLAMA_URL.to_string(),
                model: DEFAULT_OLLAMA_MODEL.to_string(),
                timeout: Duration::from_secs(120),
                max_retries: DEFAULT_OLLAMA_MAX_RETRIES,
            },
            filter: FilterRules::new(
                parse_extensions(DEFAULT_EXTENSIONS),
                DEFAULT_MAX_FILE_SIZE,
                DEFAULT_MAX_FILES,
                DEFAULT_MAX_BATCH_CHARS,
            ),
            reports_dir: PathBuf::from(DEFAULT_REPORTS_DIR),
        }
    }
}

impl RunConfig {
    /// Layer defaults, the `.env` file, the config file, the environment and
    /// CLI overrides into a single validated configuration.
    pub fn load(sources: &ConfigSources, overrides: &Overrides) -> Result<Self, ReviewError> {
        let mut builder = Config::builder()
            .set_default("github_api_url", DEFAULT_GITHUB_API_URL)
            .and_then(|b| b.set_default("github_request_delay", DEFAULT_GITHUB_REQUEST_DELAY))
            .and_then(|b| b.set_default("ollama_url", DEFAULT_OLLAMA_URL))
            .and_then(|b| b.set_default("ollama_model", DEFAULT_OLLAMA_MODEL))
            .and_then(|b| b.set_default("ollama_timeout", DEFAULT_OLLAMA_TIMEOUT))
            .and_then(|b| {
                b.set_default("ollama_max_retries", DEFAULT_OLLAMA_MAX_RETRIES.to_string())
            })
            .and_then(|b| b.set_default("supported_extensions", DEFAULT_EXTENSIONS))
            .and_then(|b| b.set_default("max_file_size", DEFAULT_MAX_FILE_SIZE.to_string()))
            .and_then(|b| b.set_default("max_files_per_analysis", DEFAULT_MAX_FILES.to_string()))
            .and_then(|b| b.set_default("max_batch_chars", DEFAULT_MAX_BATCH_CHARS.to_string()))
            .and_then(|b| b.set_default("reports_dir", DEFAULT_REPORTS_DIR))
            .map_err(config_error)?;

        if let Some(path) = &sources.env_file {
            builder = builder.add_source(
                File::new(&path.to_string_lossy(), FileFormat::Ini).required(false),
            );
        }
        if let Some(path) = &sources.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }
        builder = builder.add_source(KnownEnvironment::new(sources.environment.clone()));

        if let Some(max_files) = overrides.max_files {
            builder = builder
                .set_override("max_files_per_analysis", max_files.to_string())
                .map_err(config_error)?;
        }
        if let Some(dir) = &overrides.reports_dir {
            builder = builder
                .set_override("reports_dir", dir.to_string_lossy().into_owned())
                .map_err(config_error)?;
        }

        let raw: RawSettings = builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(config_error)?;
        raw.resolve()
    }

    /// Token for GitHub-backed sources; absent tokens are an auth failure.
    pub fn github_token(&self) -> Result<&str, ReviewError> {
        self.github.token.as_deref().ok_or_else(|| {
            ReviewError::Auth(
                "GITHUB_TOKEN is not set; add a GitHub personal access token to your .env file"
                    .into(),
            )
        })
    }

    pub fn review_retry(&self) -> RetryPolicy {
        RetryPolicy::review(self.model.max_retries)
    }
}

fn config_error(err: ConfigError) -> ReviewError {
    ReviewError::Config(err.to_string())
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    github_token: Option<String>,
    github_api_url: String,
    github_request_delay: String,
    ollama_url: String,
    ollama_model: String,
    ollama_timeout: String,
    ollama_max_retries: String,
    supported_extensions: String,
    max_file_size: String,
    max_files_per_analysis: String,
    max_batch_chars: String,
    reports_dir: String,
}

impl RawSettings {
    fn resolve(self) -> Result<RunConfig, ReviewError> {
        let token = self
            .github_token
            .map(|value| unquote(&value).to_string())
            .filter(|value| !value.is_empty());

        let extensions = parse_extensions(unquote(&self.supported_extensions));
        if extensions.is_empty() {
            return Err(ReviewError::Config(
                "SUPPORTED_EXTENSIONS must list at least one extension".into(),
            ));
        }

        let model = unquote(&self.ollama_model).to_string();
        if model.is_empty() {
            return Err(ReviewError::Config("OLLAMA_MODEL must not be empty".into()));
        }

        Ok(RunConfig {
            github: GithubSettings {
                token,
                api_url: base_url(&self.github_api_url),
                request_delay: parse_duration("GITHUB_REQUEST_DELAY", &self.github_request_delay)?,
            },
            model: ModelSettings {
                url: base_url(&self.ollama_url),
                model,
                timeout: parse_duration("OLLAMA_TIMEOUT", &self.ollama_timeout)?,
                max_retries: parse_number("OLLAMA_MAX_RETRIES", &self.ollama_max_retries)?,
            },
            filter: FilterRules::new(
                extensions,
                parse_positive("MAX_FILE_SIZE", &self.max_file_size)?,
                parse_positive("MAX_FILES_PER_ANALYSIS", &self.max_files_per_analysis)?,
                parse_positive("MAX_BATCH_CHARS", &self.max_batch_chars)?,
            ),
            reports_dir: PathBuf::from(unquote(&self.reports_dir)),
        })
    }
}

/// Normalise a comma-separated extension list into lowercase `.ext` entries.
pub fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{ext}")
            }
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    trimmed
}

fn base_url(value: &str) -> String {
    unquote(value).trim_end_matches('/').to_string()
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ReviewError> {
    humantime::parse_duration(unquote(value)).map_err(|err| {
        ReviewError::Config(format!(
            "{key} must be a duration such as `30s` or `500ms` (got `{value}`): {err}"
        ))
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ReviewError> {
    unquote(value).parse::<T>().map_err(|_| {
        ReviewError::Config(format!("{key} must be a non-negative integer (got `{value}`)"))
    })
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T, ReviewError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let parsed: T = parse_number(key, value)?;
    if parsed == T::default() {
        return Err(ReviewError::Config(format!("{key} must be greater than zero")));
    }
    Ok(parsed)
}

/// Environment source restricted to [`KNOWN_KEYS`], so unrelated process
/// variables never reach the settings map.
#[derive(Debug, Clone)]
struct KnownEnvironment {
    snapshot: Option<HashMap<String, String>>,
}

impl KnownEnvironment {
    fn new(snapshot: Option<HashMap<String, String>>) -> Self {
        Self { snapshot }
    }
}

impl Source for KnownEnvironment {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let origin = "environment".to_string();
        let lookup = |key: &str| match &self.snapshot {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        };
        Ok(KNOWN_KEYS
            .iter()
            .filter_map(|key| {
                lookup(key)
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| (key.to_ascii_lowercase(), Value::new(Some(&origin), value)))
            })
            .collect())
    }
}
