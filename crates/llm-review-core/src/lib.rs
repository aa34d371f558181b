pub mod error;
pub mod fetch;
pub mod filter;
pub mod health;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod review;
pub mod security;
pub mod settings;
pub mod source;

pub use error::{ReviewError, Service};
pub use filter::{FilterRules, ReviewBatch};
pub use health::{check_connectivity, CheckOutcome};
pub use pipeline::{Pipeline, ProgressSink, RunError, SilentProgress, Stage};
pub use report::{render_report, write_report, OutputFormat, RunOutcome, RunReport, Summary};
pub use retry::RetryPolicy;
pub use review::{
    FileReview, Issue, ModelHealth, OllamaClient, ReviewClient, ReviewResult, ReviewStatus,
    Severity,
};
pub use security::{render_findings, SecretFinding, SecretScanner};
pub use settings::{ConfigSources, Overrides, RunConfig};
pub use source::{FileCandidate, RepoSlug, SourceInfo, SourceKind, SourceRef};
