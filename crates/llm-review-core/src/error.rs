use std::fmt;

use thiserror::Error;

/// Errors produced while enumerating, fetching, reviewing and reporting.
///
/// The first five variants form the user-facing taxonomy; the remaining ones
/// carry lower-level detail that the pipeline classifies as transient or
/// terminal.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// Missing, invalid or rate-limited GitHub credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A repository, pull request, file or model that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The model server could not be reached.
    #[error("model service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Local filesystem access failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A network call exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Connection-level failure talking to GitHub.
    #[error("network error: {0}")]
    Network(String),

    #[error("{service} API error ({status}): {body}")]
    Api {
        service: Service,
        status: u16,
        body: String,
    },

    #[error("failed to decode {0}")]
    Decode(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("report formatting failed")]
    Format(#[from] std::fmt::Error),
}

/// Remote service an [`ReviewError::Api`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    GitHub,
    Model,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::GitHub => f.write_str("GitHub"),
            Service::Model => f.write_str("model"),
        }
    }
}

impl ReviewError {
    pub fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    /// Worth retrying under a bounded policy.
    pub fn is_transient(&self) -> bool {
        match self {
            ReviewError::Timeout(_) | ReviewError::Network(_) => true,
            ReviewError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// No later file can succeed once this error is seen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReviewError::Auth(_) | ReviewError::ServiceUnavailable(_) | ReviewError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(ReviewError::Timeout("generate".into()).is_transient());
        assert!(ReviewError::Network("reset".into()).is_transient());
        assert!(ReviewError::Api {
            service: Service::GitHub,
            status: 502,
            body: String::new(),
        }
        .is_transient());
        assert!(!ReviewError::Api {
            service: Service::Model,
            status: 404,
            body: String::new(),
        }
        .is_transient());
        assert!(!ReviewError::Auth("bad token".into()).is_transient());
    }

    #[test]
    fn terminal_errors_exclude_per_file_failures() {
        assert!(ReviewError::ServiceUnavailable("refused".into()).is_terminal());
        assert!(ReviewError::Auth("rate limited".into()).is_terminal());
        assert!(!ReviewError::Timeout("generate".into()).is_terminal());
        let io = ReviewError::io(
            "src/a.py",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!io.is_terminal());
        assert!(io.to_string().contains("src/a.py"));
    }

    #[test]
    fn api_error_names_service() {
        let err = ReviewError::Api {
            service: Service::GitHub,
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(err.to_string(), "GitHub API error (500): boom");
    }
}
