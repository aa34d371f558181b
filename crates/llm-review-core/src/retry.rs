use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::ReviewError;

/// Bounded retry with exponential backoff, applied to transient errors only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Per-file content fetches: one retry after a short pause.
    pub const fn fetch() -> Self {
        Self::new(1, Duration::from_millis(500), Duration::from_secs(2))
    }

    /// Directory and page listings.
    pub const fn listing() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(5))
    }

    /// Model calls with a configurable retry budget.
    pub const fn review(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ReviewError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ReviewError>>,
    {
        let mut attempt = 0u32;
        let mut backoff = self.initial_backoff;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        %label,
                        attempt,
                        max_retries = self.max_retries,
                        error = %err,
                        "transient failure, retrying"
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
