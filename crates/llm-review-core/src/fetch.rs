use tracing::{debug, warn};

use crate::error::ReviewError;
use crate::filter::ReviewBatch;
use crate::retry::RetryPolicy;
use crate::source::{ContentFetcher, FileCandidate};

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// Per-file outcome of fetching one batch.
#[derive(Debug)]
pub enum FetchOutcome {
    Loaded(String),
    Skipped(String),
    Failed(ReviewError),
}

#[derive(Debug)]
pub struct FetchedFile {
    pub candidate: FileCandidate,
    pub outcome: FetchOutcome,
}

/// Fetch every file of `batch`, retrying transient failures per file.
///
/// A failing file is recorded and the rest of the batch continues; only a
/// terminal error (revoked token, exhausted rate limit) is returned as `Err`.
pub async fn fetch_batch(
    fetcher: &dyn ContentFetcher,
    batch: &ReviewBatch,
    retry: RetryPolicy,
    per_file_limit: u64,
) -> Result<Vec<FetchedFile>, ReviewError> {
    let mut fetched = Vec::with_capacity(batch.files.len());
    for candidate in &batch.files {
        let label = format!("fetch {}", candidate.path);
        let outcome = match retry.run(&label, || fetcher.fetch(candidate)).await {
            Ok(bytes) => classify(&candidate.path, bytes, per_file_limit),
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => {
                warn!(path = %candidate.path, error = %err, "fetch failed");
                FetchOutcome::Failed(err)
            }
        };
        fetched.push(FetchedFile {
            candidate: candidate.clone(),
            outcome,
        });
    }
    Ok(fetched)
}

fn classify(path: &str, bytes: Vec<u8>, per_file_limit: u64) -> FetchOutcome {
    let size = bytes.len() as u64;
    if size > per_file_limit {
        debug!(path, size, "fetched content over limit");
        return FetchOutcome::Skipped(format!(
            "file size {size} bytes exceeds the {per_file_limit} byte limit"
        ));
    }
    if looks_binary(&bytes) {
        debug!(path, "binary content");
        return FetchOutcome::Skipped("binary file".into());
    }
    FetchOutcome::Loaded(String::from_utf8_lossy(&bytes).into_owned())
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_LEN)].contains(&0)
}
