use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::error::ReviewError;
use crate::fetch::{fetch_batch, FetchOutcome};
use crate::filter::{self, Admission, ReviewBatch, Selection, Selector};
use crate::report::{RunOutcome, RunReport};
use crate::retry::RetryPolicy;
use crate::review::{LoadedFile, PromptTemplate, ReviewClient, ReviewResult, Reviewer};
use crate::settings::RunConfig;
use crate::source::{self, ContentFetcher, OpenedSource, SourceEnumerator, SourceInfo, SourceRef};

/// Stages of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Preflight: credentials and model server.
    Connecting,
    Enumerating,
    Fetching,
    Reviewing,
    Reporting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Connecting => "connecting",
            Stage::Enumerating => "enumerating",
            Stage::Fetching => "fetching",
            Stage::Reviewing => "reviewing",
            Stage::Reporting => "reporting",
        })
    }
}

/// A run that failed before any result could be reported.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct RunError {
    pub stage: Stage,
    #[source]
    pub source: ReviewError,
}

impl RunError {
    pub fn new(stage: Stage, source: ReviewError) -> Self {
        Self { stage, source }
    }
}

/// Observer for run progress. Every method defaults to a no-op.
pub trait ProgressSink: Send + Sync {
    fn stage(&self, _stage: Stage) {}
    fn source_opened(&self, _info: &SourceInfo) {}
    fn batches_planned(&self, _files: usize, _batches: usize) {}
    fn file_finished(&self, _result: &ReviewResult) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {}

/// Drives one review run: enumerate, filter, batch, fetch, review.
pub struct Pipeline<'a> {
    config: &'a RunConfig,
    client: &'a dyn ReviewClient,
    template: PromptTemplate,
    progress: &'a dyn ProgressSink,
    fetch_retry: RetryPolicy,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a RunConfig, client: &'a dyn ReviewClient) -> Result<Self, ReviewError> {
        Ok(Self {
            config,
            client,
            template: PromptTemplate::new()?,
            progress: &SilentProgress,
            fetch_retry: RetryPolicy::fetch(),
        })
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_fetch_retry(mut self, retry: RetryPolicy) -> Self {
        self.fetch_retry = retry;
        self
    }

    /// Check credentials and the model server, open `source`, and review it.
    ///
    /// Fails fast, before any file is fetched or reviewed, when the token is
    /// missing or the model server cannot serve the configured model.
    #[instrument(skip(self, source), fields(target = %source.label()))]
    pub async fn run(&self, source: &SourceRef) -> Result<RunReport, RunError> {
        let started = Instant::now();
        self.progress.stage(Stage::Connecting);
        self.preflight(source)
            .await
            .map_err(|err| RunError::new(Stage::Connecting, err))?;

        self.progress.stage(Stage::Enumerating);
        let opened = source::open(source, self.config)
            .await
            .map_err(|err| RunError::new(Stage::Enumerating, err))?;
        self.execute(source.label(), opened, started).await
    }

    /// Review an already opened source without the preflight checks.
    pub async fn run_source(
        &self,
        label: impl Into<String>,
        opened: OpenedSource,
    ) -> Result<RunReport, RunError> {
        self.execute(label.into(), opened, Instant::now()).await
    }

    async fn preflight(&self, source: &SourceRef) -> Result<(), ReviewError> {
        if source.requires_github() {
            self.config.github_token()?;
        }
        let model = self.client.model();
        let health = self.client.health().await?;
        if !health.has_model(model) {
            return Err(ReviewError::NotFound(format!(
                "model `{model}` is not available on the model server; run `ollama pull {model}`"
            )));
        }
        debug!(model, "model server ready");
        Ok(())
    }

    async fn execute(
        &self,
        label: String,
        opened: OpenedSource,
        started: Instant,
    ) -> Result<RunReport, RunError> {
        self.progress.source_opened(&opened.info);
        let OpenedSource {
            mut enumerator,
            fetcher,
            ..
        } = opened;

        self.progress.stage(Stage::Enumerating);
        let selection = self
            .select(enumerator.as_mut())
            .await
            .map_err(|err| RunError::new(Stage::Enumerating, err))?;
        info!(
            admitted = selection.admitted.len(),
            skipped = selection.skipped.len(),
            filtered_out = selection.filtered_out,
            "selected files"
        );

        let mut results = Vec::with_capacity(selection.admitted.len() + selection.skipped.len());
        for (candidate, reason) in &selection.skipped {
            self.record(&mut results, ReviewResult::skipped(candidate, reason.clone()));
        }

        let admitted = selection.admitted.len();
        let batches = filter::batch(selection.admitted, self.config.filter.max_batch_chars);
        self.progress.batches_planned(admitted, batches.len());
        info!(files = admitted, batches = batches.len(), "planned review batches");

        let mut outcome = RunOutcome::Done;
        let mut pending = batches.into_iter();
        while let Some(batch) = pending.next() {
            if let Err(failure) = self.process_batch(fetcher.as_ref(), &batch, &mut results).await {
                error!(stage = %failure.stage, error = %failure.source, "run aborted");
                let message = failure.source.to_string();
                let done: HashSet<usize> = results.iter().map(|result| result.ordinal).collect();
                let unfinished: Vec<_> = batch
                    .files
                    .iter()
                    .cloned()
                    .chain(pending.by_ref().flat_map(|rest| rest.files))
                    .filter(|candidate| !done.contains(&candidate.ordinal))
                    .collect();
                for candidate in &unfinished {
                    self.record(
                        &mut results,
                        ReviewResult::error(candidate, format!("run aborted: {message}")),
                    );
                }
                outcome = RunOutcome::Failed {
                    stage: failure.stage,
                    message,
                };
                break;
            }
        }

        self.progress.stage(Stage::Reporting);
        results.sort_by_key(|result| result.ordinal);
        Ok(RunReport::new(
            label,
            self.client.model().to_string(),
            started.elapsed(),
            outcome,
            results,
        ))
    }

    /// Pull candidates until the source is exhausted or enough files are
    /// admitted; later candidates are never listed.
    async fn select(&self, enumerator: &mut dyn SourceEnumerator) -> Result<Selection, ReviewError> {
        let mut selector = Selector::new(&self.config.filter);
        while !selector.is_full() {
            let Some(candidate) = enumerator.next_candidate().await? else {
                break;
            };
            let path = candidate.path.clone();
            match selector.offer(candidate) {
                Admission::Skipped(reason) => debug!(%path, %reason, "skipping file"),
                Admission::FilteredOut => debug!(%path, "extension not reviewed"),
                Admission::Admitted | Admission::Full => {}
            }
        }
        Ok(selector.finish())
    }

    async fn process_batch(
        &self,
        fetcher: &dyn ContentFetcher,
        batch: &ReviewBatch,
        results: &mut Vec<ReviewResult>,
    ) -> Result<(), RunError> {
        self.progress.stage(Stage::Fetching);
        let fetched = fetch_batch(
            fetcher,
            batch,
            self.fetch_retry,
            self.config.filter.per_file_limit(),
        )
        .await
        .map_err(|err| RunError::new(Stage::Fetching, err))?;

        let mut loaded = Vec::with_capacity(fetched.len());
        for file in fetched {
            match file.outcome {
                FetchOutcome::Loaded(content) => loaded.push(LoadedFile {
                    candidate: file.candidate,
                    content,
                }),
                FetchOutcome::Skipped(reason) => {
                    self.record(results, ReviewResult::skipped(&file.candidate, reason))
                }
                FetchOutcome::Failed(err) => {
                    self.record(results, ReviewResult::error(&file.candidate, err.to_string()))
                }
            }
        }

        if loaded.is_empty() {
            return Ok(());
        }
        self.progress.stage(Stage::Reviewing);
        let reviewer = Reviewer::new(self.client, &self.template, self.config.review_retry());
        // Sizes unknown at batching time (pull request files) are known now.
        let groups = filter::pack(loaded, self.config.filter.max_batch_chars, |file| {
            file.content.len() as u64
        });
        if groups.len() > 1 {
            debug!(groups = groups.len(), "batch split by fetched size");
        }
        for group in groups {
            let reviewed = reviewer
                .review_batch(&group)
                .await
                .map_err(|err| RunError::new(Stage::Reviewing, err))?;
            for result in reviewed {
                self.record(results, result);
            }
        }
        Ok(())
    }

    fn record(&self, results: &mut Vec<ReviewResult>, result: ReviewResult) {
        self.progress.file_finished(&result);
        results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_names_stage() {
        let err = RunError::new(
            Stage::Connecting,
            ReviewError::ServiceUnavailable("connection refused".into()),
        );
        assert_eq!(
            err.to_string(),
            "connecting failed: model service unavailable: connection refused"
        );
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Stage::Reviewing).unwrap(), "\"reviewing\"");
    }
}
