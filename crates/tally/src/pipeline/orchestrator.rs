//! Owns a single ingestion run from seeding to the final flush.
//!
//! ```text
//!  fetchers (one per repo, gated by the RateGovernor)
//!      │  bounded page channel
//!      ▼
//!  aggregator ──bounded record channel──▶ writer ──▶ MetricStore
//!                                           │
//!                                           └──▶ fatal channel ──▶ orchestrator
//! ```
//!
//! The orchestrator drains when every fetcher has finished, when a stop is
//! requested, or when the writer reports an undelivered batch. Draining
//! cancels fetchers still in flight, lets the aggregator force-close their
//! tallies, and waits for the writer's final flush.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::progress::{IngestProgress, ProgressCallback, emit};
use super::types::{
    DrainReason, FailedRepo, PipelineOptions, RepoReport, RunState, RunSummary,
};
use crate::aggregate::spawn_aggregator;
use crate::error::{FetchError, IngestError, StoreError};
use crate::fetch::{
    CrawlOutcome, GitHubClient, GitHubConfig, RankedRepository, RepoRef, crawl_repository,
};
use crate::http::HttpTransport;
use crate::ranking::snapshot;
use crate::rate::RateGovernor;
use crate::store::MetricStore;
use crate::writer::{await_writer, insert_rankings_with_retry, spawn_writer};

/// Requests a graceful stop of a running pipeline. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Ask the pipeline to drain. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A configured ingestion pipeline, ready to run once.
pub struct Pipeline {
    client: GitHubClient,
    store: Arc<dyn MetricStore>,
    options: PipelineOptions,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
    on_progress: Option<Arc<ProgressCallback>>,
    started_at: DateTime<Utc>,
}

impl Pipeline {
    /// Build a pipeline. Fails if the governor limits or the lookback are
    /// unusable.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        github: GitHubConfig,
        store: Arc<dyn MetricStore>,
        options: PipelineOptions,
    ) -> Result<Self, IngestError> {
        let governor = RateGovernor::new(options.governor)?;
        let started_at = Utc::now();
        github.since(started_at)?;
        let client = GitHubClient::new(transport, governor, github, started_at);
        let (state, _) = watch::channel(RunState::Idle);

        Ok(Self {
            client,
            store,
            options,
            cancel: CancellationToken::new(),
            state,
            on_progress: None,
            started_at,
        })
    }

    #[must_use]
    pub fn with_progress(mut self, on_progress: Arc<ProgressCallback>) -> Self {
        self.client = self.client.with_progress(Some(Arc::clone(&on_progress)));
        self.on_progress = Some(on_progress);
        self
    }

    /// Tie the run to an outer cancellation token. Cancelling it drains the
    /// run exactly like [`StopHandle::stop`].
    #[must_use]
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.cancel.clone(),
        }
    }

    /// Watch the run state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Timestamp stamped on every record of this run.
    #[must_use]
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn client(&self) -> &GitHubClient {
        &self.client
    }

    /// Discover the `limit` most-starred repositories to use as targets.
    pub async fn discover_top(&self, limit: usize) -> Result<Vec<RankedRepository>, FetchError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            repos = self.client.top_repositories(limit) => repos,
        }
    }

    /// Persist a discovered ranking, stamped with this run's observation time.
    ///
    /// One insert, retried under the writer's policy.
    pub async fn record_rankings(&self, ranked: &[RankedRepository]) -> Result<u64, StoreError> {
        if ranked.is_empty() {
            return Ok(0);
        }

        let rankings = snapshot(ranked, self.started_at);
        let batch_id = Uuid::new_v4();
        let outcome = insert_rankings_with_retry(
            self.store.as_ref(),
            batch_id,
            &rankings,
            self.options.writer.max_attempts,
            self.options.writer.backoff,
            self.on_progress.as_deref(),
        )
        .await;

        match outcome.result {
            Ok(rows) => {
                tracing::info!(%batch_id, rows, attempts = outcome.attempts, "Recorded ranking");
                Ok(rows)
            }
            Err(e) => {
                tracing::error!(
                    %batch_id,
                    repositories = rankings.len(),
                    attempts = outcome.attempts,
                    error = %e,
                    "Ranking undelivered"
                );
                Err(e)
            }
        }
    }

    fn transition(&self, to: RunState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::debug!(%from, %to, "Pipeline state changed");
            emit(
                self.on_progress.as_deref(),
                IngestProgress::StateChanged { from, to },
            );
        }
    }

    fn begin_drain(&self, reason: DrainReason) {
        tracing::info!(reason = %reason, "Draining pipeline");
        emit(
            self.on_progress.as_deref(),
            IngestProgress::Draining {
                reason: reason.clone(),
            },
        );
        self.transition(RunState::Draining);
        self.cancel.cancel();
        self.client.governor().close();
    }

    /// Crawl `targets`, aggregate and persist, then stop.
    ///
    /// Consumes the pipeline: a stopped pipeline accepts no further work.
    pub async fn run(self, targets: Vec<RepoRef>) -> RunSummary {
        let run_start = Instant::now();
        let mut seen = HashSet::new();
        let targets: Vec<RepoRef> = targets
            .into_iter()
            .filter(|repo| seen.insert(repo.clone()))
            .collect();

        self.transition(RunState::Running);
        tracing::info!(
            repositories = targets.len(),
            max_concurrent = self.options.governor.max_concurrent,
            rps = self.options.governor.requests_per_second,
            since = %self.client.since(),
            "Starting ingestion run"
        );

        let (page_tx, page_rx) = mpsc::channel(self.options.page_queue.max(1));
        let (record_tx, record_rx) = mpsc::channel(self.options.record_queue.max(1));
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        let aggregator = spawn_aggregator(
            page_rx,
            record_tx,
            self.started_at,
            self.on_progress.clone(),
        );
        let writer = spawn_writer(
            Arc::clone(&self.store),
            record_rx,
            self.options.writer.clone(),
            fatal_tx,
            self.on_progress.clone(),
        );

        let mut fetchers = JoinSet::new();
        for repo in &targets {
            let client = self.client.clone();
            let tx = page_tx.clone();
            let cancel = self.cancel.clone();
            let on_progress = self.on_progress.clone();
            let repo = repo.clone();
            fetchers.spawn(async move {
                let outcome =
                    crawl_repository(&client, repo.clone(), &tx, &cancel, on_progress.as_ref())
                        .await;
                (repo, outcome)
            });
        }
        drop(page_tx);

        let mut outcomes: HashMap<RepoRef, CrawlOutcome> = HashMap::with_capacity(targets.len());
        let mut drain_reason: Option<DrainReason> = None;
        let mut fatal: Option<IngestError> = None;

        loop {
            tokio::select! {
                biased;

                Some(batch) = fatal_rx.recv() => {
                    if fatal.is_none() {
                        fatal = Some(IngestError::Undelivered(Box::new(batch.clone())));
                    }
                    if drain_reason.is_none() {
                        let reason = DrainReason::Fatal(batch.error.clone());
                        self.begin_drain(reason.clone());
                        drain_reason = Some(reason);
                    }
                }

                _ = self.cancel.cancelled(), if drain_reason.is_none() => {
                    self.begin_drain(DrainReason::StopRequested);
                    drain_reason = Some(DrainReason::StopRequested);
                }

                joined = fetchers.join_next() => match joined {
                    Some(Ok((repo, outcome))) => {
                        outcomes.insert(repo, outcome);
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Fetcher task failed");
                    }
                    None => break,
                },
            }
        }

        if drain_reason.is_none() {
            self.begin_drain(DrainReason::Exhausted);
            drain_reason = Some(DrainReason::Exhausted);
        }

        let aggregate = match aggregator.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Aggregator task failed");
                fatal.get_or_insert(IngestError::Stage(format!("aggregator: {e}")));
                None
            }
        };

        let written = await_writer(writer).await;
        if let Some(panic) = &written.panic_info {
            fatal.get_or_insert(IngestError::Stage(format!("writer: {panic}")));
        }
        while let Ok(batch) = fatal_rx.try_recv() {
            fatal.get_or_insert(IngestError::Undelivered(Box::new(batch)));
        }

        let mut summary = RunSummary {
            records_written: written.records_written,
            batches_written: written.flushes.len(),
            undelivered: written.undelivered,
            drain_reason,
            ..RunSummary::default()
        };

        let mut completed = HashMap::new();
        if let Some(report) = aggregate {
            summary.skipped_commits = report.skipped_commits;
            for closed in report.completed {
                completed.insert(closed.repo.clone(), closed);
            }
        }

        for repo in targets {
            match (completed.remove(&repo), outcomes.remove(&repo)) {
                (Some(closed), _) => summary.succeeded.push(RepoReport {
                    authors: closed.records.len(),
                    repo,
                    pages: closed.pages,
                    commits: closed.commits,
                }),
                (None, Some(CrawlOutcome::Failed(reason))) => {
                    summary.failed.push(FailedRepo { repo, reason });
                }
                (None, _) => summary.partial.push(repo),
            }
        }

        summary.fatal = fatal;
        summary.elapsed = run_start.elapsed();
        self.transition(RunState::Stopped);

        tracing::info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            partial = summary.partial.len(),
            records_written = summary.records_written,
            undelivered = summary.undelivered_records(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Ingestion run finished"
        );
        summary
    }
}
