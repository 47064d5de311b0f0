//! Progress reporting for crawl runs.
//!
//! Every [`IngestProgress`] event is turned into a structured log line.
//! Per-page and per-batch chatter goes to `debug`; repository outcomes and
//! state changes go to `info` and above.

use std::sync::Arc;

use tally::{IngestProgress, ProgressCallback};

/// Logging reporter using tracing for structured output.
#[derive(Debug, Default)]
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    /// Convert to a [`ProgressCallback`] for the library.
    pub fn as_callback(self: &Arc<Self>) -> Arc<ProgressCallback> {
        let reporter = Arc::clone(self);
        Arc::new(Box::new(move |event| reporter.handle(event)))
    }

    pub fn handle(&self, event: IngestProgress) {
        match event {
            IngestProgress::StateChanged { from, to } => {
                tracing::debug!(%from, %to, "Run state changed");
            }

            IngestProgress::Draining { reason } => {
                tracing::info!(reason = %reason, "Draining");
            }

            IngestProgress::DiscoveringTop { limit } => {
                tracing::info!(limit, "Discovering most-starred repositories");
            }

            IngestProgress::Discovered { count } => {
                tracing::info!(count, "Discovered repositories");
            }

            IngestProgress::RepoStarted { repo } => {
                tracing::debug!(repo = %repo, "Fetching commits");
            }

            IngestProgress::PageFetched {
                repo,
                page,
                entries,
                skipped,
                has_next,
            } => {
                tracing::debug!(repo = %repo, page, entries, skipped, has_next, "Fetched page");
            }

            IngestProgress::FetchRetry {
                repo,
                attempt,
                delay_ms,
                error,
            } => {
                tracing::warn!(repo = %repo, attempt, delay_ms, error = %error, "Retrying page");
            }

            IngestProgress::RateAdjusted { from, to } => {
                tracing::info!(from, to, "Request rate adjusted");
            }

            IngestProgress::RatePaused { pause_ms } => {
                tracing::warn!(pause_ms, "Rate limit exhausted, pausing requests");
            }

            IngestProgress::RepoCompleted {
                repo,
                pages,
                commits,
            } => {
                tracing::info!(repo = %repo, pages, commits, "Repository complete");
            }

            IngestProgress::RepoFailed { repo, error } => {
                tracing::warn!(repo = %repo, error = %error, "Repository failed");
            }

            IngestProgress::RepoCancelled { repo } => {
                tracing::debug!(repo = %repo, "Repository cancelled");
            }

            IngestProgress::FlushingBatch {
                batch_id,
                count,
                final_batch,
            } => {
                if final_batch {
                    tracing::info!(%batch_id, count, "Flushing final batch");
                } else {
                    tracing::debug!(%batch_id, count, "Flushing batch");
                }
            }

            IngestProgress::BatchRetry {
                batch_id,
                attempt,
                backoff_ms,
                error,
            } => {
                tracing::warn!(%batch_id, attempt, backoff_ms, error = %error, "Retrying batch");
            }

            IngestProgress::BatchWritten {
                batch_id,
                count,
                attempts,
            } => {
                tracing::debug!(%batch_id, count, attempts, "Batch written");
            }

            IngestProgress::BatchUndelivered {
                batch_id,
                count,
                error,
            } => {
                tracing::error!(%batch_id, count, error = %error, "Batch undelivered");
            }

            _ => {}
        }
    }
}
