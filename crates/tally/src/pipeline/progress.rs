//! Progress events emitted while an ingestion run is in flight.
//!
//! The library never prints. Callers that want live output pass a
//! [`ProgressCallback`] and render events however they like.

use uuid::Uuid;

use super::types::{DrainReason, RunState};

/// Progress events emitted during an ingestion run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum IngestProgress {
    /// Run state transition.
    StateChanged {
        from: RunState,
        to: RunState,
    },

    /// Draining started.
    Draining {
        reason: DrainReason,
    },

    /// Looking up the most-starred repositories.
    DiscoveringTop {
        limit: usize,
    },

    /// Top-repository discovery finished.
    Discovered {
        count: usize,
    },

    /// A repository's first page is about to be requested.
    RepoStarted {
        repo: String,
    },

    /// A page of commits was fetched and handed to the aggregator.
    PageFetched {
        repo: String,
        /// Page number (1-indexed).
        page: u32,
        /// Commit entries with a usable author identity.
        entries: usize,
        /// Commits skipped because no author identity could be derived.
        skipped: usize,
        has_next: bool,
    },

    /// A transient fetch failure is being retried.
    FetchRetry {
        repo: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// The API reported less headroom than the configured rate.
    RateAdjusted {
        from: u32,
        to: u32,
    },

    /// The API asked us to stop sending for a while.
    RatePaused {
        pause_ms: u64,
    },

    /// All pages for a repository were consumed.
    RepoCompleted {
        repo: String,
        pages: u32,
        commits: u64,
    },

    /// A repository failed terminally. Its partial tally is discarded.
    RepoFailed {
        repo: String,
        error: String,
    },

    /// A repository was cut short by draining.
    RepoCancelled {
        repo: String,
    },

    /// A batch is being written to the store.
    FlushingBatch {
        batch_id: Uuid,
        count: usize,
        final_batch: bool,
    },

    /// A batch write failed and will be retried.
    BatchRetry {
        batch_id: Uuid,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },

    /// A batch was written.
    BatchWritten {
        batch_id: Uuid,
        count: usize,
        attempts: u32,
    },

    /// A batch exhausted its attempts.
    BatchUndelivered {
        batch_id: Uuid,
        count: usize,
        error: String,
    },
}

/// Callback for progress updates during an ingestion run.
pub type ProgressCallback = Box<dyn Fn(IngestProgress) + Send + Sync>;

/// Emit a progress event if a callback is provided.
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: IngestProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}
