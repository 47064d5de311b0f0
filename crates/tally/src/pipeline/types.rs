//! Types describing an ingestion run and its outcome.

use std::fmt;
use std::time::Duration;

use crate::error::IngestError;
use crate::fetch::RepoRef;
use crate::rate::GovernorConfig;
use crate::writer::{UndeliveredBatch, WriterConfig};

/// Default capacity of the fetcher → aggregator channel.
pub const PAGE_CHANNEL_BUFFER_SIZE: usize = 64;
/// Default capacity of the aggregator → writer channel.
pub const RECORD_CHANNEL_BUFFER_SIZE: usize = 500;

/// Lifecycle of a pipeline. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a run entered [`RunState::Draining`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReason {
    /// Every fetch task finished.
    Exhausted,
    /// A stop was requested through a [`StopHandle`](super::StopHandle) or the
    /// caller's cancellation token.
    StopRequested,
    /// A fatal error, such as the store refusing a batch after every retry.
    Fatal(String),
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainReason::Exhausted => f.write_str("all repositories fetched"),
            DrainReason::StopRequested => f.write_str("stop requested"),
            DrainReason::Fatal(e) => write!(f, "fatal error: {e}"),
        }
    }
}

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub governor: GovernorConfig,
    pub writer: WriterConfig,
    pub page_queue: usize,
    pub record_queue: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            governor: GovernorConfig::default(),
            writer: WriterConfig::default(),
            page_queue: PAGE_CHANNEL_BUFFER_SIZE,
            record_queue: RECORD_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// A repository whose pages were all consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoReport {
    pub repo: RepoRef,
    pub pages: u32,
    pub commits: u64,
    pub authors: usize,
}

/// A repository that failed terminally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRepo {
    pub repo: RepoRef,
    pub reason: String,
}

/// End-of-run summary.
#[derive(Debug, Default)]
#[must_use = "RunSummary reports failures and undelivered records"]
pub struct RunSummary {
    pub succeeded: Vec<RepoReport>,
    pub failed: Vec<FailedRepo>,
    /// Repositories cut short by draining. Any records they produced are
    /// partial counts.
    pub partial: Vec<RepoRef>,
    pub records_written: u64,
    pub batches_written: usize,
    /// Commits without a usable author identity.
    pub skipped_commits: u64,
    pub undelivered: Vec<UndeliveredBatch>,
    /// First fatal error, if any.
    pub fatal: Option<IngestError>,
    pub drain_reason: Option<DrainReason>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// True when every repository completed and every record was delivered.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.partial.is_empty()
            && self.undelivered.is_empty()
            && self.fatal.is_none()
    }

    pub fn undelivered_records(&self) -> usize {
        self.undelivered.iter().map(|b| b.records.len()).sum()
    }
}
