//! Ingestion pipeline: fetchers, aggregator and batch writer wired together
//! under a single orchestrator.

pub mod orchestrator;
pub mod progress;
pub mod types;

pub use orchestrator::{Pipeline, StopHandle};
pub use progress::{IngestProgress, ProgressCallback};
pub use types::{
    DrainReason, FailedRepo, PAGE_CHANNEL_BUFFER_SIZE, PipelineOptions,
    RECORD_CHANNEL_BUFFER_SIZE, RepoReport, RunState, RunSummary,
};
