//! Tally - per-author commit activity for GitHub repositories.
//!
//! A run crawls the commit listings of a set of repositories, counts commits
//! per author, and persists one record per (repository, author) in batches.
//! Every outbound request goes through a shared [`RateGovernor`] that bounds
//! concurrency and request rate and adapts to the rate-limit headers GitHub
//! returns.
//!
//! # Features
//!
//! - `sqlite` / `postgres` - SQL backends for [`store::SqlStore`].
//! - `migrate` - Enables [`connect_and_migrate`] and the [`migration`] module.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tally::{Pipeline, PipelineOptions, RepoRef, fetch::GitHubConfig};
//! use tally::http::ReqwestTransport;
//! use tally::store::SqlStore;
//!
//! let db = tally::connect_and_migrate("sqlite://tally.db?mode=rwc").await?;
//! let transport = Arc::new(ReqwestTransport::with_timeout(Duration::from_secs(30))?);
//! let pipeline = Pipeline::new(
//!     transport,
//!     GitHubConfig::default(),
//!     Arc::new(SqlStore::new(db)),
//!     PipelineOptions::default(),
//! )?;
//! let summary = pipeline.run(vec!["rust-lang/rust".parse()?]).await;
//! ```

pub mod aggregate;
pub mod db;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod http;
pub mod pipeline;
pub mod ranking;
pub mod rate;
pub mod store;
pub mod writer;

#[cfg(feature = "migrate")]
pub mod migration;

pub use aggregate::MetricRecord;
pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use error::{FetchError, IngestError, StoreError};
pub use fetch::RepoRef;
pub use pipeline::{
    DrainReason, IngestProgress, Pipeline, PipelineOptions, ProgressCallback, RunState,
    RunSummary, StopHandle,
};
pub use ranking::RankingRecord;
pub use rate::{GovernorConfig, RateGovernor};
pub use store::MetricStore;
pub use writer::{FatalPolicy, WriterConfig};
