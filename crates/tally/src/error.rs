//! Error types shared across the ingestion pipeline.

use std::time::Duration;

use sea_orm::DbErr;
use thiserror::Error;

use crate::http::HttpError;
use crate::rate::GovernorError;
use crate::writer::UndeliveredBatch;

/// Errors raised while fetching a page from the activity API.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Rate limited (status {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unparseable page from {url}: {reason}")]
    Unparseable { url: String, reason: String },

    #[error("Invalid repository reference: {0}")]
    InvalidRepo(String),

    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    ///
    /// Timeouts, transport failures, 5xx responses and rate-limit rejections
    /// are transient. Other 4xx responses and malformed payloads are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Http(_) | FetchError::RateLimited { .. } | FetchError::Server { .. }
        )
    }

    /// Server-requested delay before the next attempt, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn unparseable(url: impl Into<String>, reason: impl ToString) -> Self {
        FetchError::Unparseable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by a metric store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Store rejected insert with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Final flush did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

impl StoreError {
    /// Whether the whole batch may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(err) => is_retryable_db_error(err),
            StoreError::Http(_) => true,
            StoreError::Rejected { status, .. } => *status == 429 || *status >= 500,
            StoreError::Serialize(_)
            | StoreError::InvalidConfig(_)
            | StoreError::DeadlineExceeded(_) => false,
        }
    }
}

fn is_retryable_db_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(_) | DbErr::Query(_) => {
            let err_str = err.to_string().to_lowercase();
            err_str.contains("locked")
                || err_str.contains("busy")
                || err_str.contains("timeout")
                || err_str.contains("connection")
                || err_str.contains("temporarily unavailable")
        }
        _ => false,
    }
}

/// Run-level failures. Any of these moves the pipeline into draining.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error("Store unavailable, {} records undelivered: {}", .0.records.len(), .0.error)]
    Undelivered(Box<UndeliveredBatch>),

    #[error(transparent)]
    Config(#[from] FetchError),

    #[error("Pipeline stage failed: {0}")]
    Stage(String),
}

impl IngestError {
    /// Records that never reached the store, if this error carries any.
    #[must_use]
    pub fn undelivered(&self) -> Option<&UndeliveredBatch> {
        match self {
            IngestError::Undelivered(batch) => Some(batch.as_ref()),
            _ => None,
        }
    }
}

/// Collapse an error chain into a single short line for progress output.
#[must_use]
pub fn short_error_message(err: &dyn std::error::Error) -> String {
    let message = err.to_string();
    let first_line = message.lines().next().unwrap_or_default();
    if first_line.chars().count() > 120 {
        let truncated: String = first_line.chars().take(117).collect();
        format!("{truncated}...")
    } else {
        first_line.to_string()
    }
}
