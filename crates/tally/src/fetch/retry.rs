//! Retry policy for page fetches.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{FetchError, short_error_message};
use crate::fetch::types::RepoRef;
use crate::pipeline::progress::{IngestProgress, ProgressCallback, emit};

/// Initial delay before the first retry.
pub const INITIAL_BACKOFF_MS: u64 = 500;
/// Upper bound on a single retry delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;
/// Total attempts per request, including the first.
pub const MAX_ATTEMPTS: u32 = 5;

/// Configuration for fetch retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry; doubles on each subsequent one.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            max_attempts: MAX_ATTEMPTS,
            with_jitter: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            min_delay,
            max_delay,
            max_attempts,
            with_jitter: true,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Build an exponential backoff strategy from this configuration.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let retries = self.max_attempts.saturating_sub(1) as usize;
        let mut builder = ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }
}

/// Run a fetch operation, retrying transient failures with exponential backoff.
///
/// Non-transient errors are returned on the first occurrence. Every scheduled
/// retry is logged and reported as [`IngestProgress::FetchRetry`].
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    repo: &RepoRef,
    on_progress: Option<&ProgressCallback>,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempt = AtomicU32::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    retry_op
        .retry(config.clone().into_backoff())
        .notify(|err, dur| {
            let current_attempt = attempt.load(Ordering::SeqCst);
            let error = short_error_message(err);
            tracing::debug!(
                repo = %repo,
                attempt = current_attempt,
                delay_ms = dur.as_millis() as u64,
                error = %error,
                "Transient fetch failure, retrying"
            );
            emit(
                on_progress,
                IngestProgress::FetchRetry {
                    repo: repo.full_name(),
                    attempt: current_attempt,
                    delay_ms: dur.as_millis() as u64,
                    error,
                },
            );
        })
        .when(FetchError::is_transient)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::http::HttpError;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(Duration::from_millis(10), Duration::from_millis(100), max_attempts)
            .with_jitter(false)
    }

    #[test]
    fn retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.min_delay, Duration::from_millis(INITIAL_BACKOFF_MS));
        assert_eq!(config.max_delay, Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(config.max_attempts, 5);
        assert!(config.with_jitter);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_and_emits_progress() {
        let events: Arc<Mutex<Vec<IngestProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let events_capture = Arc::clone(&events);
        let callback: ProgressCallback = Box::new(move |event| {
            events_capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        });

        let calls = AtomicU32::new(0);
        let repo = RepoRef::new("o", "r");
        let result = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FetchError::Server {
                            status: 502,
                            message: "bad gateway".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            },
            &fast_config(5),
            &repo,
            Some(&callback),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let events = events.lock().unwrap();
        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                IngestProgress::FetchRetry { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Http(HttpError::Timeout(Duration::from_secs(10)))) }
            },
            &fast_config(5),
            &RepoRef::new("o", "r"),
            None,
        )
        .await;

        assert!(matches!(result, Err(FetchError::Http(HttpError::Timeout(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FetchError::Api {
                        status: 404,
                        message: "Not Found".into(),
                    })
                }
            },
            &fast_config(5),
            &RepoRef::new("o", "r"),
            None,
        )
        .await;

        assert!(matches!(result, Err(FetchError::Api { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
