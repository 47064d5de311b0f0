//! Batch writer stage: buffers metric records and flushes them to a store.
//!
//! Records are flushed when the batch reaches its size bound, when its oldest
//! record exceeds the age bound, and once more when the input channel closes.
//! A failed flush retries the whole batch with doubling backoff. After the
//! last attempt the batch is sent on the fatal channel with every record it
//! held, and the [`FatalPolicy`] decides whether it is kept for another try
//! at the next flush or dropped with an error log.
//!
//! The final flush runs under `final_flush_timeout`. Batches still pending
//! when it expires are reported as undelivered with their records.
//!
//! ```text
//! Aggregator → record channel → Writer → MetricStore
//!                                  └──→ fatal channel (undelivered batches)
//! ```

pub mod batch;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::MetricRecord;
use crate::error::{StoreError, short_error_message};
use crate::pipeline::progress::{IngestProgress, ProgressCallback, emit};
use crate::ranking::RankingRecord;
use crate::store::MetricStore;

pub use batch::{MetricBatch, PendingBatch};

/// Default records per batch.
pub const DEFAULT_MAX_RECORDS: usize = 500;
/// Default age at which a partial batch is flushed.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_millis(500);
/// Default attempts per flush, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first flush retry. Doubles per retry.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);
/// Default bound on the final flush, retries included.
pub const DEFAULT_FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(120);
/// How long to wait for the writer before closing its input.
pub const WRITER_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do with a batch whose attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FatalPolicy {
    /// Keep the batch and retry it ahead of the next flush.
    #[default]
    Requeue,
    /// Log the records at error level and forget them.
    Drop,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_records: usize,
    pub max_age: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub on_fatal: FatalPolicy,
    pub final_flush_timeout: Duration,
}

impl WriterConfig {
    /// Worst-case time to flush one batch when every attempt takes
    /// `per_attempt`, backoff included.
    #[must_use]
    pub fn retry_budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let mut budget = per_attempt.saturating_mul(attempts);
        let mut backoff = self.backoff;
        for _ in 1..attempts {
            budget = budget.saturating_add(backoff);
            backoff = backoff.saturating_mul(2);
        }
        budget
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_age: DEFAULT_MAX_AGE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            on_fatal: FatalPolicy::default(),
            final_flush_timeout: DEFAULT_FINAL_FLUSH_TIMEOUT,
        }
    }
}

/// A batch the store never accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndeliveredBatch {
    pub batch_id: Uuid,
    /// Exactly the records of the failed flush, in order.
    pub records: Vec<MetricRecord>,
    pub attempts: u32,
    pub error: String,
}

/// Outcome of [`insert_with_retry`].
#[derive(Debug)]
pub struct FlushOutcome {
    pub result: Result<u64, StoreError>,
    pub attempts: u32,
}

/// Insert one batch, retrying retryable failures with doubling backoff.
///
/// `max_attempts` counts the first attempt; zero is treated as one.
pub async fn insert_with_retry(
    store: &dyn MetricStore,
    batch_id: Uuid,
    records: &[MetricRecord],
    max_attempts: u32,
    initial_backoff: Duration,
    on_progress: Option<&ProgressCallback>,
) -> FlushOutcome {
    let mut attempts = 0;
    let result = retry_store_call(
        || store.insert_batch(batch_id, records),
        store.name(),
        batch_id,
        max_attempts,
        initial_backoff,
        on_progress,
        &mut attempts,
    )
    .await;
    FlushOutcome { result, attempts }
}

/// Insert a ranking snapshot with the same retry policy as record batches.
pub async fn insert_rankings_with_retry(
    store: &dyn MetricStore,
    batch_id: Uuid,
    rankings: &[RankingRecord],
    max_attempts: u32,
    initial_backoff: Duration,
    on_progress: Option<&ProgressCallback>,
) -> FlushOutcome {
    let mut attempts = 0;
    let result = retry_store_call(
        || store.insert_rankings(batch_id, rankings),
        store.name(),
        batch_id,
        max_attempts,
        initial_backoff,
        on_progress,
        &mut attempts,
    )
    .await;
    FlushOutcome { result, attempts }
}

/// Retry loop shared by the insert helpers. `attempts` is updated before each
/// try, so it stays accurate when the future is dropped mid-retry.
async fn retry_store_call<F, Fut>(
    mut call: F,
    store: &str,
    batch_id: Uuid,
    max_attempts: u32,
    initial_backoff: Duration,
    on_progress: Option<&ProgressCallback>,
    attempts: &mut u32,
) -> Result<u64, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64, StoreError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut backoff = initial_backoff;

    loop {
        *attempts += 1;
        let attempt = *attempts;
        match call().await {
            Ok(rows) => return Ok(rows),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    %batch_id,
                    store,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Batch insert failed, retrying"
                );
                emit(
                    on_progress,
                    IngestProgress::BatchRetry {
                        batch_id,
                        attempt,
                        backoff_ms: backoff.as_millis() as u64,
                        error: short_error_message(&e),
                    },
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of the writer stage.
#[derive(Debug, Default)]
#[must_use = "WriterReport may contain undelivered records that should be reported"]
pub struct WriterReport {
    /// Rows the store reported as written.
    pub records_written: u64,
    /// Size of every successfully written batch, in flush order.
    pub flushes: Vec<usize>,
    /// Batches that were never delivered.
    pub undelivered: Vec<UndeliveredBatch>,
    /// Panic message if the task did not finish normally.
    pub panic_info: Option<String>,
}

impl WriterReport {
    pub fn has_errors(&self) -> bool {
        !self.undelivered.is_empty() || self.panic_info.is_some()
    }

    /// Records that never reached the store.
    pub fn undelivered_records(&self) -> usize {
        self.undelivered.iter().map(|b| b.records.len()).sum()
    }
}

struct Writer {
    store: Arc<dyn MetricStore>,
    config: WriterConfig,
    batch: MetricBatch,
    requeued: VecDeque<PendingBatch>,
    fatal_tx: mpsc::UnboundedSender<UndeliveredBatch>,
    on_progress: Option<Arc<ProgressCallback>>,
    report: WriterReport,
}

impl Writer {
    /// Flush requeued batches, then the current one.
    ///
    /// The final flush shares one deadline across every batch it delivers.
    async fn flush(&mut self, is_final: bool) {
        let deadline = is_final.then(|| Instant::now() + self.config.final_flush_timeout);
        let pending = self.batch.take();
        let requeued: Vec<PendingBatch> = self.requeued.drain(..).collect();
        for batch in requeued {
            self.deliver(batch, deadline).await;
        }
        if !pending.is_empty() {
            self.deliver(pending, deadline).await;
        }
    }

    async fn attempt(&self, pending: &PendingBatch, deadline: Option<Instant>) -> FlushOutcome {
        let expired = || StoreError::DeadlineExceeded(self.config.final_flush_timeout);
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return FlushOutcome {
                result: Err(expired()),
                attempts: 0,
            };
        }

        let mut attempts = 0;
        let result = {
            let store = self.store.as_ref();
            let insert = retry_store_call(
                || store.insert_batch(pending.id, &pending.records),
                store.name(),
                pending.id,
                self.config.max_attempts,
                self.config.backoff,
                self.on_progress.as_deref(),
                &mut attempts,
            );
            match deadline {
                None => insert.await,
                Some(deadline) => timeout_at(deadline, insert)
                    .await
                    .unwrap_or_else(|_| Err(expired())),
            }
        };
        FlushOutcome { result, attempts }
    }

    async fn deliver(&mut self, mut pending: PendingBatch, deadline: Option<Instant>) {
        let is_final = deadline.is_some();
        let on_progress = self.on_progress.as_deref();
        let batch_size = pending.len();
        emit(
            on_progress,
            IngestProgress::FlushingBatch {
                batch_id: pending.id,
                count: batch_size,
                final_batch: is_final,
            },
        );
        tracing::debug!(batch_id = %pending.id, batch_size, is_final, "Flushing batch");

        let flush_start = Instant::now();
        let outcome = self.attempt(&pending, deadline).await;
        pending.attempts += outcome.attempts;

        match outcome.result {
            Ok(rows) => {
                tracing::debug!(
                    batch_id = %pending.id,
                    batch_size,
                    rows,
                    attempts = pending.attempts,
                    elapsed_ms = flush_start.elapsed().as_millis() as u64,
                    "Wrote batch"
                );
                self.report.records_written += rows;
                self.report.flushes.push(batch_size);
                emit(
                    on_progress,
                    IngestProgress::BatchWritten {
                        batch_id: pending.id,
                        count: batch_size,
                        attempts: pending.attempts,
                    },
                );
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(
                    batch_id = %pending.id,
                    batch_size,
                    attempts = pending.attempts,
                    error = %error,
                    "Batch undelivered"
                );
                emit(
                    on_progress,
                    IngestProgress::BatchUndelivered {
                        batch_id: pending.id,
                        count: batch_size,
                        error: short_error_message(&e),
                    },
                );

                let undelivered = UndeliveredBatch {
                    batch_id: pending.id,
                    records: pending.records.clone(),
                    attempts: pending.attempts,
                    error,
                };
                if self.fatal_tx.send(undelivered.clone()).is_err() {
                    tracing::warn!(batch_id = %pending.id, "Fatal channel closed");
                }

                match self.config.on_fatal {
                    FatalPolicy::Requeue if !is_final => self.requeued.push_back(pending),
                    FatalPolicy::Requeue => self.report.undelivered.push(undelivered),
                    FatalPolicy::Drop => {
                        for record in &undelivered.records {
                            tracing::error!(
                                batch_id = %undelivered.batch_id,
                                repository = %record.repository,
                                author = %record.author,
                                commits = record.commits,
                                "Dropping undelivered record"
                            );
                        }
                        self.report.undelivered.push(undelivered);
                    }
                }
            }
        }
    }
}

/// A running writer stage.
#[must_use = "await the writer with `await_writer` to collect its report"]
pub struct WriterTask {
    handle: tokio::task::JoinHandle<WriterReport>,
    close_input: CancellationToken,
}

/// Spawn the writer stage.
///
/// Every undelivered batch is sent on `fatal_tx` as soon as its attempts are
/// exhausted, so the owner can start draining without waiting for the writer
/// to finish.
pub fn spawn_writer(
    store: Arc<dyn MetricStore>,
    mut rx: mpsc::Receiver<MetricRecord>,
    config: WriterConfig,
    fatal_tx: mpsc::UnboundedSender<UndeliveredBatch>,
    on_progress: Option<Arc<ProgressCallback>>,
) -> WriterTask {
    let close_input = CancellationToken::new();
    let close_requested = close_input.clone();
    let handle = tokio::spawn(async move {
        let mut writer = Writer {
            batch: MetricBatch::new(config.max_records),
            store,
            config,
            requeued: VecDeque::new(),
            fatal_tx,
            on_progress,
            report: WriterReport::default(),
        };
        let task_start = Instant::now();
        let mut input_closed = false;

        loop {
            let deadline = writer.batch.deadline(writer.config.max_age);

            tokio::select! {
                biased;

                _ = close_requested.cancelled(), if !input_closed => {
                    tracing::warn!("Closing writer input, buffered records will be flushed");
                    rx.close();
                    input_closed = true;
                }

                record = rx.recv() => match record {
                    Some(record) => {
                        if writer.batch.push(record) {
                            writer.flush(false).await;
                        }
                    }
                    None => {
                        tracing::debug!("Record channel closed, flushing final batch");
                        writer.flush(true).await;
                        break;
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::debug!(batch_size = writer.batch.len(), "Age flush");
                    writer.flush(false).await;
                }
            }
        }

        tracing::debug!(
            flushes = writer.report.flushes.len(),
            written = writer.report.records_written,
            undelivered = writer.report.undelivered.len(),
            elapsed_ms = task_start.elapsed().as_millis() as u64,
            "Writer finished"
        );
        writer.report
    });

    WriterTask {
        handle,
        close_input,
    }
}

/// Await the writer, capturing panics into the report.
///
/// If the writer is still running after [`WRITER_TASK_TIMEOUT`], its input is
/// closed so it runs the final flush with whatever it has buffered. The task
/// is never aborted, so every record ends up written or undelivered.
pub async fn await_writer(task: WriterTask) -> WriterReport {
    let WriterTask {
        mut handle,
        close_input,
    } = task;

    let result = tokio::select! {
        result = &mut handle => result,
        _ = tokio::time::sleep(WRITER_TASK_TIMEOUT) => {
            tracing::warn!(
                timeout_secs = WRITER_TASK_TIMEOUT.as_secs(),
                "Writer still running, a record sender was probably never dropped"
            );
            close_input.cancel();
            handle.await
        }
    };

    match result {
        Ok(report) => report,
        Err(e) => {
            let panic_info = if e.is_panic() {
                let payload = e.into_panic();
                if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                }
            } else {
                "Writer task was cancelled".to_string()
            };
            tracing::error!(panic_info = %panic_info, "Writer task failed");
            WriterReport {
                panic_info: Some(panic_info),
                ..WriterReport::default()
            }
        }
    }
}
