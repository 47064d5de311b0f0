//! The in-memory batch the writer fills between flushes.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::aggregate::MetricRecord;

/// Records taken out of a [`MetricBatch`] for one delivery attempt cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    pub id: Uuid,
    pub records: Vec<MetricRecord>,
    /// Attempts already spent on this batch in earlier cycles.
    pub attempts: u32,
}

impl PendingBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Ordered buffer bounded by record count and age.
#[derive(Debug)]
pub struct MetricBatch {
    records: Vec<MetricRecord>,
    max_records: usize,
    opened_at: Option<Instant>,
}

impl MetricBatch {
    /// A zero `max_records` is treated as 1.
    #[must_use]
    pub fn new(max_records: usize) -> Self {
        let max_records = max_records.max(1);
        Self {
            records: Vec::with_capacity(max_records),
            max_records,
            opened_at: None,
        }
    }

    /// Append a record. Returns `true` once the size bound is reached and the
    /// batch must be flushed before anything else is appended.
    pub fn push(&mut self, record: MetricRecord) -> bool {
        debug_assert!(!self.is_full(), "push into a full batch");
        if self.records.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.records.push(record);
        self.is_full()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// When the oldest buffered record exceeds `max_age`. `None` while empty.
    #[must_use]
    pub fn deadline(&self, max_age: Duration) -> Option<Instant> {
        self.opened_at.map(|opened| opened + max_age)
    }

    /// Move the buffered records out under a fresh batch id, leaving the
    /// batch empty.
    pub fn take(&mut self) -> PendingBatch {
        self.opened_at = None;
        PendingBatch {
            id: Uuid::new_v4(),
            records: std::mem::replace(&mut self.records, Vec::with_capacity(self.max_records)),
            attempts: 0,
        }
    }
}
