//! Store that only logs what it would have written. Used for dry runs.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use super::MetricStore;
use crate::aggregate::MetricRecord;
use crate::error::StoreError;
use crate::ranking::RankingRecord;

#[derive(Debug, Default)]
pub struct LoggingStore {
    rows: AtomicU64,
}

impl LoggingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows "written" so far.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricStore for LoggingStore {
    async fn insert_batch(
        &self,
        batch_id: Uuid,
        records: &[MetricRecord],
    ) -> Result<u64, StoreError> {
        for record in records {
            tracing::info!(
                %batch_id,
                repository = %record.repository,
                author = %record.author,
                commits = record.commits,
                "dry-run record"
            );
        }
        let count = records.len() as u64;
        self.rows.fetch_add(count, Ordering::Relaxed);
        Ok(count)
    }

    async fn insert_rankings(
        &self,
        batch_id: Uuid,
        rankings: &[RankingRecord],
    ) -> Result<u64, StoreError> {
        for ranking in rankings {
            tracing::info!(
                %batch_id,
                position = ranking.position,
                repository = %ranking.repository,
                stars = ranking.stars,
                "dry-run ranking"
            );
        }
        Ok(rankings.len() as u64)
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}
