//! Metric stores.
//!
//! A store receives one bulk insert per flushed batch. Every insert carries
//! the batch id, and retries of the same batch reuse it, so a store can make
//! replays idempotent.

pub mod clickhouse;
pub mod logging;
pub mod sql;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::MetricRecord;
use crate::error::StoreError;
use crate::ranking::RankingRecord;

pub use clickhouse::{ClickHouseConfig, ClickHouseStore};
pub use logging::LoggingStore;
pub use sql::SqlStore;

/// Destination for finalized metric records.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Write `records` in a single bulk insert.
    ///
    /// Returns the number of rows the store reports as written. Rows skipped
    /// as duplicates of an earlier attempt are not counted.
    async fn insert_batch(&self, batch_id: Uuid, records: &[MetricRecord])
    -> Result<u64, StoreError>;

    /// Write one ranking snapshot in a single bulk insert.
    ///
    /// Same replay rules as [`MetricStore::insert_batch`]. Stores that keep no
    /// rankings reject the call.
    async fn insert_rankings(
        &self,
        _batch_id: Uuid,
        _rankings: &[RankingRecord],
    ) -> Result<u64, StoreError> {
        Err(StoreError::InvalidConfig(format!(
            "{} store does not keep rankings",
            self.name()
        )))
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
