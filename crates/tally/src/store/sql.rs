//! Local SQL store backed by SeaORM (SQLite or PostgreSQL).

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait};
use uuid::Uuid;

use super::MetricStore;
use crate::aggregate::MetricRecord;
use crate::entity::author_commits::{ActiveModel, Column, Entity as AuthorCommits};
use crate::entity::repository_rankings::{
    ActiveModel as RankingModel, Column as RankingColumn, Entity as RepositoryRankings,
};
use crate::error::StoreError;
use crate::ranking::RankingRecord;

/// Conflict clause for the natural key. Replayed rows are skipped.
pub(crate) fn natural_key_conflict() -> OnConflict {
    OnConflict::columns([Column::Repository, Column::Author, Column::ObservedAt])
        .do_nothing()
        .to_owned()
}

/// One ranking row per repository per run.
pub(crate) fn ranking_conflict() -> OnConflict {
    OnConflict::columns([RankingColumn::Repository, RankingColumn::ObservedAt])
        .do_nothing()
        .to_owned()
}

/// Not `Clone`: share it behind an `Arc` and reach the connection through
/// [`SqlStore::connection`].
#[derive(Debug)]
pub struct SqlStore {
    db: DatabaseConnection,
}

impl SqlStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl MetricStore for SqlStore {
    async fn insert_batch(
        &self,
        batch_id: Uuid,
        records: &[MetricRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let models: Vec<ActiveModel> = records
            .iter()
            .map(|record| ActiveModel::from_record(record, batch_id))
            .collect();

        let rows = AuthorCommits::insert_many(models)
            .on_conflict(natural_key_conflict())
            .exec_without_returning(&self.db)
            .await?;

        tracing::debug!(%batch_id, attempted = records.len(), rows, "Inserted author commits");
        Ok(rows)
    }

    async fn insert_rankings(
        &self,
        batch_id: Uuid,
        rankings: &[RankingRecord],
    ) -> Result<u64, StoreError> {
        if rankings.is_empty() {
            return Ok(0);
        }

        let models: Vec<RankingModel> = rankings
            .iter()
            .map(|record| RankingModel::from_record(record, batch_id))
            .collect();

        let rows = RepositoryRankings::insert_many(models)
            .on_conflict(ranking_conflict())
            .exec_without_returning(&self.db)
            .await?;

        tracing::debug!(%batch_id, attempted = rankings.len(), rows, "Inserted repository rankings");
        Ok(rows)
    }

    fn name(&self) -> &'static str {
        "sql"
    }
}
