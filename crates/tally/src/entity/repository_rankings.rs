//! RepositoryRankings entity - one row per (repository, observation).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::ranking::RankingRecord;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "repository_rankings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// `owner/name`.
    pub repository: String,

    /// 1-based place in the top-by-stars search.
    pub position: i32,

    pub stars: i64,
    pub watchers: i64,
    pub forks: i64,
    pub language: Option<String>,
    pub html_url: Option<String>,

    pub observed_at: DateTimeWithTimeZone,
    pub batch_id: Uuid,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl ActiveModel {
    #[must_use]
    pub fn from_record(record: &RankingRecord, batch_id: Uuid) -> Self {
        use sea_orm::ActiveValue::Set;

        Self {
            id: Set(Uuid::new_v4()),
            repository: Set(record.repository.clone()),
            position: Set(i32::try_from(record.position).unwrap_or(i32::MAX)),
            stars: Set(to_i64(record.stars)),
            watchers: Set(to_i64(record.watchers)),
            forks: Set(to_i64(record.forks)),
            language: Set(record.language.clone()),
            html_url: Set(record.html_url.clone()),
            observed_at: Set(record.observed_at.fixed_offset()),
            batch_id: Set(batch_id),
        }
    }
}

impl From<Model> for RankingRecord {
    fn from(model: Model) -> Self {
        Self {
            repository: model.repository,
            position: u32::try_from(model.position).unwrap_or(0),
            stars: u64::try_from(model.stars).unwrap_or(0),
            watchers: u64::try_from(model.watchers).unwrap_or(0),
            forks: u64::try_from(model.forks).unwrap_or(0),
            language: model.language,
            html_url: model.html_url,
            observed_at: model.observed_at.to_utc(),
        }
    }
}
