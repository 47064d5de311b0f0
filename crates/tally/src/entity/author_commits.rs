//! AuthorCommits entity - one row per (repository, author, observation).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::MetricRecord;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "author_commits")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// `owner/name`.
    pub repository: String,

    /// Account login, git author name or email, in that order of preference.
    pub author: String,

    pub commits: i64,

    /// Start of the run that produced this count.
    pub observed_at: DateTimeWithTimeZone,

    /// Batch that delivered the row. Retries of a batch reuse the same id.
    pub batch_id: Uuid,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl ActiveModel {
    /// Build an insertable row from a metric record.
    #[must_use]
    pub fn from_record(record: &MetricRecord, batch_id: Uuid) -> Self {
        use sea_orm::ActiveValue::Set;

        Self {
            id: Set(Uuid::new_v4()),
            repository: Set(record.repository.clone()),
            author: Set(record.author.clone()),
            commits: Set(i64::try_from(record.commits).unwrap_or(i64::MAX)),
            observed_at: Set(record.observed_at.fixed_offset()),
            batch_id: Set(batch_id),
        }
    }
}

impl From<Model> for MetricRecord {
    fn from(model: Model) -> Self {
        Self {
            repository: model.repository,
            author: model.author,
            commits: u64::try_from(model.commits).unwrap_or(0),
            observed_at: model.observed_at.to_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::ActiveValue;

    #[test]
    fn from_record_sets_every_column() {
        let observed_at = Utc::now();
        let record = MetricRecord {
            repository: "o/r".into(),
            author: "alice".into(),
            commits: 7,
            observed_at,
        };
        let batch_id = Uuid::new_v4();
        let model = ActiveModel::from_record(&record, batch_id);

        assert_eq!(model.repository, ActiveValue::Set("o/r".to_string()));
        assert_eq!(model.author, ActiveValue::Set("alice".to_string()));
        assert_eq!(model.commits, ActiveValue::Set(7));
        assert_eq!(model.batch_id, ActiveValue::Set(batch_id));
        assert_eq!(model.observed_at, ActiveValue::Set(observed_at.fixed_offset()));
    }

    #[test]
    fn model_converts_back_to_record() {
        let observed_at = Utc::now();
        let model = Model {
            id: Uuid::new_v4(),
            repository: "o/r".into(),
            author: "bob".into(),
            commits: 3,
            observed_at: observed_at.fixed_offset(),
            batch_id: Uuid::new_v4(),
        };
        let record = MetricRecord::from(model);
        assert_eq!(record.commits, 3);
        assert_eq!(record.observed_at, observed_at);
    }
}
