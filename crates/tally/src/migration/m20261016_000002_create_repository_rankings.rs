//! Create the `repository_rankings` table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RepositoryRankings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepositoryRankings::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepositoryRankings::Repository)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryRankings::Position)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryRankings::Stars)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryRankings::Watchers)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepositoryRankings::Forks)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RepositoryRankings::Language).string().null())
                    .col(ColumnDef::new(RepositoryRankings::HtmlUrl).string().null())
                    .col(
                        ColumnDef::new(RepositoryRankings::ObservedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RepositoryRankings::BatchId).uuid().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repository_rankings_natural_key")
                    .table(RepositoryRankings::Table)
                    .col(RepositoryRankings::Repository)
                    .col(RepositoryRankings::ObservedAt)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RepositoryRankings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepositoryRankings {
    Table,
    Id,
    Repository,
    Position,
    Stars,
    Watchers,
    Forks,
    Language,
    HtmlUrl,
    ObservedAt,
    BatchId,
}
