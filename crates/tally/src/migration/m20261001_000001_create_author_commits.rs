//! Create the `author_commits` table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AuthorCommits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthorCommits::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuthorCommits::Repository).string().not_null())
                    .col(ColumnDef::new(AuthorCommits::Author).string().not_null())
                    .col(
                        ColumnDef::new(AuthorCommits::Commits)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthorCommits::ObservedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AuthorCommits::BatchId).uuid().not_null())
                    .to_owned(),
            )
            .await?;

        // Natural key; retried batches collide here and are skipped.
        manager
            .create_index(
                Index::create()
                    .name("idx_author_commits_natural_key")
                    .table(AuthorCommits::Table)
                    .col(AuthorCommits::Repository)
                    .col(AuthorCommits::Author)
                    .col(AuthorCommits::ObservedAt)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_author_commits_observed_at")
                    .table(AuthorCommits::Table)
                    .col(AuthorCommits::ObservedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AuthorCommits::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AuthorCommits {
    Table,
    Id,
    Repository,
    Author,
    Commits,
    ObservedAt,
    BatchId,
}
