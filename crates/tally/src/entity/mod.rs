//! SeaORM entity definitions for the local metrics schema.

pub mod author_commits;
pub mod repository_rankings;

pub use author_commits::{
    ActiveModel as AuthorCommitsActiveModel, Column as AuthorCommitsColumn,
    Entity as AuthorCommits, Model as AuthorCommitsModel,
};
pub use repository_rankings::{
    ActiveModel as RepositoryRankingsActiveModel, Column as RepositoryRankingsColumn,
    Entity as RepositoryRankings, Model as RepositoryRankingsModel,
};
