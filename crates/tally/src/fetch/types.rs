//! Fetch-side data model and the GitHub wire types it is decoded from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// A repository addressed as `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    #[must_use]
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// `owner/name`, the form stored in metric records.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(FetchError::InvalidRepo(s.to_string())),
        }
    }
}

/// Where a fetch task resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// First page, built from the repository and lookback window.
    Start,
    /// Absolute URL taken from the previous page's `Link: rel="next"`.
    Next(String),
}

/// One unit of fetch work. Never mutated: advancing produces a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub repo: RepoRef,
    pub cursor: Cursor,
    /// 1-indexed page number this task will fetch.
    pub page: u32,
}

impl FetchTask {
    #[must_use]
    pub fn start(repo: RepoRef) -> Self {
        Self {
            repo,
            cursor: Cursor::Start,
            page: 1,
        }
    }

    /// Task for the page after this one.
    #[must_use]
    pub fn advance(&self, next_url: String) -> Self {
        Self {
            repo: self.repo.clone(),
            cursor: Cursor::Next(next_url),
            page: self.page + 1,
        }
    }
}

/// One commit attributed to an author within a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub repo: RepoRef,
    pub author: String,
    pub sha: String,
}

/// The decoded result of one successful API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub repo: RepoRef,
    pub number: u32,
    pub entries: Vec<CommitEntry>,
    /// Commits without any usable author identity.
    pub skipped: usize,
    /// Absolute URL of the next page, if any.
    pub next: Option<String>,
}

impl Page {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

// ---------- GitHub wire types ----------

/// Item of `GET /repos/{owner}/{repo}/commits`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitItem {
    pub sha: String,
    #[serde(default)]
    pub author: Option<AccountRef>,
    pub commit: CommitDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountRef {
    #[serde(default)]
    pub login: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitDetail {
    #[serde(default)]
    pub author: Option<GitSignature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitSignature {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl CommitItem {
    /// Account login, then git author name, then git author email.
    #[must_use]
    pub fn author_identity(&self) -> Option<&str> {
        let signature = self.commit.author.as_ref();
        non_empty(self.author.as_ref().and_then(|a| a.login.as_ref()))
            .or_else(|| non_empty(signature.and_then(|s| s.name.as_ref())))
            .or_else(|| non_empty(signature.and_then(|s| s.email.as_ref())))
    }
}

/// Error object returned by GitHub in place of a resource.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
    #[serde(default)]
    pub documentation_url: Option<String>,
}

/// Body of the commits endpoint: either a list or an error object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommitsPayload {
    Commits(Vec<CommitItem>),
    Error(ApiErrorBody),
}

/// Body of `GET /search/repositories`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SearchPayload {
    Results(SearchResults),
    Error(ApiErrorBody),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub total_count: u64,
    pub items: Vec<SearchItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchItem {
    pub name: String,
    pub owner: AccountRef,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub watchers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub language: Option<String>,
}

impl SearchItem {
    #[must_use]
    pub fn repo_ref(&self) -> Option<RepoRef> {
        if let Some(full_name) = &self.full_name
            && let Ok(repo) = full_name.parse()
        {
            return Some(repo);
        }
        let owner = non_empty(self.owner.login.as_ref())?;
        Some(RepoRef::new(owner, self.name.clone()))
    }

    /// This item at `position` in the star ranking.
    #[must_use]
    pub fn ranked(&self, position: u32) -> Option<RankedRepository> {
        Some(RankedRepository {
            repo: self.repo_ref()?,
            position,
            stars: self.stargazers_count,
            watchers: self.watchers_count,
            forks: self.forks_count,
            language: self.language.clone().filter(|l| !l.is_empty()),
            html_url: self.html_url.clone(),
        })
    }
}

/// A repository from the top-by-stars search, with its 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedRepository {
    pub repo: RepoRef,
    pub position: u32,
    pub stars: u64,
    pub watchers: u64,
    pub forks: u64,
    pub language: Option<String>,
    pub html_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_parses_owner_and_name() {
        let repo: RepoRef = "rust-lang/rust".parse().unwrap();
        assert_eq!(repo, RepoRef::new("rust-lang", "rust"));
        assert_eq!(repo.to_string(), "rust-lang/rust");
        assert_eq!(repo.full_name(), "rust-lang/rust");
    }

    #[test]
    fn repo_ref_rejects_malformed_input() {
        for bad in ["rust", "/rust", "rust-lang/", "a/b/c", ""] {
            assert!(
                matches!(bad.parse::<RepoRef>(), Err(FetchError::InvalidRepo(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn fetch_task_advance_keeps_repo_and_increments_page() {
        let task = FetchTask::start(RepoRef::new("o", "r"));
        let next = task.advance("https://api.github.com/x?page=2".into());
        assert_eq!(task.page, 1);
        assert_eq!(task.cursor, Cursor::Start);
        assert_eq!(next.page, 2);
        assert_eq!(next.repo, task.repo);
        assert_eq!(
            next.cursor,
            Cursor::Next("https://api.github.com/x?page=2".into())
        );
    }

    #[test]
    fn author_identity_prefers_login_then_name_then_email() {
        let json = r#"[
            {"sha": "1", "author": {"login": "octocat"}, "commit": {"author": {"name": "Octo Cat", "email": "o@c"}}},
            {"sha": "2", "author": null, "commit": {"author": {"name": "Jane", "email": "j@x"}}},
            {"sha": "3", "author": {"login": ""}, "commit": {"author": {"name": " ", "email": "e@x"}}},
            {"sha": "4", "author": null, "commit": {"author": null}}
        ]"#;
        let items: Vec<CommitItem> = serde_json::from_str(json).unwrap();
        let identities: Vec<_> = items.iter().map(CommitItem::author_identity).collect();
        assert_eq!(
            identities,
            vec![Some("octocat"), Some("Jane"), Some("e@x"), None]
        );
    }

    #[test]
    fn commits_payload_distinguishes_error_objects() {
        let payload: CommitsPayload =
            serde_json::from_str(r#"{"message": "Git Repository is empty."}"#).unwrap();
        assert!(matches!(
            payload,
            CommitsPayload::Error(ApiErrorBody { ref message, .. }) if message == "Git Repository is empty."
        ));

        let payload: CommitsPayload = serde_json::from_str("[]").unwrap();
        assert!(matches!(payload, CommitsPayload::Commits(items) if items.is_empty()));

        assert!(serde_json::from_str::<CommitsPayload>(r#"{"unexpected": true}"#).is_err());
    }

    #[test]
    fn search_item_repo_ref_uses_full_name_or_owner_login() {
        let json = r#"{"total_count": 2, "items": [
            {"name": "rust", "full_name": "rust-lang/rust", "owner": {"login": "rust-lang"}},
            {"name": "linux", "owner": {"login": "torvalds"}}
        ]}"#;
        let SearchPayload::Results(results) = serde_json::from_str(json).unwrap() else {
            panic!("expected search results");
        };
        let repos: Vec<_> = results.items.iter().filter_map(SearchItem::repo_ref).collect();
        assert_eq!(
            repos,
            vec![
                RepoRef::new("rust-lang", "rust"),
                RepoRef::new("torvalds", "linux")
            ]
        );
    }
}
