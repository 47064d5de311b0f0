//! GitHub REST v3 client for commit listings and top-repository search.
//!
//! Every request goes through the shared [`RateGovernor`]; the guard is held
//! only for the duration of the HTTP exchange, and the response's rate-limit
//! headers are fed back into the governor before the result is classified.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use url::Url;

use crate::error::FetchError;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::pipeline::progress::{IngestProgress, ProgressCallback, emit};
use crate::rate::{RateAdjustment, RateGovernor, RateLimitInfo};

use super::retry::{RetryConfig, with_retry};
use super::types::{
    CommitEntry, CommitsPayload, Cursor, FetchTask, Page, RankedRepository, RepoRef, SearchItem,
    SearchPayload,
};

/// Default GitHub API base URL.
pub const DEFAULT_API_URL: &str = "https://api.github.com";
/// Largest page GitHub serves.
pub const MAX_PAGE_SIZE: u32 = 100;
/// Default commit lookback.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);

const ACCEPT: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = concat!("tally/", env!("CARGO_PKG_VERSION"));

/// Client settings.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub token: Option<String>,
    /// Items per page, clamped to `1..=100`.
    pub page_size: u32,
    /// How far back to count commits from the start of the run.
    pub lookback: Duration,
    pub retry: RetryConfig,
}

impl GitHubConfig {
    /// Start of the commit window for a run that began at `started_at`.
    pub fn since(&self, started_at: DateTime<Utc>) -> Result<DateTime<Utc>, FetchError> {
        chrono::Duration::from_std(self.lookback)
            .ok()
            .and_then(|lookback| started_at.checked_sub_signed(lookback))
            .ok_or_else(|| {
                FetchError::InvalidConfig(format!(
                    "lookback of {}h is out of range",
                    self.lookback.as_secs() / 3600
                ))
            })
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            page_size: MAX_PAGE_SIZE,
            lookback: DEFAULT_LOOKBACK,
            retry: RetryConfig::default(),
        }
    }
}

/// Commit and search client over an [`HttpTransport`].
#[derive(Clone)]
pub struct GitHubClient {
    transport: Arc<dyn HttpTransport>,
    governor: RateGovernor,
    config: GitHubConfig,
    since: DateTime<Utc>,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl GitHubClient {
    /// Create a client. `started_at` anchors the lookback window so every page
    /// of every repository in a run uses the same `since`.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        governor: RateGovernor,
        config: GitHubConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        let since = config.since(started_at).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Using the default lookback instead");
            started_at - chrono::Duration::hours(24)
        });
        Self {
            since,
            transport,
            governor,
            config,
            on_progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, on_progress: Option<Arc<ProgressCallback>>) -> Self {
        self.on_progress = on_progress;
        self
    }

    #[must_use]
    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    #[must_use]
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    fn page_size(&self) -> u32 {
        self.config.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        let base = self.config.api_url.trim_end_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|e| FetchError::InvalidRepo(format!("{path}: {e}")))
    }

    /// URL of the first commits page for `repo`.
    pub fn commits_url(&self, repo: &RepoRef) -> Result<String, FetchError> {
        let mut url = self.endpoint(&format!("repos/{}/{}/commits", repo.owner, repo.name))?;
        url.query_pairs_mut()
            .append_pair(
                "since",
                &self.since.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair("per_page", &self.page_size().to_string());
        Ok(url.into())
    }

    /// URL of one page of the top-repositories search.
    pub fn search_url(&self, per_page: u32, page: u32) -> Result<String, FetchError> {
        let mut url = self.endpoint("search/repositories")?;
        url.query_pairs_mut()
            .append_pair("q", "stars:>1")
            .append_pair("sort", "stars")
            .append_pair("order", "desc")
            .append_pair("per_page", &per_page.to_string())
            .append_pair("page", &page.to_string());
        Ok(url.into())
    }

    fn request(&self, url: String) -> HttpRequest {
        let request = HttpRequest::get(url)
            .with_header("Accept", ACCEPT)
            .with_header("User-Agent", USER_AGENT);
        match &self.config.token {
            Some(token) => request.with_header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// One governed GET. Rate-limit headers are applied before returning.
    async fn get(&self, url: String) -> Result<HttpResponse, FetchError> {
        let guard = self.governor.acquire().await?;
        let result = self.transport.send(self.request(url)).await;
        guard.release();

        let response = result?;
        if let Some(info) = parse_rate_limit_headers(&response) {
            match self.governor.observe(&info) {
                Some(RateAdjustment::Rate { from, to }) => {
                    emit(
                        self.on_progress.as_deref(),
                        IngestProgress::RateAdjusted { from, to },
                    );
                }
                Some(RateAdjustment::Paused { pause }) => {
                    emit(
                        self.on_progress.as_deref(),
                        IngestProgress::RatePaused {
                            pause_ms: pause.as_millis() as u64,
                        },
                    );
                }
                None => {}
            }
        }
        Ok(response)
    }

    /// Classify a response. A server-requested delay pauses the shared
    /// governor, so every fetcher waits it out before the next attempt.
    fn check(&self, response: &HttpResponse) -> Result<(), FetchError> {
        check_status(response).inspect_err(|err| {
            if let Some(retry_after) = err.retry_after() {
                let pause = self.governor.hold_for(retry_after);
                tracing::warn!(
                    status = response.status,
                    pause_ms = pause.as_millis() as u64,
                    "Server requested a delay, pausing admission"
                );
                emit(
                    self.on_progress.as_deref(),
                    IngestProgress::RatePaused {
                        pause_ms: pause.as_millis() as u64,
                    },
                );
            }
        })
    }

    /// Fetch a single page once, without retrying.
    #[tracing::instrument(skip(self), fields(repo = %task.repo, page = task.page))]
    pub async fn fetch_page_once(&self, task: &FetchTask) -> Result<Page, FetchError> {
        let url = match &task.cursor {
            Cursor::Start => self.commits_url(&task.repo)?,
            Cursor::Next(url) => url.clone(),
        };

        let response = self.get(url.clone()).await?;
        self.check(&response)?;

        let payload: CommitsPayload = serde_json::from_slice(&response.body)
            .map_err(|e| FetchError::unparseable(url.clone(), e))?;
        let items = match payload {
            CommitsPayload::Commits(items) => items,
            CommitsPayload::Error(body) => {
                return Err(FetchError::Api {
                    status: response.status,
                    message: body.message,
                });
            }
        };

        let mut entries = Vec::with_capacity(items.len());
        let mut skipped = 0;
        for item in &items {
            match item.author_identity() {
                Some(author) => entries.push(CommitEntry {
                    repo: task.repo.clone(),
                    author: author.to_string(),
                    sha: item.sha.clone(),
                }),
                None => skipped += 1,
            }
        }

        let next = response.header("link").and_then(parse_next_link);
        tracing::debug!(
            entries = entries.len(),
            skipped,
            has_next = next.is_some(),
            "Fetched commits page"
        );

        Ok(Page {
            repo: task.repo.clone(),
            number: task.page,
            entries,
            skipped,
            next,
        })
    }

    /// Fetch a page, retrying transient failures.
    pub async fn fetch_page(&self, task: &FetchTask) -> Result<Page, FetchError> {
        with_retry(
            || self.fetch_page_once(task),
            &self.config.retry,
            &task.repo,
            self.on_progress.as_deref(),
        )
        .await
    }

    /// The `limit` most-starred repositories, in descending star order.
    ///
    /// Positions are 1-based and contiguous. A repository that shifts onto a
    /// later search page while paging is kept at its first position.
    pub async fn top_repositories(&self, limit: usize) -> Result<Vec<RankedRepository>, FetchError> {
        emit(
            self.on_progress.as_deref(),
            IngestProgress::DiscoveringTop { limit },
        );

        let per_page = limit.clamp(1, MAX_PAGE_SIZE as usize) as u32;
        let search_scope = RepoRef::new("search", "repositories");
        let mut ranked: Vec<RankedRepository> = Vec::with_capacity(limit);
        let mut page = 1;

        while ranked.len() < limit {
            let url = self.search_url(per_page, page)?;
            let items = with_retry(
                || self.search_once(url.clone()),
                &self.config.retry,
                &search_scope,
                self.on_progress.as_deref(),
            )
            .await?;

            let fetched = items.len();
            for item in items {
                let position = ranked.len() as u32 + 1;
                let Some(entry) = item.ranked(position) else {
                    continue;
                };
                if ranked.len() < limit && !ranked.iter().any(|r| r.repo == entry.repo) {
                    ranked.push(entry);
                }
            }
            if fetched < per_page as usize {
                break;
            }
            page += 1;
        }

        tracing::info!(count = ranked.len(), limit, "Discovered top repositories");
        emit(
            self.on_progress.as_deref(),
            IngestProgress::Discovered {
                count: ranked.len(),
            },
        );
        Ok(ranked)
    }

    async fn search_once(&self, url: String) -> Result<Vec<SearchItem>, FetchError> {
        let response = self.get(url.clone()).await?;
        self.check(&response)?;

        let payload: SearchPayload = serde_json::from_slice(&response.body)
            .map_err(|e| FetchError::unparseable(url, e))?;
        match payload {
            SearchPayload::Results(results) => Ok(results.items),
            SearchPayload::Error(body) => Err(FetchError::Api {
                status: response.status,
                message: body.message,
            }),
        }
    }
}

/// Map a non-success response to its error class.
fn check_status(response: &HttpResponse) -> Result<(), FetchError> {
    if response.is_success() {
        return Ok(());
    }

    let status = response.status;
    let retry_after = parse_retry_after(response);
    let remaining = response
        .header("x-ratelimit-remaining")
        .and_then(|v| v.trim().parse::<usize>().ok());
    let message = api_error_message(response);

    match status {
        429 => Err(FetchError::RateLimited {
            status,
            retry_after,
        }),
        403 if remaining == Some(0) || retry_after.is_some() => Err(FetchError::RateLimited {
            status,
            retry_after,
        }),
        500..=599 => Err(FetchError::Server { status, message }),
        _ => Err(FetchError::Api { status, message }),
    }
}

fn api_error_message(response: &HttpResponse) -> String {
    serde_json::from_slice::<super::types::ApiErrorBody>(&response.body)
        .map(|body| body.message)
        .unwrap_or_else(|_| response.body_snippet())
}

fn parse_retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parse GitHub's rate-limit headers.
///
/// Returns `None` unless limit, remaining and reset are all present.
#[must_use]
pub fn parse_rate_limit_headers(response: &HttpResponse) -> Option<RateLimitInfo> {
    let limit = response
        .header("x-ratelimit-limit")
        .and_then(|v| v.trim().parse::<usize>().ok())?;
    let remaining = response
        .header("x-ratelimit-remaining")
        .and_then(|v| v.trim().parse::<usize>().ok())?;
    let reset_epoch = response
        .header("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let reset_at = DateTime::from_timestamp(reset_epoch, 0).unwrap_or_else(Utc::now);
    Some(RateLimitInfo {
        limit,
        remaining,
        reset_at,
        retry_after: parse_retry_after(response),
    })
}

/// Extract the `rel="next"` URL from a `Link` header.
#[must_use]
pub fn parse_next_link(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let mut url = None;
        let mut is_next = false;

        for segment in part.split(';') {
            let segment = segment.trim();
            if segment.starts_with('<') && segment.ends_with('>') {
                url = Some(&segment[1..segment.len() - 1]);
            } else if let Some(rel) = segment.strip_prefix("rel=") {
                is_next = rel.trim_matches('"').split_whitespace().any(|r| r == "next");
            }
        }

        if is_next && let Some(url) = url {
            return Some(url.to_string());
        }
    }
    None
}
