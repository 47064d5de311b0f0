//! Paginated fetching of commit listings.
//!
//! One fetcher task runs per repository and walks its pages serially. Pages
//! are forwarded on a bounded channel, so a slow aggregator pushes back on
//! every fetcher.

pub mod github;
pub mod retry;
pub mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, short_error_message};
use crate::pipeline::progress::{IngestProgress, ProgressCallback, emit};
use crate::rate::GovernorError;

pub use github::{GitHubClient, GitHubConfig};
pub use retry::RetryConfig;
pub use types::{CommitEntry, Cursor, FetchTask, Page, RankedRepository, RepoRef};

/// Messages from fetchers to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// A decoded page. Pages of one repository arrive in order.
    Page(Page),
    /// The repository has no further pages.
    Exhausted { repo: RepoRef, pages: u32 },
    /// The repository failed terminally.
    Failed { repo: RepoRef, error: String },
}

/// How a single repository crawl ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Exhausted { pages: u32 },
    Failed(String),
    Cancelled,
}

/// Walk every page of `repo`, forwarding each as a [`FetchEvent`].
///
/// Stops at the first terminal failure or when `cancel` fires. Cancellation is
/// observed while waiting for admission, during the request, during retry
/// backoff and while blocked on the channel.
pub async fn crawl_repository(
    client: &GitHubClient,
    repo: RepoRef,
    tx: &mpsc::Sender<FetchEvent>,
    cancel: &CancellationToken,
    on_progress: Option<&Arc<ProgressCallback>>,
) -> CrawlOutcome {
    let on_progress = on_progress.map(Arc::as_ref);
    emit(
        on_progress,
        IngestProgress::RepoStarted {
            repo: repo.full_name(),
        },
    );

    let mut task = FetchTask::start(repo.clone());
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(&repo, on_progress),
            result = client.fetch_page(&task) => result,
        };

        let page = match result {
            Ok(page) => page,
            Err(FetchError::Governor(GovernorError::Closed)) => {
                return cancelled(&repo, on_progress);
            }
            Err(e) => {
                let error = short_error_message(&e);
                tracing::warn!(repo = %repo, page = task.page, error = %error, "Repository fetch failed");
                emit(
                    on_progress,
                    IngestProgress::RepoFailed {
                        repo: repo.full_name(),
                        error: error.clone(),
                    },
                );
                let event = FetchEvent::Failed {
                    repo: repo.clone(),
                    error: error.clone(),
                };
                if tx.send(event).await.is_err() {
                    return CrawlOutcome::Cancelled;
                }
                return CrawlOutcome::Failed(error);
            }
        };

        emit(
            on_progress,
            IngestProgress::PageFetched {
                repo: repo.full_name(),
                page: page.number,
                entries: page.entries.len(),
                skipped: page.skipped,
                has_next: page.next.is_some(),
            },
        );

        let next = page.next.clone();
        let pages = page.number;
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(&repo, on_progress),
            sent = tx.send(FetchEvent::Page(page)) => sent,
        };
        if sent.is_err() {
            return CrawlOutcome::Cancelled;
        }

        match next {
            Some(url) => task = task.advance(url),
            None => {
                if tx
                    .send(FetchEvent::Exhausted {
                        repo: repo.clone(),
                        pages,
                    })
                    .await
                    .is_err()
                {
                    return CrawlOutcome::Cancelled;
                }
                tracing::debug!(repo = %repo, pages, "Repository exhausted");
                return CrawlOutcome::Exhausted { pages };
            }
        }
    }
}

fn cancelled(repo: &RepoRef, on_progress: Option<&ProgressCallback>) -> CrawlOutcome {
    tracing::debug!(repo = %repo, "Repository fetch cancelled");
    emit(
        on_progress,
        IngestProgress::RepoCancelled {
            repo: repo.full_name(),
        },
    );
    CrawlOutcome::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::http::{HttpMethod, HttpResponse, MockTransport};
    use crate::rate::{GovernorConfig, RateGovernor};

    fn client(transport: &MockTransport) -> GitHubClient {
        let config = GitHubConfig {
            retry: RetryConfig::new(Duration::from_millis(10), Duration::from_millis(50), 2)
                .with_jitter(false),
            ..GitHubConfig::default()
        };
        GitHubClient::new(
            Arc::new(transport.clone()),
            RateGovernor::new(GovernorConfig::new(2, 10)).unwrap(),
            config,
            Utc::now(),
        )
    }

    fn page_response(authors: &[&str], next: Option<&str>) -> HttpResponse {
        let items: Vec<String> = authors
            .iter()
            .enumerate()
            .map(|(i, a)| {
                format!(r#"{{"sha":"{i}","author":{{"login":"{a}"}},"commit":{{"author":null}}}}"#)
            })
            .collect();
        let mut headers = Vec::new();
        if let Some(next) = next {
            headers.push(("Link".to_string(), format!("<{next}>; rel=\"next\"")));
        }
        HttpResponse {
            status: 200,
            headers,
            body: format!("[{}]", items.join(",")).into_bytes(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_forwards_pages_in_order_then_exhausted() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let repo = RepoRef::new("o", "r");
        let first = client.commits_url(&repo).unwrap();
        transport.push_response(
            HttpMethod::Get,
            first,
            page_response(&["a", "a"], Some("https://api.github.com/p2")),
        );
        transport.push_response(
            HttpMethod::Get,
            "https://api.github.com/p2",
            page_response(&["b"], None),
        );

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let outcome = crawl_repository(&client, repo.clone(), &tx, &cancel, None).await;
        drop(tx);
        assert_eq!(outcome, CrawlOutcome::Exhausted { pages: 2 });

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], FetchEvent::Page(p) if p.number == 1 && p.entries.len() == 2));
        assert!(matches!(&events[1], FetchEvent::Page(p) if p.number == 2 && p.is_last()));
        assert_eq!(events[2], FetchEvent::Exhausted { repo, pages: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_reports_terminal_failure() {
        let transport = MockTransport::new();
        let client = client(&transport);
        let repo = RepoRef::new("o", "private");
        transport.push_response(
            HttpMethod::Get,
            client.commits_url(&repo).unwrap(),
            HttpResponse {
                status: 404,
                headers: Vec::new(),
                body: br#"{"message":"Not Found"}"#.to_vec(),
            },
        );

        let (tx, mut rx) = mpsc::channel(8);
        let outcome =
            crawl_repository(&client, repo.clone(), &tx, &CancellationToken::new(), None).await;
        assert!(matches!(outcome, CrawlOutcome::Failed(ref e) if e.contains("Not Found")));
        assert!(matches!(rx.recv().await, Some(FetchEvent::Failed { repo: r, .. }) if r == repo));
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_stops_when_cancelled() {
        let transport = MockTransport::new().with_latency(Duration::from_secs(5));
        let client = client(&transport);
        let repo = RepoRef::new("o", "slow");
        transport.push_response(
            HttpMethod::Get,
            client.commits_url(&repo).unwrap(),
            page_response(&["a"], None),
        );

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = crawl_repository(&client, repo, &tx, &cancel, None).await;
        drop(tx);
        assert_eq!(outcome, CrawlOutcome::Cancelled);
        assert!(rx.recv().await.is_none());
    }
}
