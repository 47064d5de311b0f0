//! End-to-end runs of the ingestion pipeline.
//!
//! GitHub is replaced by a scripted transport that serves commit pages by
//! URL path. Records land in an in-memory SQLite database. Every run is
//! wrapped in a timeout so a stuck stage fails the test instead of hanging.

#![cfg(all(feature = "sqlite", feature = "migrate"))]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{EntityTrait, PaginatorTrait};
use tally::entity::AuthorCommits;
use tally::fetch::{GitHubConfig, RetryConfig};
use tally::http::{HttpError, HttpRequest, HttpResponse, HttpTransport};
use tally::store::SqlStore;
use tally::{
    DrainReason, GovernorConfig, IngestProgress, MetricRecord, MetricStore, Pipeline,
    PipelineOptions,
    ProgressCallback, RepoRef, RunState, WriterConfig, connect_and_migrate,
};

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves responses keyed by URL path. Each path holds a FIFO queue; the
/// last response of a queue is repeated once the queue is down to one.
#[derive(Default)]
struct ScriptedTransport {
    routes: Mutex<HashMap<String, Vec<HttpResponse>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn route(&self, path: &str, response: HttpResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = url::Url::parse(&request.url)
            .map_err(|e| HttpError::Transport(e.to_string()))?
            .path()
            .to_string();

        let mut routes = self.routes.lock().unwrap();
        let queue = routes
            .get_mut(&path)
            .ok_or_else(|| HttpError::Transport(format!("no route for {path}")))?;
        if queue.len() > 1 {
            Ok(queue.remove(0))
        } else {
            Ok(queue[0].clone())
        }
    }
}

fn commits(authors: &[&str], next: Option<&str>) -> HttpResponse {
    let items: Vec<serde_json::Value> = authors
        .iter()
        .enumerate()
        .map(|(i, login)| {
            serde_json::json!({
                "sha": format!("{i:040x}"),
                "author": { "login": login },
                "commit": { "author": { "name": login, "email": format!("{login}@example.com") } }
            })
        })
        .collect();
    let headers = next
        .map(|next| vec![("Link".to_string(), format!("<{next}>; rel=\"next\""))])
        .unwrap_or_default();
    HttpResponse {
        status: 200,
        headers,
        body: serde_json::to_vec(&items).unwrap(),
    }
}

fn status(code: u16, message: &str) -> HttpResponse {
    HttpResponse {
        status: code,
        headers: Vec::new(),
        body: serde_json::to_vec(&serde_json::json!({ "message": message })).unwrap(),
    }
}

async fn setup_test_store() -> Arc<SqlStore> {
    let db = connect_and_migrate("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    Arc::new(SqlStore::new(db))
}

fn github() -> GitHubConfig {
    GitHubConfig {
        api_url: "https://github.test".to_string(),
        retry: RetryConfig::new(Duration::from_millis(5), Duration::from_millis(20), 3)
            .with_jitter(false),
        ..GitHubConfig::default()
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        governor: GovernorConfig::new(2, 50),
        writer: WriterConfig {
            max_records: 2,
            max_age: Duration::from_millis(50),
            ..WriterConfig::default()
        },
        ..PipelineOptions::default()
    }
}

#[tokio::test]
async fn test_run_persists_per_author_counts() {
    let store = setup_test_store().await;
    let transport = Arc::new(ScriptedTransport::default());
    transport.route(
        "/repos/acme/widgets/commits",
        commits(&["alice", "alice", "bob"], Some("https://github.test/page/widgets/2")),
    );
    transport.route("/page/widgets/2", commits(&["carol", "alice"], None));
    transport.route("/repos/acme/gadgets/commits", status(502, "Bad Gateway"));
    transport.route("/repos/acme/gadgets/commits", commits(&["dave"], None));
    transport.route("/repos/acme/missing/commits", status(404, "Not Found"));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let on_progress: ProgressCallback = Box::new(move |event| sink.lock().unwrap().push(event));
    let pipeline = Pipeline::new(
        transport.clone(),
        github(),
        Arc::clone(&store) as Arc<dyn MetricStore>,
        options(),
    )
    .unwrap()
    .with_progress(Arc::new(on_progress));
    let state = pipeline.state();

    let targets: Vec<RepoRef> = ["acme/widgets", "acme/gadgets", "acme/missing"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    let summary = tokio::time::timeout(RUN_TIMEOUT, pipeline.run(targets))
        .await
        .expect("run timed out");

    assert_eq!(*state.borrow(), RunState::Stopped);
    assert_eq!(summary.drain_reason, Some(DrainReason::Exhausted));
    assert_eq!(summary.succeeded.len(), 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].repo, RepoRef::new("acme", "missing"));
    assert!(summary.partial.is_empty());
    assert_eq!(summary.records_written, 4);
    assert!(summary.fatal.is_none());

    let mut rows: Vec<(String, String, u64)> = AuthorCommits::find()
        .all(store.connection())
        .await
        .unwrap()
        .into_iter()
        .map(MetricRecord::from)
        .map(|r| (r.repository, r.author, r.commits))
        .collect();
    rows.sort();
    assert_eq!(
        rows,
        vec![
            ("acme/gadgets".to_string(), "dave".to_string(), 1),
            ("acme/widgets".to_string(), "alice".to_string(), 3),
            ("acme/widgets".to_string(), "bob".to_string(), 1),
            ("acme/widgets".to_string(), "carol".to_string(), 1),
        ]
    );

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        IngestProgress::FetchRetry { repo, .. } if repo == "acme/gadgets"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        IngestProgress::StateChanged { to: RunState::Draining, .. }
    )));
}

#[tokio::test]
async fn test_stop_before_any_page_leaves_store_empty() {
    let store = setup_test_store().await;
    let transport = Arc::new(ScriptedTransport::default());
    transport.route("/repos/acme/widgets/commits", commits(&["alice"], None));

    let pipeline = Pipeline::new(
        transport.clone(),
        github(),
        Arc::clone(&store) as Arc<dyn MetricStore>,
        options(),
    )
    .unwrap();
    pipeline.stop_handle().stop();

    let summary = tokio::time::timeout(
        RUN_TIMEOUT,
        pipeline.run(vec![RepoRef::new("acme", "widgets")]),
    )
    .await
    .expect("run timed out");

    assert_eq!(summary.drain_reason, Some(DrainReason::StopRequested));
    assert_eq!(summary.partial, vec![RepoRef::new("acme", "widgets")]);
    assert_eq!(summary.records_written, 0);
    assert_eq!(transport.calls(), 0);
    assert_eq!(AuthorCommits::find().count(store.connection()).await.unwrap(), 0);
}
