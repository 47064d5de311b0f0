//! ClickHouse store over the HTTP interface.
//!
//! Each batch is one `INSERT ... FORMAT JSONEachRow` POST. The batch id is
//! sent as `insert_deduplication_token`, so a retried batch that already
//! landed is dropped by ClickHouse instead of being counted twice. Ranking
//! snapshots go to a second table the same way.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::MetricStore;
use crate::aggregate::MetricRecord;
use crate::error::StoreError;
use crate::http::{HttpRequest, HttpTransport};
use crate::ranking::RankingRecord;

/// Columns written by every record insert, in order.
pub const COLUMNS: [&str; 4] = ["repository", "author", "commits", "observed_at"];
/// Columns written by every ranking insert, in order.
pub const RANKING_COLUMNS: [&str; 8] = [
    "repository",
    "position",
    "stars",
    "watchers",
    "forks",
    "language",
    "html_url",
    "observed_at",
];

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Connection settings for ClickHouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub table: String,
    pub rankings_table: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            user: "default".to_string(),
            password: None,
            database: "default".to_string(),
            table: "author_commits".to_string(),
            rankings_table: "repository_rankings".to_string(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// One JSONEachRow line. `observed_at` uses ClickHouse's `DateTime` text form.
#[derive(Debug, Serialize)]
struct Row<'a> {
    repository: &'a str,
    author: &'a str,
    commits: u64,
    observed_at: String,
}

impl<'a> From<&'a MetricRecord> for Row<'a> {
    fn from(record: &'a MetricRecord) -> Self {
        Self {
            repository: &record.repository,
            author: &record.author,
            commits: record.commits,
            observed_at: record.observed_at.format(DATETIME_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RankingRow<'a> {
    repository: &'a str,
    position: u32,
    stars: u64,
    watchers: u64,
    forks: u64,
    language: Option<&'a str>,
    html_url: Option<&'a str>,
    observed_at: String,
}

impl<'a> From<&'a RankingRecord> for RankingRow<'a> {
    fn from(record: &'a RankingRecord) -> Self {
        Self {
            repository: &record.repository,
            position: record.position,
            stars: record.stars,
            watchers: record.watchers,
            forks: record.forks,
            language: record.language.as_deref(),
            html_url: record.html_url.as_deref(),
            observed_at: record.observed_at.format(DATETIME_FORMAT).to_string(),
        }
    }
}

/// Subset of the `X-ClickHouse-Summary` response header.
#[derive(Debug, Deserialize)]
struct InsertSummary {
    written_rows: String,
}

pub struct ClickHouseStore {
    transport: Arc<dyn HttpTransport>,
    config: ClickHouseConfig,
    endpoint: Url,
}

impl std::fmt::Debug for ClickHouseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseStore")
            .field("url", &self.config.url)
            .field("database", &self.config.database)
            .field("table", &self.config.table)
            .field("rankings_table", &self.config.rankings_table)
            .finish()
    }
}

impl ClickHouseStore {
    /// Validate settings and build the store.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: ClickHouseConfig,
    ) -> Result<Self, StoreError> {
        for (what, name) in [
            ("database", &config.database),
            ("table", &config.table),
            ("rankings_table", &config.rankings_table),
        ] {
            if !is_identifier(name) {
                return Err(StoreError::InvalidConfig(format!(
                    "{what} name {name:?} is not a plain identifier"
                )));
            }
        }
        let endpoint = Url::parse(&config.url)
            .map_err(|e| StoreError::InvalidConfig(format!("url {:?}: {e}", config.url)))?;
        Ok(Self {
            transport,
            config,
            endpoint,
        })
    }

    fn query_for(&self, table: &str, columns: &[&str]) -> String {
        format!(
            "INSERT INTO {}.{} ({}) FORMAT JSONEachRow",
            self.config.database,
            table,
            columns.join(", ")
        )
    }

    fn url_for(&self, query: &str, batch_id: Uuid) -> String {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("insert_deduplication_token", &batch_id.to_string());
        url.into()
    }

    /// The INSERT statement sent with every record batch.
    #[must_use]
    pub fn insert_query(&self) -> String {
        self.query_for(&self.config.table, &COLUMNS)
    }

    /// Full request URL for a record batch.
    #[must_use]
    pub fn insert_url(&self, batch_id: Uuid) -> String {
        self.url_for(&self.insert_query(), batch_id)
    }

    /// Full request URL for a ranking snapshot.
    #[must_use]
    pub fn rankings_url(&self, batch_id: Uuid) -> String {
        self.url_for(
            &self.query_for(&self.config.rankings_table, &RANKING_COLUMNS),
            batch_id,
        )
    }

    fn body<R: Serialize>(rows: impl ExactSizeIterator<Item = R>) -> Result<Vec<u8>, StoreError> {
        let mut body = Vec::with_capacity(rows.len() * 96);
        for row in rows {
            serde_json::to_writer(&mut body, &row)?;
            body.push(b'\n');
        }
        Ok(body)
    }

    /// POST one JSONEachRow body and return the rows ClickHouse reports.
    async fn post(&self, url: String, body: Vec<u8>, attempted: usize) -> Result<u64, StoreError> {
        let mut request = HttpRequest::post(url, body)
            .with_header("Content-Type", "application/x-ndjson")
            .with_header("X-ClickHouse-User", &self.config.user);
        if let Some(password) = &self.config.password {
            request = request.with_header("X-ClickHouse-Key", password);
        }

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(StoreError::Rejected {
                status: response.status,
                message: response.body_snippet(),
            });
        }

        Ok(response
            .header("x-clickhouse-summary")
            .and_then(|v| serde_json::from_str::<InsertSummary>(v).ok())
            .and_then(|s| s.written_rows.parse::<u64>().ok())
            .unwrap_or(attempted as u64))
    }
}

#[async_trait]
impl MetricStore for ClickHouseStore {
    async fn insert_batch(
        &self,
        batch_id: Uuid,
        records: &[MetricRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let body = Self::body(records.iter().map(Row::from))?;
        let written = self
            .post(self.insert_url(batch_id), body, records.len())
            .await?;

        tracing::debug!(%batch_id, attempted = records.len(), written, "Inserted into ClickHouse");
        Ok(written)
    }

    async fn insert_rankings(
        &self,
        batch_id: Uuid,
        rankings: &[RankingRecord],
    ) -> Result<u64, StoreError> {
        if rankings.is_empty() {
            return Ok(0);
        }

        let body = Self::body(rankings.iter().map(RankingRow::from))?;
        let written = self
            .post(self.rankings_url(batch_id), body, rankings.len())
            .await?;

        tracing::debug!(%batch_id, attempted = rankings.len(), written, "Inserted rankings into ClickHouse");
        Ok(written)
    }

    fn name(&self) -> &'static str {
        "clickhouse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    use crate::http::{HttpMethod, HttpResponse, MockTransport};

    fn store(transport: &MockTransport) -> ClickHouseStore {
        ClickHouseStore::new(
            Arc::new(transport.clone()),
            ClickHouseConfig {
                password: Some("pw".into()),
                database: "metrics".into(),
                ..ClickHouseConfig::default()
            },
        )
        .unwrap()
    }

    fn record(author: &str, commits: u64) -> MetricRecord {
        MetricRecord {
            repository: "o/r".into(),
            author: author.into(),
            commits,
            observed_at: DateTime::parse_from_rfc3339("2026-10-16T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn rejects_non_identifier_names() {
        let transport = Arc::new(MockTransport::new());
        let err = ClickHouseStore::new(
            transport,
            ClickHouseConfig {
                table: "commits; DROP TABLE x".into(),
                ..ClickHouseConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn insert_query_names_columns() {
        let transport = MockTransport::new();
        assert_eq!(
            store(&transport).insert_query(),
            "INSERT INTO metrics.author_commits (repository, author, commits, observed_at) FORMAT JSONEachRow"
        );
    }

    #[tokio::test]
    async fn insert_posts_json_each_row_with_dedup_token() {
        let transport = MockTransport::new();
        let store = store(&transport);
        let batch_id = Uuid::new_v4();
        transport.push_response(
            HttpMethod::Post,
            store.insert_url(batch_id),
            HttpResponse {
                status: 200,
                headers: vec![(
                    "X-ClickHouse-Summary".into(),
                    r#"{"read_rows":"0","written_rows":"2"}"#.into(),
                )],
                body: Vec::new(),
            },
        );

        let written = store
            .insert_batch(batch_id, &[record("alice", 3), record("bob", 1)])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let request = &transport.requests()[0];
        assert!(request.url.contains(&format!("insert_deduplication_token={batch_id}")));
        assert!(request.headers.contains(&("X-ClickHouse-Key".into(), "pw".into())));
        let body = String::from_utf8(request.body.clone()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"repository":"o/r","author":"alice","commits":3,"observed_at":"2026-10-16 08:30:00"}"#
        );
    }

    #[tokio::test]
    async fn rankings_go_to_their_own_table() {
        let transport = MockTransport::new();
        let store = store(&transport);
        let batch_id = Uuid::new_v4();
        transport.push_response(
            HttpMethod::Post,
            store.rankings_url(batch_id),
            HttpResponse {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
            },
        );

        let ranking = RankingRecord {
            repository: "o/r".into(),
            position: 1,
            stars: 500,
            watchers: 500,
            forks: 20,
            language: Some("Rust".into()),
            html_url: None,
            observed_at: record("alice", 1).observed_at,
        };
        let written = store.insert_rankings(batch_id, &[ranking]).await.unwrap();
        assert_eq!(written, 1);

        let request = &transport.requests()[0];
        assert!(request.url.contains("metrics.repository_rankings"));
        assert!(request.url.contains(&format!("insert_deduplication_token={batch_id}")));
        let body = String::from_utf8(request.body.clone()).unwrap();
        assert_eq!(
            body.trim_end(),
            r#"{"repository":"o/r","position":1,"stars":500,"watchers":500,"forks":20,"language":"Rust","html_url":null,"observed_at":"2026-10-16 08:30:00"}"#
        );
    }

    #[tokio::test]
    async fn server_errors_are_retryable_rejections() {
        let transport = MockTransport::new();
        let store = store(&transport);
        let batch_id = Uuid::new_v4();
        transport.push_response(
            HttpMethod::Post,
            store.insert_url(batch_id),
            HttpResponse {
                status: 503,
                headers: Vec::new(),
                body: b"Code: 202. DB::Exception: Too many simultaneous queries".to_vec(),
            },
        );

        let err = store
            .insert_batch(batch_id, &[record("alice", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 503, .. }));
        assert!(err.is_retryable());
    }
}
