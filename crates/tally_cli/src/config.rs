//! Configuration file support for tally.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `TALLY_`, sections separated by
//!    `__`, e.g. `TALLY_GITHUB__TOKEN` or `TALLY_BATCH__MAX_RECORDS`)
//! 3. Config file (./tally.toml, then ~/.config/tally/config.toml)
//! 4. `GITHUB_TOKEN` for the GitHub token
//! 5. Built-in defaults
//!
//! Example config file:
//! ```toml
//! [github]
//! token = "ghp_..."
//! max_concurrent_requests = 5
//! requests_per_second = 10
//! lookback_hours = 24
//!
//! [batch]
//! max_records = 500
//! max_age_ms = 500
//! on_fatal = "requeue"  # or "drop"
//! final_flush_timeout_secs = 120
//!
//! [store]
//! kind = "sql"  # "sql", "clickhouse" or "log"
//! database_url = "sqlite://~/.local/state/tally/tally.db?mode=rwc"
//!
//! [clickhouse]
//! url = "http://localhost:8123"
//! database = "default"
//! table = "author_commits"
//! rankings_table = "repository_rankings"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use tally::fetch::github::{DEFAULT_API_URL, MAX_PAGE_SIZE};
use tally::fetch::retry::{INITIAL_BACKOFF_MS, MAX_ATTEMPTS, MAX_BACKOFF_MS};
use tally::fetch::{GitHubConfig as ClientConfig, RetryConfig};
use tally::pipeline::{PAGE_CHANNEL_BUFFER_SIZE, RECORD_CHANNEL_BUFFER_SIZE};
use tally::rate::defaults;
use tally::store::ClickHouseConfig;
use tally::writer::{
    DEFAULT_BACKOFF, DEFAULT_FINAL_FLUSH_TIMEOUT, DEFAULT_MAX_AGE, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_RECORDS,
};
use tally::{FatalPolicy, GovernorConfig, PipelineOptions, WriterConfig};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: GitHubConfig,
    pub batch: BatchConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    pub clickhouse: ClickHouseConfig,
}

/// GitHub client and rate governor settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// Personal access token. Falls back to `GITHUB_TOKEN`.
    pub token: Option<String>,
    pub api_url: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub requests_per_second: u32,
    pub page_size: u32,
    pub lookback_hours: u64,
    /// Attempts per page, including the first.
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
            max_concurrent_requests: defaults::MAX_CONCURRENT_REQUESTS,
            requests_per_second: defaults::REQUESTS_PER_SECOND,
            page_size: MAX_PAGE_SIZE,
            lookback_hours: 24,
            max_attempts: MAX_ATTEMPTS,
            min_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

/// Batch writer settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_records: usize,
    pub max_age_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub on_fatal: FatalPolicy,
    /// Raised to the store's worst-case retry time if set lower.
    pub final_flush_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_age_ms: DEFAULT_MAX_AGE.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF.as_millis() as u64,
            on_fatal: FatalPolicy::default(),
            final_flush_timeout_secs: DEFAULT_FINAL_FLUSH_TIMEOUT.as_secs(),
        }
    }
}

/// Channel capacities between stages.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub page_queue: usize,
    pub record_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_queue: PAGE_CHANNEL_BUFFER_SIZE,
            record_queue: RECORD_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// Where records go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// SQLite or PostgreSQL through SeaORM.
    #[default]
    Sql,
    /// ClickHouse over HTTP.
    Clickhouse,
    /// Log records instead of writing them.
    Log,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Defaults to `sqlite://<state dir>/tally.db?mode=rwc`.
    pub database_url: Option<String>,
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults, with `GITHUB_TOKEN` as the default token
    /// 2. XDG config file (~/.config/tally/config.toml)
    /// 3. Local config file (./tally.toml)
    /// 4. Environment variables with TALLY_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Ok(token) = std::env::var("GITHUB_TOKEN")
            && !token.trim().is_empty()
        {
            match builder.set_default("github.token", token) {
                Ok(b) => builder = b,
                Err(e) => {
                    tracing::warn!("Ignoring GITHUB_TOKEN: {}", e);
                    builder = ConfigBuilder::builder();
                }
            }
        }

        if let Some(xdg_config) = Self::default_config_path()
            && xdg_config.exists()
        {
            tracing::debug!("Loading config from {:?}", xdg_config);
            builder = builder.add_source(
                File::from(xdg_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let local_config = PathBuf::from("tally.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./tally.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // TALLY_BATCH__MAX_RECORDS -> batch.max_records
        builder = builder.add_source(
            Environment::with_prefix("TALLY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// The configured database URL, or a SQLite file in the state directory.
    pub fn database_url(&self) -> Option<String> {
        self.store.database_url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("tally.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.github.timeout_secs.max(1))
    }

    pub fn client_config(&self) -> ClientConfig {
        let github = &self.github;
        ClientConfig {
            api_url: github.api_url.clone(),
            token: github.token.clone().filter(|t| !t.trim().is_empty()),
            page_size: github.page_size,
            lookback: Duration::from_secs(github.lookback_hours.saturating_mul(3600)),
            retry: RetryConfig::new(
                Duration::from_millis(github.min_backoff_ms),
                Duration::from_millis(github.max_backoff_ms),
                github.max_attempts,
            ),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        let mut writer = WriterConfig {
            max_records: self.batch.max_records,
            max_age: Duration::from_millis(self.batch.max_age_ms),
            max_attempts: self.batch.max_attempts,
            backoff: Duration::from_millis(self.batch.backoff_ms),
            on_fatal: self.batch.on_fatal,
            final_flush_timeout: Duration::from_secs(self.batch.final_flush_timeout_secs),
        };
        writer.final_flush_timeout = writer
            .final_flush_timeout
            .max(writer.retry_budget(self.request_timeout()));

        PipelineOptions {
            governor: GovernorConfig::new(
                self.github.max_concurrent_requests,
                self.github.requests_per_second,
            ),
            writer,
            page_queue: self.pipeline.page_queue,
            record_queue: self.pipeline.record_queue,
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "tally").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// On Linux, this is `$XDG_STATE_HOME/tally` or `~/.local/state/tally`.
    /// Elsewhere it falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "tally").map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}
