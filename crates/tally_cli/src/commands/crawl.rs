use std::sync::Arc;

use console::{Term, style};
use tally::http::{HttpTransport, ReqwestTransport};
use tally::store::{ClickHouseStore, LoggingStore, SqlStore};
use tally::{MetricStore, Pipeline, RepoRef, RunSummary};

use crate::config::{Config, StoreKind};
use crate::progress::LoggingReporter;
use crate::shutdown;

/// Options for a crawl run. Flags override the config file.
#[derive(Debug, Clone, clap::Args)]
pub(crate) struct CrawlArgs {
    /// Repositories as owner/name
    repos: Vec<String>,

    /// Crawl the N most-starred repositories instead of an explicit list
    #[arg(short = 't', long, conflicts_with = "repos")]
    top: Option<usize>,

    /// Count commits from the last H hours (default from config or 24)
    #[arg(short = 'l', long)]
    lookback_hours: Option<u64>,

    /// Maximum concurrent API requests (default from config or 5)
    #[arg(short = 'c', long)]
    max_concurrent: Option<usize>,

    /// Maximum API requests per second (default from config or 10)
    #[arg(short = 'r', long)]
    rps: Option<u32>,

    /// Records per store insert (default from config or 500)
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// Where to write records (default from config or sql)
    #[arg(short = 's', long, value_enum)]
    store: Option<StoreKind>,

    /// Crawl and aggregate, but log records instead of storing them
    #[arg(short = 'n', long)]
    dry_run: bool,
}

impl CrawlArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(hours) = self.lookback_hours {
            config.github.lookback_hours = hours;
        }
        if let Some(n) = self.max_concurrent {
            config.github.max_concurrent_requests = n;
        }
        if let Some(rps) = self.rps {
            config.github.requests_per_second = rps;
        }
        if let Some(size) = self.batch_size {
            config.batch.max_records = size;
        }
        if let Some(kind) = self.store {
            config.store.kind = kind;
        }
        if self.dry_run {
            config.store.kind = StoreKind::Log;
        }
    }

    fn targets(&self) -> Result<Vec<RepoRef>, tally::FetchError> {
        self.repos.iter().map(|r| r.parse()).collect()
    }
}

async fn build_store(
    config: &Config,
    transport: Arc<dyn HttpTransport>,
) -> Result<Arc<dyn MetricStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn MetricStore> = match config.store.kind {
        StoreKind::Log => Arc::new(LoggingStore::new()),
        StoreKind::Clickhouse => {
            Arc::new(ClickHouseStore::new(transport, config.clickhouse.clone())?)
        }
        StoreKind::Sql => {
            let database_url = config
                .database_url()
                .ok_or("Could not determine a database URL; set store.database_url")?;
            super::ensure_sqlite_dir(&database_url)?;

            #[cfg(feature = "migrate")]
            let db = tally::connect_and_migrate(&database_url).await?;
            #[cfg(not(feature = "migrate"))]
            let db = tally::connect(&database_url).await?;

            Arc::new(SqlStore::new(db))
        }
    };
    tracing::debug!(store = store.name(), "Store ready");
    Ok(store)
}

/// Run a crawl. Returns `false` when records or the ranking snapshot were
/// left undelivered.
pub(crate) async fn handle_crawl(
    args: CrawlArgs,
    mut config: Config,
) -> Result<bool, Box<dyn std::error::Error>> {
    args.apply(&mut config);
    let mut targets = args.targets()?;
    if targets.is_empty() && args.top.is_none() {
        return Err("No repositories given; pass owner/name arguments or --top N".into());
    }
    if config.github.token.is_none() {
        tracing::warn!("No GitHub token configured, unauthenticated rate limits apply");
    }

    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::with_timeout(config.request_timeout())?);
    let store = build_store(&config, Arc::clone(&transport)).await?;

    let reporter = Arc::new(LoggingReporter::new());
    let pipeline = Pipeline::new(
        transport,
        config.client_config(),
        store,
        config.pipeline_options(),
    )?
    .with_progress(reporter.as_callback());
    shutdown::setup_shutdown_handler(pipeline.stop_handle());

    let mut ranking_delivered = true;
    if let Some(limit) = args.top {
        let ranked = pipeline.discover_top(limit).await?;
        ranking_delivered = pipeline.record_rankings(&ranked).await.is_ok();
        targets = ranked.into_iter().map(|entry| entry.repo).collect();
    }

    let summary = pipeline.run(targets).await;
    let delivered =
        ranking_delivered && summary.fatal.is_none() && summary.undelivered.is_empty();
    if !ranking_delivered {
        tracing::error!("Ranking snapshot was not stored");
    }
    if Term::stdout().is_term() {
        print_summary(&summary);
    } else {
        log_summary(&summary);
    }
    Ok(delivered)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{} {} repositories, {} records written in {:.1}s",
        style("Done:").bold(),
        summary.succeeded.len(),
        summary.records_written,
        summary.elapsed.as_secs_f64()
    );

    for repo in &summary.succeeded {
        println!(
            "  {} {} ({} commits, {} authors)",
            style("✓").green(),
            repo.repo,
            repo.commits,
            repo.authors
        );
    }
    for failed in &summary.failed {
        println!("  {} {}: {}", style("✗").red(), failed.repo, failed.reason);
    }
    for repo in &summary.partial {
        println!("  {} {} (partial)", style("…").yellow(), repo);
    }

    if summary.skipped_commits > 0 {
        println!(
            "{} {} commits had no author identity",
            style("Note:").dim(),
            summary.skipped_commits
        );
    }
    if let Some(reason) = &summary.drain_reason {
        println!("{} {}", style("Stopped:").dim(), reason);
    }
    if summary.undelivered_records() > 0 {
        println!(
            "{} {} records in {} batches were not delivered",
            style("Error:").red().bold(),
            summary.undelivered_records(),
            summary.undelivered.len()
        );
    }
}

fn log_summary(summary: &RunSummary) {
    for failed in &summary.failed {
        tracing::warn!(repo = %failed.repo, reason = %failed.reason, "Repository failed");
    }
    for repo in &summary.partial {
        tracing::warn!(repo = %repo, "Repository only partially counted");
    }
    for batch in &summary.undelivered {
        tracing::error!(
            batch_id = %batch.batch_id,
            records = batch.records.len(),
            attempts = batch.attempts,
            error = %batch.error,
            "Batch undelivered"
        );
    }
    tracing::info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        partial = summary.partial.len(),
        records_written = summary.records_written,
        batches_written = summary.batches_written,
        skipped_commits = summary.skipped_commits,
        reason = ?summary.drain_reason.as_ref().map(ToString::to_string),
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "Crawl finished"
    );
}
