//! Tally CLI - crawl GitHub commit activity into a metrics store.

mod commands;
mod config;
mod progress;
mod shutdown;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::crawl::CrawlArgs;

#[derive(Parser)]
#[command(name = "tally")]
#[command(version)]
#[command(about = "Count commits per author across GitHub repositories")]
#[command(
    long_about = "Tally crawls the recent commit history of GitHub repositories under a \
shared rate limit, counts commits per author, and writes one record per \
(repository, author) to SQLite, PostgreSQL or ClickHouse."
)]
#[command(after_long_help = r#"EXAMPLES
    Count the last day of commits for two repositories:
        $ tally crawl rust-lang/rust tokio-rs/tokio

    Crawl the 50 most-starred repositories into ClickHouse:
        $ tally crawl --top 50 --store clickhouse

    See what would be written without touching a store:
        $ tally crawl --dry-run rust-lang/cargo

CONFIGURATION
    Tally reads configuration from:
      1. ~/.config/tally/config.toml (or $XDG_CONFIG_HOME/tally/config.toml)
      2. ./tally.toml
      3. Environment variables (TALLY_ prefix, e.g., TALLY_GITHUB__TOKEN)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    GITHUB_TOKEN                 GitHub token, used when none is configured
    TALLY_GITHUB__TOKEN          GitHub personal access token
    TALLY_STORE__DATABASE_URL    Database URL (default: ~/.local/state/tally/tally.db)
    TALLY_STORE__KIND            sql, clickhouse or log
    RUST_LOG                     Log filter (default: tally=info,tally_cli=info)
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl repositories and store per-author commit counts
    Crawl(CrawlArgs),
    /// Run database migrations
    #[cfg(feature = "migrate")]
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[cfg(feature = "migrate")]
#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
    /// Fresh install - drop all tables and reapply migrations
    Fresh,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("tally=info,tally_cli=info"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load configuration (config file -> env vars -> defaults)
    let config = config::Config::load();

    match cli.command {
        Commands::Crawl(args) => {
            if !commands::crawl::handle_crawl(args, config).await? {
                std::process::exit(1);
            }
        }
        #[cfg(feature = "migrate")]
        Commands::Migrate { action } => {
            let database_url = config
                .database_url()
                .ok_or("Could not determine a database URL; set store.database_url")?;
            commands::migrate::handle_migrate(action, &database_url).await?;
        }
    }

    Ok(())
}
