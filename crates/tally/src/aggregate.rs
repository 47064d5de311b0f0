//! Per-repository commit tallies.
//!
//! The [`Aggregator`] is the single owner of every (repository, author)
//! counter. It runs as one stage task fed by the fetchers, so counters are
//! never shared and never locked.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::fetch::{FetchEvent, Page, RepoRef};
use crate::pipeline::progress::{IngestProgress, ProgressCallback, emit};

/// One finalized (repository, author) commit count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub repository: String,
    pub author: String,
    pub commits: u64,
    pub observed_at: DateTime<Utc>,
}

/// Live counters for one repository.
#[derive(Debug, Default, Clone)]
pub struct AuthorTally {
    counts: BTreeMap<String, u64>,
    pages: u32,
    commits: u64,
    skipped: u64,
}

impl AuthorTally {
    #[must_use]
    pub fn count(&self, author: &str) -> u64 {
        self.counts.get(author).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn authors(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits
    }

    #[must_use]
    pub fn pages(&self) -> u32 {
        self.pages
    }
}

/// A repository's tally after closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedRepo {
    pub repo: RepoRef,
    pub pages: u32,
    pub commits: u64,
    pub skipped: u64,
    pub records: Vec<MetricRecord>,
}

/// Per-run tally state.
///
/// Closing a repository frees its author counts. Only its name stays in
/// `closed`, which grows to at most the run's deduplicated target list. An
/// aggregator lives for one run, so the set is dropped with it.
#[derive(Debug, Default)]
pub struct Aggregator {
    open: HashMap<RepoRef, AuthorTally>,
    closed: HashSet<RepoRef>,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every entry of `page` against its author.
    ///
    /// Pages for a repository that was already closed or discarded are
    /// ignored and reported as `false`.
    pub fn ingest(&mut self, page: Page) -> bool {
        if self.closed.contains(&page.repo) {
            tracing::warn!(repo = %page.repo, page = page.number, "Ignoring page for closed repository");
            return false;
        }

        let tally = self.open.entry(page.repo).or_default();
        tally.pages += 1;
        tally.skipped += page.skipped as u64;
        for entry in page.entries {
            *tally.counts.entry(entry.author).or_insert(0) += 1;
            tally.commits += 1;
        }
        true
    }

    /// Finalize `repo`, producing one record per author.
    ///
    /// Returns `None` if the repository was already closed or discarded.
    pub fn close(&mut self, repo: &RepoRef, observed_at: DateTime<Utc>) -> Option<ClosedRepo> {
        if !self.closed.insert(repo.clone()) {
            return None;
        }

        let tally = self.open.remove(repo).unwrap_or_default();
        let repository = repo.full_name();
        let records = tally
            .counts
            .into_iter()
            .map(|(author, commits)| MetricRecord {
                repository: repository.clone(),
                author,
                commits,
                observed_at,
            })
            .collect();

        Some(ClosedRepo {
            repo: repo.clone(),
            pages: tally.pages,
            commits: tally.commits,
            skipped: tally.skipped,
            records,
        })
    }

    /// Drop a failed repository's counters without emitting anything.
    ///
    /// Returns `true` if there was an open tally to drop.
    pub fn discard(&mut self, repo: &RepoRef) -> bool {
        self.closed.insert(repo.clone());
        self.open.remove(repo).is_some()
    }

    /// Force-close every open repository.
    pub fn drain(&mut self, observed_at: DateTime<Utc>) -> Vec<ClosedRepo> {
        let mut repos: Vec<RepoRef> = self.open.keys().cloned().collect();
        repos.sort();
        repos
            .iter()
            .filter_map(|repo| self.close(repo, observed_at))
            .collect()
    }

    #[must_use]
    pub fn tally(&self, repo: &RepoRef) -> Option<&AuthorTally> {
        self.open.get(repo)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_closed(&self, repo: &RepoRef) -> bool {
        self.closed.contains(repo)
    }
}

/// What the aggregator stage saw by the time its input closed.
#[derive(Debug, Default)]
#[must_use = "AggregateReport lists repositories that were cut short"]
pub struct AggregateReport {
    /// Repositories whose every page was consumed.
    pub completed: Vec<ClosedRepo>,
    /// Repositories discarded after a terminal failure.
    pub failed: Vec<RepoRef>,
    /// Repositories force-closed while draining. Their counts are partial.
    pub partial: Vec<ClosedRepo>,
    pub records_emitted: usize,
    pub skipped_commits: u64,
    /// Set when the record channel closed before every record was handed over.
    pub downstream_closed: bool,
}

/// Spawn the aggregator stage.
///
/// Consumes fetch events until every fetcher has dropped its sender, then
/// force-closes whatever is still open and forwards those records too.
pub fn spawn_aggregator(
    mut rx: mpsc::Receiver<FetchEvent>,
    tx: mpsc::Sender<MetricRecord>,
    observed_at: DateTime<Utc>,
    on_progress: Option<Arc<ProgressCallback>>,
) -> tokio::task::JoinHandle<AggregateReport> {
    tokio::spawn(async move {
        let mut aggregator = Aggregator::new();
        let mut report = AggregateReport::default();
        let on_progress = on_progress.as_deref();

        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Page(page) => {
                    aggregator.ingest(page);
                }
                FetchEvent::Exhausted { repo, .. } => {
                    let Some(closed) = aggregator.close(&repo, observed_at) else {
                        continue;
                    };
                    emit(
                        on_progress,
                        IngestProgress::RepoCompleted {
                            repo: repo.full_name(),
                            pages: closed.pages,
                            commits: closed.commits,
                        },
                    );
                    let delivered = forward(&tx, &closed.records, &mut report).await;
                    report.completed.push(closed);
                    if !delivered {
                        break;
                    }
                }
                FetchEvent::Failed { repo, error } => {
                    let had_tally = aggregator.discard(&repo);
                    tracing::debug!(repo = %repo, had_tally, error = %error, "Discarded tally");
                    report.failed.push(repo);
                }
            }
        }

        for closed in aggregator.drain(observed_at) {
            tracing::info!(
                repo = %closed.repo,
                pages = closed.pages,
                commits = closed.commits,
                "Force-closing partially fetched repository"
            );
            let delivered = forward(&tx, &closed.records, &mut report).await;
            report.partial.push(closed);
            if !delivered {
                break;
            }
        }

        report.skipped_commits = report
            .completed
            .iter()
            .chain(report.partial.iter())
            .map(|c| c.skipped)
            .sum();

        tracing::debug!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            partial = report.partial.len(),
            records = report.records_emitted,
            "Aggregator finished"
        );
        report
    })
}

async fn forward(
    tx: &mpsc::Sender<MetricRecord>,
    records: &[MetricRecord],
    report: &mut AggregateReport,
) -> bool {
    for record in records {
        if tx.send(record.clone()).await.is_err() {
            tracing::error!("Record channel closed, writer is gone");
            report.downstream_closed = true;
            return false;
        }
        report.records_emitted += 1;
    }
    true
}
