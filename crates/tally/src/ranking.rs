//! Top-by-stars ranking snapshots.
//!
//! A `--top N` run records where each repository stood when the run began,
//! next to the author counts observed at the same instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fetch::RankedRepository;

/// One repository's place in the ranking at `observed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingRecord {
    pub repository: String,
    pub position: u32,
    pub stars: u64,
    pub watchers: u64,
    pub forks: u64,
    pub language: Option<String>,
    pub html_url: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl RankingRecord {
    #[must_use]
    pub fn new(ranked: &RankedRepository, observed_at: DateTime<Utc>) -> Self {
        Self {
            repository: ranked.repo.full_name(),
            position: ranked.position,
            stars: ranked.stars,
            watchers: ranked.watchers,
            forks: ranked.forks,
            language: ranked.language.clone(),
            html_url: ranked.html_url.clone(),
            observed_at,
        }
    }
}

/// Stamp a discovered ranking with the run's observation time.
#[must_use]
pub fn snapshot(ranked: &[RankedRepository], observed_at: DateTime<Utc>) -> Vec<RankingRecord> {
    ranked
        .iter()
        .map(|entry| RankingRecord::new(entry, observed_at))
        .collect()
}
