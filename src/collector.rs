use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::battle::{filter_competitive, parse_battles};
use crate::error::CollectError;
use crate::fetch::{CancelToken, DEFAULT_WORKERS, PlayerFetchError, fetch_battlelogs};
use crate::roster::RosterSource;
use crate::source::BattleSource;
use crate::store::{BattleStore, MetaDeckStore};

pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Stages of a run, in the only order they happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Start,
    RosterLoaded,
    Fetched,
    Filtered,
    Parsed,
    Stored,
    Recalculated,
    Purged,
    Completed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStage::Start => "start",
            RunStage::RosterLoaded => "roster_loaded",
            RunStage::Fetched => "fetched",
            RunStage::Filtered => "filtered",
            RunStage::Parsed => "parsed",
            RunStage::Stored => "stored",
            RunStage::Recalculated => "recalculated",
            RunStage::Purged => "purged",
            RunStage::Completed => "completed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct CollectionRunResult {
    pub players_processed: usize,
    /// Players the API had nothing for. Not errors.
    pub players_not_found: usize,
    pub battles_collected: usize,
    pub battles_filtered: usize,
    pub battles_stored: usize,
    /// Rows that were new to storage; the rest were already known.
    pub battles_inserted: usize,
    pub parse_failures: usize,
    /// `None` when the retention sweep failed.
    pub battles_purged: Option<usize>,
    pub errors: Vec<PlayerFetchError>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

pub struct Collector {
    roster: Box<dyn RosterSource>,
    source: Arc<dyn BattleSource>,
    battles: Arc<dyn BattleStore>,
    meta: Arc<dyn MetaDeckStore>,
    workers: usize,
    retention_days: u32,
}

impl Collector {
    pub fn new(
        roster: Box<dyn RosterSource>,
        source: Arc<dyn BattleSource>,
        battles: Arc<dyn BattleStore>,
        meta: Arc<dyn MetaDeckStore>,
    ) -> Self {
        Self {
            roster,
            source,
            battles,
            meta,
            workers: DEFAULT_WORKERS,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// One full run. Only roster and structural storage failures abort it;
    /// per-player fetch errors land in the result.
    pub fn collect(&self, cancel: &CancelToken) -> Result<CollectionRunResult, CollectError> {
        let started_at = Utc::now();
        info!(stage = %RunStage::Start, "starting collection run");

        let tags = self.roster.player_tags().map_err(CollectError::Roster)?;
        info!(stage = %RunStage::RosterLoaded, players = tags.len(), "loaded roster");

        let fetched = fetch_battlelogs(self.source.as_ref(), &tags, self.workers, cancel);
        let battles_collected = fetched.battles.len();
        info!(
            stage = %RunStage::Fetched,
            battles = battles_collected,
            players = fetched.processed,
            not_found = fetched.not_found,
            errors = fetched.errors.len(),
            "collected raw battles"
        );
        if fetched.cancelled {
            warn!(
                processed = fetched.processed,
                total = tags.len(),
                "run cancelled, continuing with partial fetch"
            );
        }

        let filtered = filter_competitive(fetched.battles);
        let battles_filtered = filtered.len();
        info!(stage = %RunStage::Filtered, battles = battles_filtered, "kept ladder and ranked battles");

        let parsed = parse_battles(&filtered);
        info!(
            stage = %RunStage::Parsed,
            battles = parsed.battles.len(),
            skipped = parsed.skipped,
            failed = parsed.failed,
            "parsed battles"
        );

        let inserted = self
            .battles
            .bulk_insert(&parsed.battles)
            .map_err(|source| CollectError::Store {
                operation: "insert battles",
                source,
            })?;
        let battles_stored = parsed.battles.len();
        info!(stage = %RunStage::Stored, stored = battles_stored, new_rows = inserted, "stored battles");

        self.meta.recompute().map_err(|source| CollectError::Store {
            operation: "recalculate meta stats",
            source,
        })?;
        info!(stage = %RunStage::Recalculated, "recalculated meta deck statistics");

        let battles_purged = match self.battles.purge_older_than(self.retention_days) {
            Ok(deleted) => {
                info!(
                    stage = %RunStage::Purged,
                    deleted,
                    retention_days = self.retention_days,
                    "purged old battles"
                );
                Some(deleted)
            }
            Err(err) => {
                warn!(error = %err, "failed to purge old battles");
                None
            }
        };

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).to_std().unwrap_or_default();
        info!(stage = %RunStage::Completed, elapsed_ms = duration.as_millis() as u64, "collection completed");

        Ok(CollectionRunResult {
            players_processed: fetched.processed,
            players_not_found: fetched.not_found,
            battles_collected,
            battles_filtered,
            battles_stored,
            battles_inserted: inserted,
            parse_failures: parsed.failed,
            battles_purged,
            errors: fetched.errors,
            cancelled: fetched.cancelled,
            started_at,
            completed_at,
            duration,
        })
    }
}
