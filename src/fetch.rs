use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use crate::battle::RawBattle;
use crate::error::SourceError;
use crate::roster::PlayerTag;
use crate::source::BattleSource;

pub const DEFAULT_WORKERS: usize = 10;
const PROGRESS_EVERY: usize = 100;

/// Run-scoped stop flag. Workers check it between players, never mid-call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerFetchError {
    pub tag: PlayerTag,
    pub error: SourceError,
}

impl fmt::Display for PlayerFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tag, self.error)
    }
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Per-player upstream order is kept; order across players is completion order.
    pub battles: Vec<RawBattle>,
    pub processed: usize,
    pub not_found: usize,
    pub errors: Vec<PlayerFetchError>,
    pub cancelled: bool,
}

struct FetchResult {
    tag: PlayerTag,
    result: Result<Vec<RawBattle>, SourceError>,
}

/// Fans the roster out over `workers` threads and folds every result into one
/// batch. Each dispatched player yields exactly one result.
pub fn fetch_battlelogs(
    source: &dyn BattleSource,
    tags: &[PlayerTag],
    workers: usize,
    cancel: &CancelToken,
) -> FetchOutcome {
    let total = tags.len();
    if total == 0 {
        return FetchOutcome::default();
    }
    let workers = workers.clamp(1, total);

    let (job_tx, job_rx) = mpsc::sync_channel::<PlayerTag>(total);
    for tag in tags {
        // Capacity covers the whole roster and the receiver is alive here.
        if job_tx.send(tag.clone()).is_err() {
            break;
        }
    }
    drop(job_tx);
    let jobs = Mutex::new(job_rx);

    let (result_tx, result_rx) = mpsc::channel::<FetchResult>();
    let mut outcome = thread::scope(|scope| {
        for worker in 0..workers {
            let results = result_tx.clone();
            let jobs = &jobs;
            scope.spawn(move || run_worker(worker, source, jobs, results, cancel));
        }
        // The channel closes once the last worker drops its sender.
        drop(result_tx);
        aggregate(result_rx, total)
    });

    outcome.cancelled = cancel.is_cancelled() && outcome.processed < total;
    outcome
}

fn run_worker(
    worker: usize,
    source: &dyn BattleSource,
    jobs: &Mutex<mpsc::Receiver<PlayerTag>>,
    results: Sender<FetchResult>,
    cancel: &CancelToken,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(worker, "cancelled, abandoning queued players");
            return;
        }
        let next = match jobs.lock() {
            Ok(queue) => queue.recv(),
            Err(_) => return,
        };
        let Ok(tag) = next else {
            return;
        };
        let result = source.fetch_battlelog(&tag);
        if results.send(FetchResult { tag, result }).is_err() {
            return;
        }
    }
}

fn aggregate(results: Receiver<FetchResult>, total: usize) -> FetchOutcome {
    let mut outcome = FetchOutcome::default();
    for FetchResult { tag, result } in results {
        outcome.processed += 1;
        if outcome.processed % PROGRESS_EVERY == 0 {
            info!(processed = outcome.processed, total, "fetch progress");
        }

        match result {
            Ok(battles) => outcome.battles.extend(battles),
            Err(err) if err.is_not_found() => {
                debug!(tag = %tag, "no battlelog for player");
                outcome.not_found += 1;
            }
            Err(error) => {
                warn!(tag = %tag, error = %error, "battlelog fetch failed");
                outcome.errors.push(PlayerFetchError { tag, error });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Tags ending in 0 are unknown upstream, tags ending in 7 hit a server
    /// error, everything else returns three battles.
    struct StubSource {
        calls: AtomicUsize,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                cancel_after: None,
            }
        }
    }

    impl BattleSource for StubSource {
        fn fetch_battlelog(&self, tag: &str) -> Result<Vec<RawBattle>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after
                && call >= *limit
            {
                token.cancel();
            }
            let endpoint = format!("/players/{tag}/battlelog");
            if tag.ends_with('0') {
                return Err(SourceError::NotFound { endpoint });
            }
            if tag.ends_with('7') {
                return Err(SourceError::Server {
                    status: 503,
                    endpoint,
                });
            }
            Ok((0..3)
                .map(|i| RawBattle {
                    kind: "PvP".to_string(),
                    battle_time: format!("{tag}/{i}"),
                    ..RawBattle::default()
                })
                .collect())
        }
    }

    fn tags(n: usize) -> Vec<PlayerTag> {
        (0..n).map(|i| format!("#T{i}")).collect()
    }

    #[test]
    fn every_player_yields_one_result() {
        let source = StubSource::new();
        let roster = tags(250);
        let outcome = fetch_battlelogs(&source, &roster, DEFAULT_WORKERS, &CancelToken::new());

        assert_eq!(source.calls.load(Ordering::SeqCst), 250);
        assert_eq!(outcome.processed, 250);
        assert_eq!(outcome.not_found, 25);
        assert_eq!(outcome.errors.len(), 25);
        assert!(outcome.errors.iter().all(|e| e.tag.ends_with('7')));
        assert!(outcome.errors.iter().all(|e| !e.error.is_not_found()));
        assert_eq!(outcome.battles.len(), 200 * 3);
        assert!(!outcome.cancelled);
    }

    #[test]
    fn per_player_order_survives_fan_in() {
        let source = StubSource::new();
        let outcome = fetch_battlelogs(&source, &tags(40), 4, &CancelToken::new());

        let mut positions: HashMap<String, Vec<(usize, String)>> = HashMap::new();
        for (idx, battle) in outcome.battles.iter().enumerate() {
            let (tag, seq) = battle.battle_time.split_once('/').unwrap();
            positions
                .entry(tag.to_string())
                .or_default()
                .push((idx, seq.to_string()));
        }
        for rows in positions.values() {
            let seqs = rows.iter().map(|(_, s)| s.as_str()).collect::<Vec<_>>();
            assert_eq!(seqs, vec!["0", "1", "2"]);
            // One player's batch is appended as a unit.
            assert_eq!(rows[2].0 - rows[0].0, 2);
        }
    }

    #[test]
    fn cancelled_before_start_fetches_nothing() {
        let source = StubSource::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = fetch_battlelogs(&source, &tags(30), DEFAULT_WORKERS, &cancel);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.processed, 0);
        assert!(outcome.cancelled);
    }

    #[test]
    fn cancellation_stops_between_players() {
        let cancel = CancelToken::new();
        let source = StubSource {
            calls: AtomicUsize::new(0),
            cancel_after: Some((5, cancel.clone())),
        };
        let outcome = fetch_battlelogs(&source, &tags(30), 1, &cancel);
        // The in-flight call still reports; nothing after it is dispatched.
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.processed, 5);
        assert!(outcome.cancelled);
    }

    #[test]
    fn empty_roster_is_a_no_op() {
        let source = StubSource::new();
        let outcome = fetch_battlelogs(&source, &[], DEFAULT_WORKERS, &CancelToken::new());
        assert_eq!(outcome.processed, 0);
        assert!(outcome.battles.is_empty());
    }
}
