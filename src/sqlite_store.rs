use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::collector::CollectionRunResult;
use crate::deck::{CanonicalBattle, Deck, DeckSignature, MetaDeck, MetaSort};
use crate::error::{CollectError, StoreError, StoreErrorSource};
use crate::store::{BattleStore, MetaDeckStore};

const INSERT_BATCH_SIZE: usize = 100;

const INSERT_BATTLE_SQL: &str = r#"
    INSERT OR IGNORE INTO battles (
        battle_time, player_tag, opponent_tag, game_mode,
        player_crowns, opponent_crowns, deck_signature,
        deck_cards, is_victory, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
"#;

const RECOMPUTE_META_SQL: &str = r#"
    INSERT INTO meta_decks (
        deck_signature, cards, total_games, wins, losses,
        win_rate, first_seen, last_seen, updated_at
    )
    SELECT
        b.deck_signature,
        (
            SELECT latest.deck_cards
            FROM battles latest
            WHERE latest.deck_signature = b.deck_signature
            ORDER BY latest.battle_time DESC, latest.id DESC
            LIMIT 1
        ),
        COUNT(*),
        SUM(CASE WHEN b.is_victory = 1 THEN 1 ELSE 0 END),
        SUM(CASE WHEN b.is_victory = 0 THEN 1 ELSE 0 END),
        ROUND(SUM(CASE WHEN b.is_victory = 1 THEN 1 ELSE 0 END) * 100.0 / COUNT(*), 2),
        MIN(b.battle_time),
        MAX(b.battle_time),
        ?1
    FROM battles b
    GROUP BY b.deck_signature
"#;

const META_COLUMNS: &str = "deck_signature, cards, total_games, wins, losses, \
     win_rate, first_seen, last_seen, updated_at";

/// SQLite-backed battle and meta deck storage.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// One row of `collection_runs`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub players_processed: usize,
    pub battles_collected: usize,
    pub battles_stored: usize,
    pub errors: Vec<String>,
    pub status: &'static str,
    pub error_message: Option<String>,
}

impl RunRecord {
    pub fn completed(result: &CollectionRunResult) -> Self {
        Self {
            started_at: result.started_at,
            completed_at: result.completed_at,
            players_processed: result.players_processed,
            battles_collected: result.battles_collected,
            battles_stored: result.battles_stored,
            errors: result.errors.iter().map(|e| e.to_string()).collect(),
            status: "completed",
            error_message: None,
        }
    }

    pub fn failed(started_at: DateTime<Utc>, err: &CollectError) -> Self {
        Self {
            started_at,
            completed_at: Utc::now(),
            players_processed: 0,
            battles_collected: 0,
            battles_stored: 0,
            errors: Vec::new(),
            status: "failed",
            error_message: Some(err.to_string()),
        }
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn =
            Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self, table: &'static str) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| {
            StoreError::new(
                "lock",
                table,
                StoreErrorSource::Other("connection lock poisoned".to_string()),
            )
        })
    }

    pub fn battle_count(&self) -> Result<usize, StoreError> {
        self.count("battles")
    }

    pub fn meta_deck_count(&self) -> Result<usize, StoreError> {
        self.count("meta_decks")
    }

    fn count(&self, table: &'static str) -> Result<usize, StoreError> {
        let conn = self.conn(table)?;
        let sql = match table {
            "meta_decks" => "SELECT COUNT(*) FROM meta_decks",
            _ => "SELECT COUNT(*) FROM battles",
        };
        let count = conn
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .map_err(|e| StoreError::new("count", table, e))?;
        Ok(count.max(0) as usize)
    }

    /// Leaderboard of meta decks with at least `min_games` games.
    pub fn top_decks(
        &self,
        limit: usize,
        sort: MetaSort,
        min_games: u32,
    ) -> Result<Vec<MetaDeck>, StoreError> {
        let order = match sort {
            MetaSort::WinRate => "win_rate DESC, total_games DESC",
            MetaSort::Frequency => "total_games DESC, win_rate DESC",
        };
        let sql = format!(
            "SELECT {META_COLUMNS} FROM meta_decks WHERE total_games >= ?1 \
             ORDER BY {order}, deck_signature ASC LIMIT ?2"
        );
        let conn = self.conn("meta_decks")?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::new("query_top", "meta_decks", e))?;
        let rows = stmt
            .query_map(params![i64::from(min_games), limit as i64], meta_deck_from_row)
            .map_err(|e| StoreError::new("query_top", "meta_decks", e))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::new("scan_row", "meta_decks", e))?);
        }
        Ok(out)
    }

    pub fn deck_by_signature(
        &self,
        signature: &DeckSignature,
    ) -> Result<Option<MetaDeck>, StoreError> {
        let conn = self.conn("meta_decks")?;
        conn.query_row(
            &format!("SELECT {META_COLUMNS} FROM meta_decks WHERE deck_signature = ?1"),
            params![signature.as_str()],
            meta_deck_from_row,
        )
        .optional()
        .map_err(|e| StoreError::new("query_by_signature", "meta_decks", e))
    }

    /// Most recent battles played with a deck, newest first.
    pub fn recent_battles(
        &self,
        signature: &DeckSignature,
        limit: usize,
    ) -> Result<Vec<CanonicalBattle>, StoreError> {
        let conn = self.conn("battles")?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT battle_time, player_tag, opponent_tag, game_mode,
                       player_crowns, opponent_crowns, deck_signature,
                       deck_cards, is_victory
                FROM battles
                WHERE deck_signature = ?1
                ORDER BY battle_time DESC
                LIMIT ?2
                "#,
            )
            .map_err(|e| StoreError::new("query_recent", "battles", e))?;
        let rows = stmt
            .query_map(params![signature.as_str(), limit as i64], battle_from_row)
            .map_err(|e| StoreError::new("query_recent", "battles", e))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::new("scan_row", "battles", e))?);
        }
        Ok(out)
    }

    pub fn record_run(&self, run: &RunRecord) -> Result<i64, StoreError> {
        let errors_json = serde_json::to_string(&run.errors)
            .map_err(|e| StoreError::new("marshal_errors", "collection_runs", e))?;
        let conn = self.conn("collection_runs")?;
        conn.execute(
            "INSERT INTO collection_runs(
                started_at, completed_at, players_processed, battles_collected,
                battles_stored, errors, errors_json, status, error_message
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                format_time(&run.started_at),
                format_time(&run.completed_at),
                run.players_processed as i64,
                run.battles_collected as i64,
                run.battles_stored as i64,
                run.errors.len() as i64,
                errors_json,
                run.status,
                run.error_message,
            ],
        )
        .map_err(|e| StoreError::new("insert", "collection_runs", e))?;
        Ok(conn.last_insert_rowid())
    }
}

impl BattleStore for SqliteStore {
    fn bulk_insert(&self, battles: &[CanonicalBattle]) -> Result<usize, StoreError> {
        if battles.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn("battles")?;
        let created_at = format_time(&Utc::now());
        let mut inserted = 0usize;

        for chunk in battles.chunks(INSERT_BATCH_SIZE) {
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::new("begin_transaction", "battles", e))?;
            {
                let mut stmt = tx
                    .prepare_cached(INSERT_BATTLE_SQL)
                    .map_err(|e| StoreError::new("prepare_statement", "battles", e))?;
                for battle in chunk {
                    let cards = serde_json::to_string(&battle.deck_cards)
                        .map_err(|e| StoreError::new("marshal_cards", "battles", e))?;
                    inserted += stmt
                        .execute(params![
                            format_time(&battle.battle_time),
                            battle.player_tag,
                            battle.opponent_tag,
                            battle.game_mode,
                            battle.player_crowns,
                            battle.opponent_crowns,
                            battle.deck_signature.as_str(),
                            cards,
                            bool_to_i64(battle.is_victory),
                            created_at,
                        ])
                        .map_err(|e| StoreError::new("exec_insert", "battles", e))?;
                }
            }
            tx.commit()
                .map_err(|e| StoreError::new("commit_batch", "battles", e))?;
        }
        Ok(inserted)
    }

    fn purge_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let conn = self.conn("battles")?;
        conn.execute(
            "DELETE FROM battles WHERE battle_time < ?1",
            params![format_time(&cutoff)],
        )
        .map_err(|e| StoreError::new("delete_old", "battles", e))
    }
}

impl MetaDeckStore for SqliteStore {
    fn recompute(&self) -> Result<(), StoreError> {
        let mut conn = self.conn("meta_decks")?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::new("begin_transaction", "meta_decks", e))?;
        tx.execute("DELETE FROM meta_decks", [])
            .map_err(|e| StoreError::new("delete_all", "meta_decks", e))?;
        tx.execute(RECOMPUTE_META_SQL, params![format_time(&Utc::now())])
            .map_err(|e| StoreError::new("recalculate", "meta_decks", e))?;
        tx.commit()
            .map_err(|e| StoreError::new("commit", "meta_decks", e))
    }
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS battles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            battle_time TEXT NOT NULL,
            player_tag TEXT NOT NULL,
            opponent_tag TEXT NOT NULL,
            game_mode TEXT NOT NULL,
            player_crowns INTEGER NOT NULL,
            opponent_crowns INTEGER NOT NULL,
            deck_signature TEXT NOT NULL,
            deck_cards TEXT NOT NULL,
            is_victory INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (player_tag, battle_time)
        );
        CREATE INDEX IF NOT EXISTS idx_battles_signature ON battles(deck_signature);
        CREATE INDEX IF NOT EXISTS idx_battles_time ON battles(battle_time);

        CREATE TABLE IF NOT EXISTS meta_decks (
            deck_signature TEXT PRIMARY KEY,
            cards TEXT NOT NULL,
            total_games INTEGER NOT NULL,
            wins INTEGER NOT NULL,
            losses INTEGER NOT NULL,
            win_rate REAL NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_meta_decks_win_rate ON meta_decks(win_rate);
        CREATE INDEX IF NOT EXISTS idx_meta_decks_games ON meta_decks(total_games);

        CREATE TABLE IF NOT EXISTS collection_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            completed_at TEXT NULL,
            players_processed INTEGER NOT NULL,
            battles_collected INTEGER NOT NULL,
            battles_stored INTEGER NOT NULL,
            errors INTEGER NOT NULL,
            errors_json TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT NULL
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

/// Fixed-width RFC 3339 so text comparison orders by time.
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn time_from_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw = row.get::<_, String>(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn deck_from_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Deck> {
    let raw = row.get::<_, String>(idx)?;
    serde_json::from_str::<Deck>(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn meta_deck_from_row(row: &Row<'_>) -> rusqlite::Result<MetaDeck> {
    Ok(MetaDeck {
        signature: DeckSignature::from_stored(row.get(0)?),
        cards: deck_from_column(row, 1)?,
        total_games: row.get::<_, u32>(2)?,
        wins: row.get::<_, u32>(3)?,
        losses: row.get::<_, u32>(4)?,
        win_rate: row.get(5)?,
        first_seen: time_from_column(row, 6)?,
        last_seen: time_from_column(row, 7)?,
        updated_at: time_from_column(row, 8)?,
    })
}

fn battle_from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalBattle> {
    Ok(CanonicalBattle {
        battle_time: time_from_column(row, 0)?,
        player_tag: row.get(1)?,
        opponent_tag: row.get(2)?,
        game_mode: row.get(3)?,
        player_crowns: row.get(4)?,
        opponent_crowns: row.get(5)?,
        deck_signature: DeckSignature::from_stored(row.get(6)?),
        deck_cards: deck_from_column(row, 7)?,
        is_victory: row.get::<_, i64>(8)? != 0,
    })
}

fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::deck::Card;

    fn deck(ids: [u32; 8]) -> Deck {
        ids.map(|id| Card {
            id: id.to_string(),
            name: format!("card {id}"),
            level: 14,
        })
    }

    fn battle(player: &str, time: DateTime<Utc>, ids: [u32; 8], crowns: (i32, i32)) -> CanonicalBattle {
        let cards = deck(ids);
        CanonicalBattle {
            battle_time: time,
            player_tag: player.to_string(),
            opponent_tag: "#OPP".to_string(),
            game_mode: "Ladder".to_string(),
            player_crowns: crowns.0,
            opponent_crowns: crowns.1,
            deck_signature: DeckSignature::from_cards(&cards),
            deck_cards: cards,
            is_victory: crowns.0 > crowns.1,
        }
    }

    const HOG: [u32; 8] = [26000021, 26000010, 26000030, 26000038, 28000000, 28000011, 26000014, 27000006];
    const GIANT: [u32; 8] = [26000003, 26000000, 26000010, 26000001, 26000042, 26000027, 28000000, 26000014];

    #[test]
    fn format_time_orders_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 10, 9, 5, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 10, 20, 15, 30).unwrap();
        assert_eq!(format_time(&late), "2024-01-10T20:15:30.000Z");
        assert!(format_time(&early) < format_time(&late));
    }

    #[test]
    fn insert_ignores_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let first = battle("#A", now, HOG, (3, 0));
        assert_eq!(store.bulk_insert(&[first.clone()]).unwrap(), 1);
        // Same player and time: ignored, even with different contents.
        let mut replay = first.clone();
        replay.player_crowns = 0;
        assert_eq!(store.bulk_insert(&[replay, first]).unwrap(), 0);
        assert_eq!(store.battle_count().unwrap(), 1);
    }

    #[test]
    fn insert_spans_multiple_batches() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = Utc::now();
        let battles = (0..250)
            .map(|i| battle("#A", base - ChronoDuration::seconds(i), GIANT, (1, 0)))
            .collect::<Vec<_>>();
        assert_eq!(store.bulk_insert(&battles).unwrap(), 250);
        assert_eq!(store.battle_count().unwrap(), 250);
    }

    #[test]
    fn recompute_aggregates_per_signature() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let battles = vec![
            battle("#A", now - ChronoDuration::hours(3), HOG, (3, 0)),
            battle("#B", now - ChronoDuration::hours(2), HOG, (1, 1)),
            battle("#C", now - ChronoDuration::hours(1), HOG, (2, 1)),
            battle("#A", now - ChronoDuration::hours(1), GIANT, (0, 1)),
        ];
        store.bulk_insert(&battles).unwrap();
        store.recompute().unwrap();

        assert_eq!(store.meta_deck_count().unwrap(), 2);
        let hog = store
            .deck_by_signature(&battles[0].deck_signature)
            .unwrap()
            .unwrap();
        assert_eq!(hog.total_games, 3);
        assert_eq!(hog.wins, 2);
        assert_eq!(hog.losses, 1);
        assert!((hog.win_rate - 66.67).abs() < 1e-9);
        assert_eq!(format_time(&hog.first_seen), format_time(&battles[0].battle_time));
        assert_eq!(format_time(&hog.last_seen), format_time(&battles[2].battle_time));
        assert_eq!(hog.cards, battles[2].deck_cards);

        let by_rate = store.top_decks(10, MetaSort::WinRate, 1).unwrap();
        assert_eq!(by_rate[0].signature, battles[0].deck_signature);
        let min_three = store.top_decks(10, MetaSort::Frequency, 3).unwrap();
        assert_eq!(min_three.len(), 1);

        store.recompute().unwrap();
        assert_eq!(store.meta_deck_count().unwrap(), 2);
    }

    #[test]
    fn recompute_after_purge_drops_vanished_decks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let stale = battle("#A", now - ChronoDuration::days(30), GIANT, (2, 0));
        let fresh = battle("#B", now - ChronoDuration::hours(1), HOG, (1, 0));
        store.bulk_insert(&[stale.clone(), fresh.clone()]).unwrap();
        store.recompute().unwrap();
        assert_eq!(store.meta_deck_count().unwrap(), 2);
        assert!(store.deck_by_signature(&stale.deck_signature).unwrap().is_some());

        assert_eq!(store.purge_older_than(7).unwrap(), 1);
        store.recompute().unwrap();
        assert_eq!(store.meta_deck_count().unwrap(), 1);
        assert!(store.deck_by_signature(&stale.deck_signature).unwrap().is_none());
        let kept = store.deck_by_signature(&fresh.deck_signature).unwrap().unwrap();
        assert_eq!(kept.total_games, 1);
    }

    #[test]
    fn purge_removes_only_stale_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .bulk_insert(&[
                battle("#A", now - ChronoDuration::days(10), HOG, (1, 0)),
                battle("#A", now - ChronoDuration::days(8), HOG, (1, 0)),
                battle("#A", now - ChronoDuration::days(1), HOG, (1, 0)),
            ])
            .unwrap();
        assert_eq!(store.purge_older_than(7).unwrap(), 2);
        assert_eq!(store.battle_count().unwrap(), 1);
    }

    #[test]
    fn recent_battles_round_trip_cards() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let older = battle("#A", now - ChronoDuration::minutes(30), GIANT, (1, 2));
        let newer = battle("#B", now, GIANT, (2, 1));
        store.bulk_insert(&[older.clone(), newer.clone()]).unwrap();

        let recent = store.recent_battles(&newer.deck_signature, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].player_tag, "#B");
        assert_eq!(recent[0].deck_cards, newer.deck_cards);
        assert!(recent[0].is_victory);
    }

    #[test]
    fn records_run_history() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = RunRecord {
            started_at: Utc::now(),
            completed_at: Utc::now(),
            players_processed: 12,
            battles_collected: 300,
            battles_stored: 120,
            errors: vec!["#X: boom".to_string()],
            status: "completed",
            error_message: None,
        };
        let first = store.record_run(&run).unwrap();
        let second = store.record_run(&run).unwrap();
        assert!(second > first);
    }
}
