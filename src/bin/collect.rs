use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use royale_meta::collector::Collector;
use royale_meta::config::{Config, RosterConfig};
use royale_meta::fetch::CancelToken;
use royale_meta::roster::{RankingRoster, RosterSource, StaticRoster};
use royale_meta::source::SourceClient;
use royale_meta::sqlite_store::{RunRecord, SqliteStore};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let db_path = parse_db_path_arg()
        .or_else(|| config.resolved_db_path())
        .context("unable to resolve sqlite path")?;
    let store = Arc::new(SqliteStore::open(&db_path)?);

    let roster: Box<dyn RosterSource> = match &config.roster {
        RosterConfig::Static(tags) => Box::new(StaticRoster::new(tags.clone())),
        RosterConfig::Rankings { location, limit } => Box::new(RankingRoster::new(
            SourceClient::new(&config.api_key, &config.base_url)?,
            location,
            *limit,
        )),
    };
    let source = Arc::new(SourceClient::new(&config.api_key, &config.base_url)?);

    let collector = Collector::new(roster, source, store.clone(), store.clone())
        .with_workers(config.workers)
        .with_retention_days(config.retention_days);

    let started_at = Utc::now();
    let outcome = collector.collect(&CancelToken::new());
    let record = match &outcome {
        Ok(result) => RunRecord::completed(result),
        Err(err) => RunRecord::failed(started_at, err),
    };
    if let Err(err) = store.record_run(&record) {
        warn!(error = %err, "failed to record run history");
    }

    let result = outcome?;

    println!("Collection complete");
    println!("DB: {}", db_path.display());
    println!(
        "Players: {} processed ({} without data)",
        result.players_processed, result.players_not_found
    );
    println!(
        "Battles: {} collected, {} ladder/ranked, {} stored ({} new)",
        result.battles_collected,
        result.battles_filtered,
        result.battles_stored,
        result.battles_inserted
    );
    if let Some(purged) = result.battles_purged {
        println!("Purged: {purged}");
    }
    println!("Duration: {:.1}s", result.duration.as_secs_f64());
    if !result.errors.is_empty() {
        println!("Errors: {}", result.errors.len());
        for err in result.errors.iter().take(8) {
            println!(" - {err}");
        }
    }

    Ok(())
}

fn parse_db_path_arg() -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix("--db=") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == "--db" {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}
