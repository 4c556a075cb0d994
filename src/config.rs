use std::env;
use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::collector::DEFAULT_RETENTION_DAYS;
use crate::fetch::DEFAULT_WORKERS;
use crate::roster::{DEFAULT_TRACKED_TAGS, PlayerTag, parse_tag_list};
use crate::source::DEFAULT_BASE_URL;

const CACHE_DIR: &str = "royale_meta";
const DB_FILE: &str = "battles.sqlite";
const DEFAULT_TOP_PLAYERS_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterConfig {
    Static(Vec<PlayerTag>),
    Rankings { location: String, limit: u32 },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub retention_days: u32,
    pub workers: usize,
    pub db_path: Option<PathBuf>,
    pub roster: RosterConfig,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading keys through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("SUPERCELL_API_KEY")
            .ok_or_else(|| anyhow!("SUPERCELL_API_KEY is required"))?;
        let base_url = get("SUPERCELL_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let retention_days = get("RETENTION_DAYS")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS)
            .clamp(1, 365);
        let workers = get("FETCH_WORKERS")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_WORKERS)
            .clamp(1, 64);
        let db_path = get("ROYALE_DB_PATH").map(PathBuf::from);
        let log_level = get("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let roster = match get("ROSTER_SOURCE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("static") => {
                let tags = match get("TRACKED_PLAYER_TAGS") {
                    Some(raw) => parse_tag_list(&raw),
                    None => DEFAULT_TRACKED_TAGS.iter().map(|t| t.to_string()).collect(),
                };
                if tags.is_empty() {
                    return Err(anyhow!("TRACKED_PLAYER_TAGS holds no valid player tags"));
                }
                RosterConfig::Static(tags)
            }
            Some("rankings") => {
                let location = get("RANKINGS_LOCATION").unwrap_or_else(|| "global".to_string());
                let limit = match get("TOP_PLAYERS_LIMIT") {
                    Some(raw) => raw
                        .parse::<u32>()
                        .ok()
                        .filter(|n| (1..=1000).contains(n))
                        .ok_or_else(|| anyhow!("TOP_PLAYERS_LIMIT must be between 1 and 1000"))?,
                    None => DEFAULT_TOP_PLAYERS_LIMIT,
                };
                RosterConfig::Rankings { location, limit }
            }
            Some(other) => {
                return Err(anyhow!(
                    "ROSTER_SOURCE must be `static` or `rankings`, got `{other}`"
                ));
            }
        };

        Ok(Self {
            api_key,
            base_url,
            retention_days,
            workers,
            db_path,
            roster,
            log_level,
        })
    }

    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path.clone().or_else(default_db_path)
    }
}

pub fn default_db_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join(DB_FILE))
}

pub fn app_cache_dir() -> Option<PathBuf> {
    // Prefer XDG cache.
    if let Ok(base) = env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(CACHE_DIR));
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}
