use std::collections::HashSet;

use crate::error::SourceError;
use crate::source::SourceClient;

pub type PlayerTag = String;

/// Curated by hand: the rankings endpoint has been returning empty lists, so
/// the default roster is a fixed list of known top players.
pub const DEFAULT_TRACKED_TAGS: &[&str] = &[
    // global players
    "#PQVLP028C",
    "#C29U8Y9QV",
    "#2PP",
    "#8L9L9GL",
    "#YC8UY",
    "#8QVJ8PL",
    "#2LGRCU",
    "#9CQ2U8QJ",
    "#YV2GJC",
    "#8PPRR",
    "#22LV0QUQJ",

    // EU region
    "#L88P2282",
    "#2CCCP8YR",
    "#L9P8RUCG",
    "#CRRYRPCC",
    "#Y92PQJY8",
    "#9Y8GCV0P",
    "#LRR0UJL2",
    "#2R8UVVGP",
    "#L0UCQQV2",
    "#PUUY882",

    // NA region
    "#2YJLCQ2",
    "#P0UL00C",
    "#CCPJ2QU",
    "#P9LY8VVQ",
    "#GC02LRQ",
    "#LPULQJQ",
    "#J00RJ9C",
    "#22YGC88U",
    "#8VRV0YJ",
    "#YUQ2GJV",

    // Asia region
    "#PVVCY900",
    "#2LJJPCP",
    "#8PC09YV",
    "#QY28LP9",
    "#L8YLY00R",
    "#PJYYRY2",
    "#99YGRQ0C",
    "#QQPPUQ2L",
    "#2RRP0VV",
    "#88VGRL9",

    // LATAM region
    "#LJGPQ2Y",
    "#28PV0RP",
    "#2PV0QCJ",
    "#YLLJJ0R",
    "#8Q9LVJY",
    "#PLJ0VQG",
    "#JQ2UL88",
    "#Y9Q8VC2",
    "#280CRYY",
    "#LVY8QRU",

    // Middle East region
    "#QGJU8CV",
    "#2V8RPPL",
    "#CPYY9UL",
    "#9GL0QPY",
    "#LJVUCRP",
    "#PQC8RLG",
    "#YU8GVJQ",
    "#28RGY0L",
    "#LQQJ2VP",
    "#92CVULP",

    // Additional high trophy players, 6500+ trophies
    "#PU0GJCR",
    "#2YL8VVQ",
    "#LJC9YPU",
    "#QRL28QG",
    "#8YPCGV0",
    "#VPJQC8R",
    "#2LRUPYY",
    "#9JGQV8L",
    "#YC0PRUL",
    "#L0QVJG2",
    "#P2VYUGC",
    "#2JQR8VL",
    "#LCYUPRQ",
    "#Q8GLVJP",
    "#8R0YUVC",
    "#VJ2QPGL",
    "#2PVYUCR",
    "#9LURQG8",
    "#YGC0PVL",
    "#LQVJ8G2",
    "#PVCYUG2",
    "#2JRQV8L",
    "#LYUCPRQ",
    "#QGLVJ8P",
    "#8YUCV0R",
    "#VJQPG2L",
    "#2VUCPRQ",
    "#9URQGL8",
    "#YGCP0VL",
    "#LVJQG28",
];

/// Where the collector gets the identifiers it polls.
pub trait RosterSource: Send + Sync {
    fn player_tags(&self) -> Result<Vec<PlayerTag>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct StaticRoster {
    tags: Vec<PlayerTag>,
}

impl StaticRoster {
    pub fn new(tags: Vec<PlayerTag>) -> Self {
        Self { tags }
    }

    pub fn bundled() -> Self {
        Self::new(DEFAULT_TRACKED_TAGS.iter().map(|t| t.to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl RosterSource for StaticRoster {
    /// Hands out a fresh copy; callers may mutate it freely.
    fn player_tags(&self) -> Result<Vec<PlayerTag>, SourceError> {
        Ok(self.tags.clone())
    }
}

/// Top players for a location, straight from the rankings endpoint.
pub struct RankingRoster {
    client: SourceClient,
    location: String,
    limit: u32,
}

impl RankingRoster {
    pub fn new(client: SourceClient, location: &str, limit: u32) -> Self {
        Self {
            client,
            location: location.to_string(),
            limit,
        }
    }
}

impl RosterSource for RankingRoster {
    fn player_tags(&self) -> Result<Vec<PlayerTag>, SourceError> {
        let players = self.client.fetch_top_players(&self.location, self.limit)?;
        Ok(dedup_tags(players.into_iter().map(|p| p.tag)))
    }
}

/// Uppercases and adds the leading `#` when an operator left it off.
pub fn normalize_tag(raw: &str) -> Option<PlayerTag> {
    let trimmed = raw.trim().trim_start_matches('#');
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!("#{}", trimmed.to_ascii_uppercase()))
}

/// Splits an operator-supplied list on commas, semicolons or whitespace.
pub fn parse_tag_list(raw: &str) -> Vec<PlayerTag> {
    dedup_tags(
        raw.split([',', ';', ' ', '\n', '\t'])
            .filter_map(normalize_tag),
    )
}

fn dedup_tags(tags: impl IntoIterator<Item = PlayerTag>) -> Vec<PlayerTag> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        if seen.insert(tag.clone()) {
            out.push(tag);
        }
    }
    out
}
