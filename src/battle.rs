use chrono::{DateTime, NaiveDateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::deck::{CanonicalBattle, Card, DECK_SIZE, DeckSignature};
use crate::error::ParseError;

const BATTLE_TIME_FORMAT: &str = "%Y%m%dT%H%M%S.%3fZ";
/// `YYYYMMDDTHHMMSS.mmmZ`
const BATTLE_TIME_LEN: usize = 20;

const LADDER_TYPE: &str = "PvP";
const LADDER_MODE_MARKER: &str = "Ladder";
const RANKED_TYPE: &str = "pathOfLegend";
const RANKED_MODE_MARKER: &str = "Ranked";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBattle {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "battleTime", default)]
    pub battle_time: String,
    #[serde(rename = "gameMode", default)]
    pub game_mode: RawGameMode,
    #[serde(default)]
    pub team: Vec<RawParticipant>,
    #[serde(default)]
    pub opponent: Vec<RawParticipant>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGameMode {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawParticipant {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tag: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub crowns: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cards: Vec<RawCard>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCard {
    #[serde(default = "zero_card_id", deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub level: i32,
    #[serde(rename = "maxLevel", default)]
    pub max_level: Option<i32>,
}

impl From<&RawCard> for Card {
    fn from(raw: &RawCard) -> Self {
        Card {
            id: raw.id.clone(),
            name: raw.name.clone(),
            level: raw.level,
        }
    }
}

/// Upstream sends `null` for fields it has no value for; treat it as absent.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn zero_card_id() -> String {
    "0".to_string()
}

/// Card ids come through as JSON numbers; some mirrors send strings.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Null => Ok(zero_card_id()),
        other => Err(serde::de::Error::custom(format!(
            "card id must be a number or string, got {other}"
        ))),
    }
}

impl RawBattle {
    pub fn is_competitive(&self) -> bool {
        let mode = self.game_mode.name.as_str();
        let ladder = self.kind == LADDER_TYPE && mode.contains(LADDER_MODE_MARKER);
        let ranked = self.kind == RANKED_TYPE && mode.contains(RANKED_MODE_MARKER);
        ladder || ranked
    }
}

/// Keeps classic ladder and Path of Legends battles; drops wars, challenges,
/// tournaments and party modes.
pub fn filter_competitive(battles: Vec<RawBattle>) -> Vec<RawBattle> {
    battles
        .into_iter()
        .filter(RawBattle::is_competitive)
        .collect()
}

pub fn parse_battle_time(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    if raw.len() != BATTLE_TIME_LEN {
        return Err(ParseError::InvalidBattleTime {
            value: raw.to_string(),
            reason: format!("expected {BATTLE_TIME_LEN} characters, got {}", raw.len()),
        });
    }
    NaiveDateTime::parse_from_str(raw, BATTLE_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| ParseError::InvalidBattleTime {
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

/// `Ok(None)` means the record is unusable (missing side or partial deck), not
/// that something went wrong.
pub fn parse_battle(raw: &RawBattle) -> Result<Option<CanonicalBattle>, ParseError> {
    let (Some(player), Some(opponent)) = (raw.team.first(), raw.opponent.first()) else {
        return Ok(None);
    };
    if player.cards.len() != DECK_SIZE {
        return Ok(None);
    }

    let battle_time = parse_battle_time(&raw.battle_time)?;
    let deck_cards: [Card; DECK_SIZE] = std::array::from_fn(|i| Card::from(&player.cards[i]));
    let deck_signature = DeckSignature::from_cards(&deck_cards);

    Ok(Some(CanonicalBattle {
        battle_time,
        player_tag: player.tag.clone(),
        opponent_tag: opponent.tag.clone(),
        game_mode: raw.game_mode.name.clone(),
        player_crowns: player.crowns,
        opponent_crowns: opponent.crowns,
        deck_signature,
        deck_cards,
        is_victory: player.crowns > opponent.crowns,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub battles: Vec<CanonicalBattle>,
    pub skipped: usize,
    pub failed: usize,
}

/// Parses a batch in parallel. Output keeps input order.
pub fn parse_battles(raw: &[RawBattle]) -> ParsedBatch {
    let results = raw.par_iter().map(parse_battle).collect::<Vec<_>>();

    let mut batch = ParsedBatch {
        battles: Vec::with_capacity(results.len()),
        ..ParsedBatch::default()
    };
    for result in results {
        match result {
            Ok(Some(battle)) => batch.battles.push(battle),
            Ok(None) => batch.skipped += 1,
            Err(err) => {
                debug!(error = %err, "dropping battle with unparsable record");
                batch.failed += 1;
            }
        }
    }
    batch
}
