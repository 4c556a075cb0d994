use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DECK_SIZE: usize = 8;
const SIGNATURE_SEPARATOR: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub name: String,
    pub level: i32,
}

pub type Deck = [Card; DECK_SIZE];

/// Order-independent key for a deck: card ids sorted as strings, joined with `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeckSignature(String);

impl DeckSignature {
    pub fn from_cards(cards: &Deck) -> Self {
        Self::from_ids(cards.iter().map(|card| card.id.as_str()))
    }

    pub fn from_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ids = ids.into_iter().collect::<Vec<_>>();
        ids.sort_unstable();
        DeckSignature(ids.join(SIGNATURE_SEPARATOR))
    }

    /// Wraps an already computed signature, e.g. one read back from storage.
    pub fn from_stored(raw: String) -> Self {
        DeckSignature(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeckSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One persisted ladder/ranked battle seen from the tracked player's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBattle {
    pub battle_time: DateTime<Utc>,
    pub player_tag: String,
    pub opponent_tag: String,
    pub game_mode: String,
    pub player_crowns: i32,
    pub opponent_crowns: i32,
    pub deck_signature: DeckSignature,
    /// Upstream order, not signature order.
    pub deck_cards: Deck,
    pub is_victory: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaDeck {
    pub signature: DeckSignature,
    pub cards: Deck,
    pub total_games: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetaSort {
    #[default]
    WinRate,
    Frequency,
}
