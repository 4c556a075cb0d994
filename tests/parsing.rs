use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use reqwest::Url;

use royale_meta::battle::{RawBattle, filter_competitive, parse_battle, parse_battles};
use royale_meta::roster::{RankingRoster, RosterSource};
use royale_meta::source::{RawResponse, SourceClient, Transport};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn battlelog_fixture() -> Vec<RawBattle> {
    serde_json::from_str(&read_fixture("battlelog.json")).expect("fixture should parse")
}

#[test]
fn decodes_battlelog_fixture() {
    let battles = battlelog_fixture();
    assert_eq!(battles.len(), 5);
    assert_eq!(battles[0].kind, "PvP");
    assert_eq!(battles[0].game_mode.name, "Ladder");
    assert_eq!(battles[0].team[0].cards[0].id, "26000003");
    assert_eq!(battles[0].team[0].cards[0].max_level, Some(14));
}

#[test]
fn fixture_filters_to_ladder_and_ranked() {
    let kept = filter_competitive(battlelog_fixture());
    let modes = kept
        .iter()
        .map(|b| b.game_mode.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(modes, vec!["Ladder", "Ranked1v1_NewArena2", "Ladder_GoldRush"]);
}

#[test]
fn fixture_parses_into_canonical_battles() {
    let kept = filter_competitive(battlelog_fixture());
    let batch = parse_battles(&kept);
    // The gold rush game only lists seven cards.
    assert_eq!(batch.battles.len(), 2);
    assert_eq!(batch.skipped, 1);
    assert_eq!(batch.failed, 0);

    let ladder = &batch.battles[0];
    assert_eq!(ladder.player_tag, "#PQVLP028C");
    assert_eq!(ladder.opponent_tag, "#2PP");
    assert_eq!(
        ladder.deck_signature.as_str(),
        "26000000-26000001-26000003-26000010-26000014-26000027-26000042-28000000"
    );
    assert_eq!(ladder.deck_cards[0].name, "Giant");
    assert!(ladder.is_victory);
    assert_eq!(ladder.battle_time.to_rfc3339(), "2024-01-10T20:15:30+00:00");

    let ranked = &batch.battles[1];
    assert_eq!(ranked.game_mode, "Ranked1v1_NewArena2");
    assert!(!ranked.is_victory);
}

#[test]
fn same_deck_from_both_sides_shares_signature() {
    let battles = battlelog_fixture();
    let as_player = parse_battle(&battles[0]).unwrap().unwrap();
    let mut flipped = battles[1].clone();
    std::mem::swap(&mut flipped.team, &mut flipped.opponent);
    let as_opponent_deck = parse_battle(&flipped).unwrap().unwrap();
    assert_eq!(as_player.deck_signature, as_opponent_deck.deck_signature);
}

struct FixtureTransport(String);

impl Transport for FixtureTransport {
    fn get(&self, _url: &Url, _api_key: &str) -> Result<RawResponse> {
        Ok(RawResponse {
            status: 200,
            retry_after: None,
            body: self.0.clone(),
        })
    }
}

#[test]
fn ranking_roster_reads_items_envelope() {
    let client = SourceClient::with_transport(
        FixtureTransport(read_fixture("rankings.json")),
        "key",
        "https://api.clashroyale.com/v1",
    )
    .expect("client should build");
    let roster = RankingRoster::new(client, "global", 2);
    let tags = roster.player_tags().expect("rankings should decode");
    assert_eq!(tags, vec!["#PQVLP028C".to_string(), "#2PP".to_string()]);
}
