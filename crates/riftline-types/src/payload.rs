//! Type-specific event payloads.
//!
//! The wire payload is a heterogeneous object discriminated by the event's
//! `type` field. Representing it as a closed Rust enum means the schema
//! validator's job is to project an arbitrary JSON object into the matching
//! variant (or reject it); the state reducer then pattern-matches on the tag
//! instead of re-inspecting raw JSON at apply time.

use serde::{Deserialize, Serialize};

use crate::{Side, Team};

/// A type-specific payload, or an opaque bag of fields for event types that
/// carry no typed payload in this pipeline (still round-tripped so unknown
/// top-level fields survive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// `kill` payload.
    Kill(KillPayload),
    /// `round_start` payload.
    RoundStart(RoundStartPayload),
    /// `round_end` payload.
    RoundEnd(RoundEndPayload),
    /// `bomb_planted` / `bomb_defused` / `bomb_exploded` payload.
    Bomb(BombPayload),
    /// `economy_update` payload.
    Economy(EconomyPayload),
    /// Any other event type: preserved verbatim, ignored by the reducer.
    Opaque(serde_json::Value),
}

/// Required + optional fields for a `kill` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillPayload {
    /// Identifier of the killing player.
    pub killer_player_id: String,
    /// Team of the killing player.
    pub killer_team: Team,
    /// Identifier of the victim player.
    pub victim_player_id: String,
    /// Team of the victim player.
    pub victim_team: Team,
    /// Weapon used.
    pub weapon: String,
    /// Whether the kill was a headshot.
    pub is_headshot: bool,
    /// Whether the kill went through a wall.
    #[serde(default)]
    pub is_wallbang: bool,
    /// Whether the kill went through smoke.
    #[serde(default)]
    pub through_smoke: bool,
    /// Whether the kill was scopeless.
    #[serde(default)]
    pub no_scope: bool,
    /// Whether this was the round's opening kill.
    #[serde(default)]
    pub first_kill: bool,
    /// Whether the attacker was flash-blinded.
    #[serde(default)]
    pub attacker_blind: bool,
}

/// Required + optional fields for a `round_start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStartPayload {
    /// Team A's score entering the round.
    pub team_a_score: u32,
    /// Team B's score entering the round.
    pub team_b_score: u32,
    /// Team A's side this round.
    pub team_a_side: Side,
    /// Team B's side this round.
    pub team_b_side: Side,
    /// Team A's roster identifier.
    pub team_a_id: String,
    /// Team B's roster identifier.
    pub team_b_id: String,
}

/// Reason a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinReason {
    /// One team was fully eliminated.
    Elimination,
    /// The bomb detonated.
    BombExploded,
    /// The bomb was defused.
    BombDefused,
    /// The round clock expired.
    TimeExpired,
}

/// Required + optional fields for a `round_end` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundEndPayload {
    /// The winning team.
    pub winner_team: Team,
    /// Why the round ended.
    pub win_reason: WinReason,
    /// Team A's score, authoritative if present (see state engine rules).
    pub team_a_score: u32,
    /// Team B's score, authoritative if present.
    pub team_b_score: u32,
    /// Survivors on team A at round end, if reported.
    pub team_a_alive: Option<u8>,
    /// Survivors on team B at round end, if reported.
    pub team_b_alive: Option<u8>,
}

/// Bomb site label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Site {
    /// Bombsite A.
    A,
    /// Bombsite B.
    B,
}

/// Shared payload shape for `bomb_planted`, `bomb_defused`, `bomb_exploded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BombPayload {
    /// Player who performed the action.
    pub player_id: String,
    /// Player's team.
    pub player_team: Team,
    /// Bombsite involved.
    pub site: Site,
    /// Seconds left on the bomb timer, if known.
    pub time_remaining_sec: Option<f64>,
}

/// Buy-round classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuyType {
    /// Full buy.
    Full,
    /// Force buy.
    Force,
    /// Eco round.
    Eco,
    /// Pistol round.
    Pistol,
}

/// Required + optional fields for an `economy_update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomyPayload {
    /// Team A's bank.
    pub team_a_econ: u64,
    /// Team B's bank.
    pub team_b_econ: u64,
    /// Team A's equipment value, if known.
    pub equipment_value: Option<u64>,
    /// Buy-round classification, if known.
    pub buy_type: Option<BuyType>,
}
