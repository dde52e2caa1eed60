//! Per-match aggregate state, owned and mutated exclusively by the state
//! engine's pure reducer (see `riftline-state`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Team;

/// Attacker/defender side designation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Counter-terrorist side.
    CT,
    /// Terrorist side.
    T,
}

/// Round lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Before the match has started taking live rounds.
    Warmup,
    /// Buy/freeze time.
    Freeze,
    /// Round is live.
    Live,
    /// The bomb has been planted and is ticking.
    BombPlanted,
    /// The round has concluded.
    Ended,
}

/// Per-team aggregate counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    /// Maps won.
    pub score: u32,
    /// Rounds won this map.
    pub maps_won: u32,
    /// Players currently alive, 0-5.
    pub alive_count: u8,
    /// Consecutive rounds lost (used for the prediction engine's win-streak
    /// feature on the opposing team).
    pub consecutive_round_losses: u32,
    /// Current side.
    pub side: Side,
    /// Bank.
    pub money: u64,
    /// Equipment value.
    pub equipment_value: u64,
    /// Kills this round.
    pub kills_round: u32,
    /// Kills this map.
    pub kills_total: u32,
}

impl TeamState {
    fn new(side: Side) -> Self {
        Self {
            score: 0,
            maps_won: 0,
            alive_count: 5,
            consecutive_round_losses: 0,
            side,
            money: 0,
            equipment_value: 0,
            kills_round: 0,
            kills_total: 0,
        }
    }
}

/// One entry in the round history, appended on every `round_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundHistoryEntry {
    /// The round number that just ended.
    pub round_no: u32,
    /// The winning team.
    pub winner: Team,
    /// Why the round ended.
    pub win_reason: String,
    /// Team A kill count for the round.
    pub team_a_kills: u32,
    /// Team B kill count for the round.
    pub team_b_kills: u32,
}

/// Live, per-match aggregate state.
///
/// Created on the first event observed for a `match_id` and mutated only by
/// `riftline_state::apply`. `state_version` is bumped on every application,
/// including no-op applications of event types the reducer does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    /// The match this state belongs to.
    pub match_id: String,
    /// Team A aggregate.
    pub team_a: TeamState,
    /// Team B aggregate.
    pub team_b: TeamState,
    /// Current round number.
    pub round_no: u32,
    /// Current round phase.
    pub phase: Phase,
    /// Whether the bomb is currently planted.
    pub bomb_planted: bool,
    /// Bombsite, if planted.
    pub bomb_site: Option<crate::payload::Site>,
    /// Seconds remaining on the active timer (round clock or bomb fuse).
    pub seconds_remaining: f64,
    /// Ordered round history.
    pub round_history: Vec<RoundHistoryEntry>,
    /// The event id that produced the current state.
    pub last_event_id: Uuid,
    /// When the current state was produced.
    pub last_event_at: DateTime<Utc>,
    /// Monotonically increasing version, bumped on every mutation.
    pub state_version: u64,
}

impl MatchState {
    /// Construct the initial state for a match, seeded from the event that
    /// first touched it.
    pub fn new(match_id: impl Into<String>, first_event_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            match_id: match_id.into(),
            team_a: TeamState::new(Side::CT),
            team_b: TeamState::new(Side::T),
            round_no: 0,
            phase: Phase::Warmup,
            bomb_planted: false,
            bomb_site: None,
            seconds_remaining: 0.0,
            round_history: Vec::new(),
            last_event_id: first_event_id,
            last_event_at: at,
            state_version: 0,
        }
    }

    /// Borrow the state for the given team.
    pub fn team(&self, team: Team) -> &TeamState {
        match team {
            Team::A => &self.team_a,
            Team::B => &self.team_b,
        }
    }

    /// Mutably borrow the state for the given team.
    pub fn team_mut(&mut self, team: Team) -> &mut TeamState {
        match team {
            Team::A => &mut self.team_a,
            Team::B => &mut self.team_b,
        }
    }
}
