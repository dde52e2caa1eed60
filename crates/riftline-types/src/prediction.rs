//! The prediction engine's output shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventType;

/// A single win-probability estimate for a match, derived from the state
/// snapshot identified by `state_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Match this prediction applies to.
    pub match_id: String,
    /// Team A's win probability, in `[0.01, 0.99]`.
    pub p_team_a_win: f64,
    /// Team B's win probability, in `[0.01, 0.99]`. Always `1.0 - p_team_a_win`.
    pub p_team_b_win: f64,
    /// Confidence in `[0.1, 0.95]`.
    pub confidence: f64,
    /// Scoring model identifier/version.
    pub model_version: String,
    /// The event that triggered this computation.
    pub trigger_event_id: Uuid,
    /// The type of the triggering event.
    pub trigger_event_type: EventType,
    /// When this prediction was computed.
    pub ts_calc: DateTime<Utc>,
    /// The `MatchState::state_version` this prediction was derived from.
    pub state_version: u64,
}
