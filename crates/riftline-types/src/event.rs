//! The wire event: what producers POST and what flows through the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::Payload;
use crate::CURRENT_SCHEMA_VERSION;

/// Event type tags recognized by the reducer and prediction engine, plus a
/// catch-all for anything else. Producers are free to send tags outside the
/// recognized set -- those survive the trip through admission and the log as
/// `Unknown`, carrying the original string, and the reducer treats them as an
/// opaque no-op (they still bump `state_version`; see [`crate::Payload::Opaque`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Match has started.
    MatchStart,
    /// Match has ended.
    MatchEnd,
    /// Map has started.
    MapStart,
    /// Map has ended.
    MapEnd,
    /// Round has started.
    RoundStart,
    /// Round has ended.
    RoundEnd,
    /// A kill occurred.
    Kill,
    /// A player death (distinct record from the killer's `Kill`).
    Death,
    /// A kill assist.
    Assist,
    /// The bomb was planted.
    BombPlanted,
    /// The bomb was defused.
    BombDefused,
    /// The bomb exploded.
    BombExploded,
    /// A player took damage.
    PlayerHurt,
    /// Freeze time ended, round is live.
    FreezeTimeEnded,
    /// A timeout started.
    TimeoutStart,
    /// A timeout ended.
    TimeoutEnd,
    /// Team economy figures were reported.
    EconomyUpdate,
    /// Any tag outside the recognized set, preserved verbatim.
    Unknown(String),
}

impl EventType {
    /// The subset of event types that trigger the prediction engine (§4.7).
    pub fn is_prediction_trigger(&self) -> bool {
        matches!(
            self,
            EventType::RoundStart
                | EventType::RoundEnd
                | EventType::Kill
                | EventType::BombPlanted
                | EventType::BombDefused
                | EventType::BombExploded
        )
    }

    /// The wire string for this tag.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::MatchStart => "match_start",
            EventType::MatchEnd => "match_end",
            EventType::MapStart => "map_start",
            EventType::MapEnd => "map_end",
            EventType::RoundStart => "round_start",
            EventType::RoundEnd => "round_end",
            EventType::Kill => "kill",
            EventType::Death => "death",
            EventType::Assist => "assist",
            EventType::BombPlanted => "bomb_planted",
            EventType::BombDefused => "bomb_defused",
            EventType::BombExploded => "bomb_exploded",
            EventType::PlayerHurt => "player_hurt",
            EventType::FreezeTimeEnded => "freeze_time_ended",
            EventType::TimeoutStart => "timeout_start",
            EventType::TimeoutEnd => "timeout_end",
            EventType::EconomyUpdate => "economy_update",
            EventType::Unknown(tag) => tag,
        }
    }

    /// Parse a wire `type` tag, falling back to `Unknown` for anything
    /// outside the recognized set instead of failing.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "match_start" => EventType::MatchStart,
            "match_end" => EventType::MatchEnd,
            "map_start" => EventType::MapStart,
            "map_end" => EventType::MapEnd,
            "round_start" => EventType::RoundStart,
            "round_end" => EventType::RoundEnd,
            "kill" => EventType::Kill,
            "death" => EventType::Death,
            "assist" => EventType::Assist,
            "bomb_planted" => EventType::BombPlanted,
            "bomb_defused" => EventType::BombDefused,
            "bomb_exploded" => EventType::BombExploded,
            "player_hurt" => EventType::PlayerHurt,
            "freeze_time_ended" => EventType::FreezeTimeEnded,
            "timeout_start" => EventType::TimeoutStart,
            "timeout_end" => EventType::TimeoutEnd,
            "economy_update" => EventType::EconomyUpdate,
            other => EventType::Unknown(other.to_string()),
        }
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(EventType::parse(&tag))
    }
}

/// The canonical event shape accepted by the ingestion admission layer and
/// carried through the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique identifier; the dedup key (I4).
    pub event_id: Uuid,
    /// Match this event belongs to.
    pub match_id: String,
    /// Map this event belongs to.
    pub map_id: String,
    /// Round number, 0..=100 (I2 via schema validation).
    pub round_no: u32,
    /// Time the event occurred in-game.
    pub ts_event: DateTime<Utc>,
    /// Time the admission layer received the event. Written on admission;
    /// any caller-supplied value is overwritten.
    pub ts_ingest: DateTime<Utc>,
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Origin label, 1-100 chars.
    pub source: String,
    /// Monotonic sequence number per shard, as emitted by the source (I1).
    pub seq_no: u64,
    /// Type-specific structured payload (I2).
    pub payload: Payload,
    /// Trace identifier; generated on admission if absent.
    pub trace_id: Option<Uuid>,
    /// Schema version; defaults to the single currently-supported version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl Event {
    /// The shard this event belongs to.
    pub fn shard(&self) -> crate::Shard {
        crate::Shard::new(self.match_id.clone(), self.map_id.clone())
    }
}
