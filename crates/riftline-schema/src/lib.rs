#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-schema** -- admission-time validation.
//!
//! Projects the raw JSON bytes a producer POSTs into the canonical
//! [`riftline_types::Event`], or rejects them with one of a small, closed
//! set of error kinds. Unknown top-level fields are tolerated (the wire
//! format may grow); the `payload` object is dispatched to a per-`type`
//! schema, matching the table in the external-interfaces reference this
//! crate implements.

use chrono::{DateTime, Utc};
use riftline_types::payload::{BombPayload, EconomyPayload, KillPayload, RoundEndPayload, RoundStartPayload};
use riftline_types::{Event, EventType, Payload, CURRENT_SCHEMA_VERSION, MAX_EVENT_SIZE_BYTES, MAX_ROUND_NO, MAX_SOURCE_LEN, MIN_SOURCE_LEN};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// The closed set of ways admission can reject an event.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// The serialized event exceeded [`MAX_EVENT_SIZE_BYTES`].
    #[error("event exceeds the maximum size of {0} bytes")]
    SizeExceeded(usize),
    /// A required field was absent (or the body could not be parsed as an object).
    #[error("missing required field: {0}")]
    MissingRequired(String),
    /// A field's value fell outside its closed set or allowed range.
    #[error("value for {0} is outside its allowed set or range")]
    BadEnum(String),
    /// A field expected to hold a UUID did not parse as one.
    #[error("invalid UUID for {0}")]
    BadUuid(String),
    /// A field expected to hold an RFC 3339 timestamp did not parse as one.
    #[error("invalid timestamp for {0}")]
    BadTimestamp(String),
}

impl ValidationError {
    /// The machine-readable error code surfaced in the HTTP response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SizeExceeded(_) => "size_exceeded",
            Self::MissingRequired(_) => "missing_required",
            Self::BadEnum(_) => "bad_enum",
            Self::BadUuid(_) => "bad_uuid",
            Self::BadTimestamp(_) => "bad_timestamp",
        }
    }
}

/// The wire shape before validation: every field optional so a missing one
/// can be reported as `missing_required` instead of a generic parse error.
#[derive(Debug, Deserialize)]
struct RawEvent {
    event_id: Option<serde_json::Value>,
    match_id: Option<String>,
    map_id: Option<String>,
    round_no: Option<u32>,
    ts_event: Option<serde_json::Value>,
    #[serde(rename = "type")]
    event_type: Option<serde_json::Value>,
    source: Option<String>,
    seq_no: Option<u64>,
    payload: Option<serde_json::Value>,
    trace_id: Option<serde_json::Value>,
    schema_version: Option<u32>,
}

/// Validate raw request bytes and project them into a canonical [`Event`].
///
/// `ts_ingest` is always stamped with the current time; any caller-supplied
/// value is ignored, per (I3)'s admission-owned-timestamp rule.
pub fn validate(raw: &[u8]) -> Result<Event, ValidationError> {
    if raw.len() > MAX_EVENT_SIZE_BYTES {
        return Err(ValidationError::SizeExceeded(MAX_EVENT_SIZE_BYTES));
    }

    let parsed: RawEvent =
        serde_json::from_slice(raw).map_err(|_| ValidationError::MissingRequired("body".to_string()))?;

    let event_id = parse_uuid(parsed.event_id, "event_id")?;
    let match_id = require_string(parsed.match_id, "match_id")?;
    let map_id = require_string(parsed.map_id, "map_id")?;

    let round_no = parsed
        .round_no
        .ok_or_else(|| ValidationError::MissingRequired("round_no".to_string()))?;
    if round_no > MAX_ROUND_NO {
        return Err(ValidationError::BadEnum("round_no".to_string()));
    }

    let ts_event = parse_timestamp(parsed.ts_event, "ts_event")?;

    let event_type = parse_event_type(parsed.event_type)?;

    let source = require_string(parsed.source, "source")?;
    if source.chars().count() < MIN_SOURCE_LEN || source.chars().count() > MAX_SOURCE_LEN {
        return Err(ValidationError::BadEnum("source".to_string()));
    }

    let seq_no = parsed
        .seq_no
        .ok_or_else(|| ValidationError::MissingRequired("seq_no".to_string()))?;

    let payload_raw = parsed
        .payload
        .ok_or_else(|| ValidationError::MissingRequired("payload".to_string()))?;
    let payload = parse_payload(event_type.clone(), payload_raw)?;

    let trace_id = match parsed.trace_id {
        Some(v) => Some(parse_uuid(Some(v), "trace_id")?),
        None => None,
    };

    let schema_version = parsed.schema_version.unwrap_or(CURRENT_SCHEMA_VERSION);

    Ok(Event {
        event_id,
        match_id,
        map_id,
        round_no,
        ts_event,
        ts_ingest: Utc::now(),
        event_type,
        source,
        seq_no,
        payload,
        trace_id,
        schema_version,
    })
}

fn require_string(value: Option<String>, field: &str) -> Result<String, ValidationError> {
    value.ok_or_else(|| ValidationError::MissingRequired(field.to_string()))
}

fn parse_uuid(value: Option<serde_json::Value>, field: &str) -> Result<Uuid, ValidationError> {
    let value = value.ok_or_else(|| ValidationError::MissingRequired(field.to_string()))?;
    let raw = value
        .as_str()
        .ok_or_else(|| ValidationError::BadUuid(field.to_string()))?;
    Uuid::parse_str(raw).map_err(|_| ValidationError::BadUuid(field.to_string()))
}

fn parse_timestamp(
    value: Option<serde_json::Value>,
    field: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    let value = value.ok_or_else(|| ValidationError::MissingRequired(field.to_string()))?;
    let raw = value
        .as_str()
        .ok_or_else(|| ValidationError::BadTimestamp(field.to_string()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::BadTimestamp(field.to_string()))
}

/// Any tag not in the recognized set is preserved as [`EventType::Unknown`]
/// rather than rejected (`unknown_type_with_strict=false`); only a
/// non-string `type` field is a validation error.
fn parse_event_type(value: Option<serde_json::Value>) -> Result<EventType, ValidationError> {
    let value = value.ok_or_else(|| ValidationError::MissingRequired("type".to_string()))?;
    let tag = value.as_str().ok_or_else(|| ValidationError::BadEnum("type".to_string()))?;
    Ok(EventType::parse(tag))
}

/// Dispatch `raw` into the typed payload variant for `event_type`, per the
/// per-type required-field table. Event types with no typed payload in this
/// pipeline round-trip the object verbatim as [`Payload::Opaque`].
fn parse_payload(event_type: EventType, raw: serde_json::Value) -> Result<Payload, ValidationError> {
    match event_type {
        EventType::Kill => serde_json::from_value::<KillPayload>(raw)
            .map(Payload::Kill)
            .map_err(|_| ValidationError::BadEnum("payload (kill)".to_string())),
        EventType::RoundStart => serde_json::from_value::<RoundStartPayload>(raw)
            .map(Payload::RoundStart)
            .map_err(|_| ValidationError::BadEnum("payload (round_start)".to_string())),
        EventType::RoundEnd => serde_json::from_value::<RoundEndPayload>(raw)
            .map(Payload::RoundEnd)
            .map_err(|_| ValidationError::BadEnum("payload (round_end)".to_string())),
        EventType::BombPlanted | EventType::BombDefused | EventType::BombExploded => {
            serde_json::from_value::<BombPayload>(raw)
                .map(Payload::Bomb)
                .map_err(|_| ValidationError::BadEnum("payload (bomb)".to_string()))
        }
        EventType::EconomyUpdate => serde_json::from_value::<EconomyPayload>(raw)
            .map(Payload::Economy)
            .map_err(|_| ValidationError::BadEnum("payload (economy_update)".to_string())),
        EventType::MatchStart
        | EventType::MatchEnd
        | EventType::MapStart
        | EventType::MapEnd
        | EventType::Death
        | EventType::Assist
        | EventType::PlayerHurt
        | EventType::FreezeTimeEnded
        | EventType::TimeoutStart
        | EventType::TimeoutEnd
        | EventType::Unknown(_) => Ok(Payload::Opaque(raw)),
    }
}
