#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-types** -- shared primitive data structures for the Riftline pipeline.
//!
//! This crate is dependency-light and sits at the bottom of the crate graph so
//! every other crate can depend on it without causing cycles. It makes no
//! assumptions about I/O, storage, or transport -- just the wire shapes that
//! flow between them.

use serde::{Deserialize, Serialize};

pub mod event;
pub mod payload;
pub mod prediction;
pub mod shard;
pub mod state;

pub use event::{Event, EventType};
pub use payload::Payload;
pub use prediction::Prediction;
pub use shard::Shard;
pub use state::{MatchState, Phase, RoundHistoryEntry, Side, TeamState};

//-----------------------------
//  Size and range constants
//-----------------------------

/// Maximum allowed size, in bytes, of a single serialized event (I3).
pub const MAX_EVENT_SIZE_BYTES: usize = 64 * 1024;

/// Maximum number of events accepted in a single `/events/batch` request.
pub const MAX_BATCH_SIZE: usize = 100;

/// Maximum `round_no` value accepted by the schema validator.
pub const MAX_ROUND_NO: u32 = 100;

/// Minimum length of the `source` field.
pub const MIN_SOURCE_LEN: usize = 1;

/// Maximum length of the `source` field.
pub const MAX_SOURCE_LEN: usize = 100;

/// Single schema version this pipeline understands. Events that declare a
/// different version are still accepted -- the field is advisory until a
/// second version is introduced.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

//-----------------------------
//  Team identifiers
//-----------------------------

/// The two teams tracked by a match shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Team {
    /// Team A.
    A,
    /// Team B.
    B,
}

impl Team {
    /// The opposing team.
    pub fn opponent(self) -> Team {
        match self {
            Team::A => Team::B,
            Team::B => Team::A,
        }
    }
}
