#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-store-core** -- core storage abstractions for the Riftline
//! pipeline.
//!
//! This crate defines the contracts every durable-state concern in the
//! pipeline is built against: the per-shard ordered log, the lease-based
//! lock manager, the dedup set, the sequence counter, the match-state
//! snapshot store, the prediction cache, the DLQ, and the pub/sub fanout.
//! Concrete backends (Redis, in-memory for tests) live in sibling driver
//! crates and implement these traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use riftline_types::{Event, MatchState, Prediction, Shard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors common to every storage-backed component.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend connection or transport failed.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A value could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The backend rejected the operation (e.g. a WRONGTYPE or script error).
    #[error("backend operation failed: {0}")]
    Backend(String),
    /// The requested entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

//-----------------------------
//  Durable log
//-----------------------------

/// A single entry pulled from the durable log, carrying the backend-assigned
/// entry id alongside the deserialized event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Strictly increasing entry id assigned by the log on append.
    pub entry_id: String,
    /// The deserialized event.
    pub event: Event,
}

/// Per-shard append-only log with consumer-group semantics.
///
/// Implementations are shared-read: many consumers may read the same shard,
/// but the `riftline-shard` lock manager enforces that only one is actively
/// processing it at a time. The log itself does not enforce exclusivity.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append an event to its shard's log. Returns the backend-assigned,
    /// strictly increasing entry id.
    async fn append(&self, shard: &Shard, event: &Event) -> Result<String>;

    /// Enumerate shards that currently have unclaimed, pending work.
    async fn discover_pending_shards(&self) -> Result<Vec<Shard>>;

    /// Read up to `batch_size` entries for `shard` via the named consumer
    /// group, blocking for up to `block_ms` if nothing is immediately
    /// available.
    async fn read_group(
        &self,
        shard: &Shard,
        consumer_id: &str,
        batch_size: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge an entry, removing it from the consumer group's pending
    /// list.
    async fn ack(&self, shard: &Shard, entry_id: &str) -> Result<()>;

    /// Re-publish an event into the shard's primary log (used by the DLQ
    /// manager's requeue path).
    async fn republish(&self, shard: &Shard, event: &Event) -> Result<String>;
}

//-----------------------------
//  Lease-based locking
//-----------------------------

/// Atomic, lease-bounded single-owner locking over a shard.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempt to acquire the lock for `shard` on behalf of `owner_id`, with
    /// the given lease duration. Returns `true` iff the lock was acquired.
    async fn acquire(&self, shard: &Shard, owner_id: &str, lease: Duration) -> Result<bool>;

    /// Extend the lease on `shard`, succeeding only if `owner_id` is still
    /// the current holder.
    async fn extend(&self, shard: &Shard, owner_id: &str, lease: Duration) -> Result<bool>;

    /// Release the lock. A non-owner release is a no-op (returns `Ok(())`
    /// without effect).
    async fn release(&self, shard: &Shard, owner_id: &str) -> Result<()>;
}

//-----------------------------
//  Deduplication
//-----------------------------

/// Per-match bounded set of seen event ids with TTL and a cap-enforced
/// pruning policy.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether `event_id` has already been marked seen for `match_id`.
    async fn is_duplicate(&self, event_id: Uuid, match_id: &str) -> Result<bool>;

    /// Mark `event_id` as seen for `match_id`, installing the set's TTL if
    /// this is its first member and pruning down to the configured cap if
    /// the cap is exceeded.
    async fn mark_seen(&self, event_id: Uuid, match_id: &str) -> Result<()>;
}

//-----------------------------
//  Sequence tracking
//-----------------------------

/// Durable `last_seq` counter per shard, with a 2-hour TTL from last write.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// The last accepted sequence number for `shard`, or `None` if the shard
    /// has never been observed.
    async fn last_seq(&self, shard: &Shard) -> Result<Option<u64>>;

    /// Persist a new `last_seq` value for `shard`, refreshing its TTL.
    async fn set_last_seq(&self, shard: &Shard, seq_no: u64) -> Result<()>;
}

//-----------------------------
//  Match state
//-----------------------------

/// Durable snapshot store for `MatchState`, keyed by `match_id` with a
/// 24-hour sliding TTL from last mutation.
#[async_trait]
pub trait MatchStateStore: Send + Sync {
    /// Load the current snapshot for `match_id`, if one exists.
    async fn load(&self, match_id: &str) -> Result<Option<MatchState>>;

    /// Persist `state`, refreshing its TTL.
    async fn save(&self, state: &MatchState) -> Result<()>;
}

//-----------------------------
//  Prediction cache
//-----------------------------

/// Durable cache of the latest prediction per match.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Load the latest prediction for `match_id`, if one exists.
    async fn load_latest(&self, match_id: &str) -> Result<Option<Prediction>>;

    /// Save `prediction` as the latest for its match.
    async fn save_latest(&self, prediction: &Prediction) -> Result<()>;
}

//-----------------------------
//  Dead-letter queue
//-----------------------------

/// A dead-lettered event, parked after exceeding the retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// The event that failed.
    pub event: Event,
    /// The last error encountered processing it.
    pub error: String,
    /// How many times processing was attempted.
    pub retry_count: u32,
    /// When the first failure was recorded.
    pub first_failed_at: DateTime<Utc>,
    /// When the most recent failure was recorded.
    pub last_failed_at: DateTime<Utc>,
}

/// Per-shard dead-letter parking queue.
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Append `entry` to `shard`'s dead-letter queue.
    async fn push(&self, shard: &Shard, entry: DlqEntry) -> Result<()>;

    /// List shards that currently have dead-lettered entries.
    async fn shards_with_entries(&self) -> Result<Vec<Shard>>;

    /// Fetch up to `limit` entries from `shard`'s dead-letter queue.
    async fn entries(&self, shard: &Shard, limit: usize) -> Result<Vec<DlqEntry>>;

    /// Remove and return one entry from `shard`'s queue, if any (used when
    /// requeuing).
    async fn pop(&self, shard: &Shard) -> Result<Option<DlqEntry>>;
}

//-----------------------------
//  Pub/sub fanout
//-----------------------------

/// Publish-only channel abstraction for the `updates:match:*` and
/// `updates:prediction:*` channels. Delivery is at-most-once; subscribers
/// are responsible for their own durability.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a JSON-serializable message on `channel`.
    async fn publish(&self, channel: &str, message: &serde_json::Value) -> Result<()>;
}

/// Canonical channel name for match-state deltas.
pub fn match_update_channel(match_id: &str) -> String {
    format!("updates:match:{match_id}")
}

/// Canonical channel name for prediction updates.
pub fn prediction_update_channel(match_id: &str) -> String {
    format!("updates:prediction:{match_id}")
}
