#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-dlq** -- the dead-letter manager (§4.10).
//!
//! Retry counts live in process memory, keyed by `event_id`: they track a
//! single event's journey through repeated redelivery attempts within one
//! consumer's lifetime, not a durable audit trail. Once an event's count
//! crosses `max_retries` it moves into the durable, per-shard [`DlqStore`]
//! and its in-memory counter is dropped.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use riftline_store_core::{DlqEntry, DlqStore, DurableLog, Result};
use riftline_types::{Event, Shard};
use uuid::Uuid;

/// Failures tolerated before an event is parked in the dead-letter queue.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

struct RetryRecord {
    retry_count: u32,
    first_failed_at: chrono::DateTime<Utc>,
}

/// Aggregate counters for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct DlqStats {
    /// Shards currently holding at least one dead-lettered entry.
    pub shards_with_entries: usize,
    /// Events currently mid-retry (not yet parked or resolved).
    pub events_in_retry: usize,
}

/// Tracks per-event retry counts and owns the durable dead-letter queue plus
/// the requeue path back into the primary log.
pub struct DlqManager {
    store: Arc<dyn DlqStore>,
    log: Arc<dyn DurableLog>,
    max_retries: u32,
    retries: DashMap<Uuid, RetryRecord>,
}

impl DlqManager {
    /// Build a manager with the default retry budget.
    pub fn new(store: Arc<dyn DlqStore>, log: Arc<dyn DurableLog>) -> Self {
        Self {
            store,
            log,
            max_retries: DEFAULT_MAX_RETRIES,
            retries: DashMap::new(),
        }
    }

    /// Override the retry budget before an event is dead-lettered.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Record a processing failure for `event` on `shard`.
    ///
    /// Returns `true` once the event has exceeded its retry budget and has
    /// been moved to the dead-letter queue -- the caller should ack the
    /// source log entry in that case to stop a tight redelivery loop.
    /// Returns `false` while retries remain -- the caller must not ack, so
    /// the log redelivers the entry.
    pub async fn record_failure(&self, shard: &Shard, event: &Event, error: String) -> Result<bool> {
        let now = Utc::now();
        let retry_count = {
            let mut record = self
                .retries
                .entry(event.event_id)
                .or_insert_with(|| RetryRecord {
                    retry_count: 0,
                    first_failed_at: now,
                });
            record.retry_count += 1;
            record.retry_count
        };

        if retry_count < self.max_retries {
            tracing::warn!(event_id = %event.event_id, retry_count, error, "processing failed, will redeliver");
            return Ok(false);
        }

        let first_failed_at = self
            .retries
            .get(&event.event_id)
            .map(|r| r.first_failed_at)
            .unwrap_or(now);

        tracing::error!(event_id = %event.event_id, retry_count, error, "retry budget exhausted, dead-lettering event");

        self.store
            .push(
                shard,
                DlqEntry {
                    event: event.clone(),
                    error,
                    retry_count,
                    first_failed_at,
                    last_failed_at: now,
                },
            )
            .await?;
        self.retries.remove(&event.event_id);
        Ok(true)
    }

    /// Pop and republish one dead-lettered entry for `shard` into the
    /// primary log, resetting its retry count.
    pub async fn requeue_one(&self, shard: &Shard) -> Result<Option<String>> {
        let Some(entry) = self.store.pop(shard).await? else {
            return Ok(None);
        };
        self.retries.remove(&entry.event.event_id);
        let entry_id = self.log.republish(shard, &entry.event).await?;
        Ok(Some(entry_id))
    }

    /// Requeue every dead-lettered entry for `shard`. Returns the count
    /// requeued.
    pub async fn requeue_all(&self, shard: &Shard) -> Result<usize> {
        let mut count = 0;
        while self.requeue_one(shard).await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Shards currently holding dead-lettered entries.
    pub async fn dlq_shards(&self) -> Result<Vec<Shard>> {
        self.store.shards_with_entries().await
    }

    /// Up to `limit` dead-lettered entries for `shard`, for the admin surface.
    pub async fn dlq_entries(&self, shard: &Shard, limit: usize) -> Result<Vec<DlqEntry>> {
        self.store.entries(shard, limit).await
    }

    /// Aggregate counters across the registry.
    pub async fn stats(&self) -> Result<DlqStats> {
        Ok(DlqStats {
            shards_with_entries: self.store.shards_with_entries().await?.len(),
            events_in_retry: self.retries.len(),
        })
    }
}
