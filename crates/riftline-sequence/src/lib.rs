#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-sequence** -- per-shard sequence validation.
//!
//! Enforces (I1): `seq_no` is monotone non-decreasing per shard as observed
//! by the consumer. Small reorderings are healed by an in-memory reorder
//! buffer; gaps beyond a threshold are treated as lost and skipped; late
//! arrivals within a lateness window are reprocessed, older ones dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use riftline_store_core::{Result, SequenceStore};
use riftline_types::{Event, Shard};
use tracing::warn;

/// Default threshold above which a sequence gap is treated as lost rather
/// than buffered (§4.5).
pub const DEFAULT_GAP_THRESHOLD: u64 = 10;

/// Default window within which a late/duplicate `seq_no` is reprocessed
/// rather than dropped.
pub const DEFAULT_MAX_LATENESS: Duration = Duration::from_millis(2_000);

/// Upper bound on the in-memory reorder buffer per shard.
pub const MAX_BUFFER_LEN: usize = 100;

/// The outcome of validating one event against its shard's sequence state.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationAction {
    /// Apply these events, in order: the triggering event plus any buffered
    /// entries the buffer is now able to drain.
    Process(Vec<Event>),
    /// The event arrived ahead of its predecessor within the gap threshold;
    /// held in the reorder buffer awaiting it.
    Buffer,
    /// The event is a late/duplicate arrival older than the lateness window.
    Drop,
    /// The event is a late/duplicate arrival within the lateness window;
    /// re-apply it (the state reducer's idempotence plus dedup make this
    /// safe).
    Reprocess,
}

/// Snapshot of the validator's observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCounters {
    /// Events that did not arrive as the shard's exact next `seq_no`.
    pub out_of_order: u64,
    /// Gaps observed (whether healed via buffering or skipped as lost).
    pub gaps_detected: u64,
    /// Late/duplicate arrivals reprocessed within the lateness window.
    pub late_processed: u64,
    /// Late/duplicate arrivals dropped outside the lateness window.
    pub late_dropped: u64,
}

#[derive(Default)]
struct AtomicCounters {
    out_of_order: AtomicU64,
    gaps_detected: AtomicU64,
    late_processed: AtomicU64,
    late_dropped: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> SequenceCounters {
        SequenceCounters {
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            late_processed: self.late_processed.load(Ordering::Relaxed),
            late_dropped: self.late_dropped.load(Ordering::Relaxed),
        }
    }
}

struct Buffered {
    event: Event,
    received_at: DateTime<Utc>,
}

/// Per-shard sequence validator, backed by a durable `last_seq` counter and
/// an in-process reorder buffer.
pub struct SequenceValidator {
    store: Arc<dyn SequenceStore>,
    gap_threshold: u64,
    max_lateness: Duration,
    buffers: DashMap<String, BTreeMap<u64, Buffered>>,
    counters: AtomicCounters,
}

impl SequenceValidator {
    /// Build a validator over `store` with the given gap and lateness
    /// tolerances.
    pub fn new(store: Arc<dyn SequenceStore>, gap_threshold: u64, max_lateness: Duration) -> Self {
        Self {
            store,
            gap_threshold,
            max_lateness,
            buffers: DashMap::new(),
            counters: AtomicCounters::default(),
        }
    }

    /// Current counter snapshot.
    pub fn counters(&self) -> SequenceCounters {
        self.counters.snapshot()
    }

    /// Validate `event` against its shard's current sequence state.
    pub async fn validate(&self, event: Event) -> Result<ValidationAction> {
        let shard = event.shard();
        let last_seq = self.store.last_seq(&shard).await?;

        // No prior state, or exactly the expected next value: process.
        if last_seq.is_none() || last_seq.map(|s| s + 1) == Some(event.seq_no) {
            self.store.set_last_seq(&shard, event.seq_no).await?;
            let mut out = vec![event];
            out.extend(self.drain_ready(&shard).await?);
            return Ok(ValidationAction::Process(out));
        }

        let last = last_seq.expect("checked above");
        if event.seq_no > last + 1 {
            let gap = event.seq_no - (last + 1);
            self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
            self.counters.gaps_detected.fetch_add(1, Ordering::Relaxed);

            if gap <= self.gap_threshold && self.buffer_len(&shard) < MAX_BUFFER_LEN {
                self.buffer_event(&shard, event);
                return Ok(ValidationAction::Buffer);
            }

            warn!(shard = %shard, seq_no = event.seq_no, gap, "sequence gap exceeds threshold, treating skipped range as lost");
            self.store.set_last_seq(&shard, event.seq_no).await?;
            let mut out = vec![event];
            out.extend(self.drain_ready(&shard).await?);
            return Ok(ValidationAction::Process(out));
        }

        // event.seq_no <= last: a late or duplicate arrival.
        self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
        let age = Utc::now().signed_duration_since(event.ts_event);
        let within_window = age
            .to_std()
            .map(|d| d <= self.max_lateness)
            .unwrap_or(true); // a negative age (clock skew) is never "too late"

        if within_window {
            self.counters.late_processed.fetch_add(1, Ordering::Relaxed);
            Ok(ValidationAction::Reprocess)
        } else {
            self.counters.late_dropped.fetch_add(1, Ordering::Relaxed);
            Ok(ValidationAction::Drop)
        }
    }

    fn buffer_len(&self, shard: &Shard) -> usize {
        self.buffers.get(&shard.key()).map(|b| b.len()).unwrap_or(0)
    }

    fn buffer_event(&self, shard: &Shard, event: Event) {
        let mut entry = self.buffers.entry(shard.key()).or_default();
        entry.insert(
            event.seq_no,
            Buffered {
                event,
                received_at: Utc::now(),
            },
        );
    }

    /// Drop stale buffered entries, then drain every entry that is now the
    /// shard's consecutive next `seq_no`, advancing the durable counter as
    /// each one is pulled.
    async fn drain_ready(&self, shard: &Shard) -> Result<Vec<Event>> {
        self.prune_stale(shard);

        let mut drained = Vec::new();
        loop {
            let next_seq = match self.store.last_seq(shard).await? {
                Some(s) => s + 1,
                None => break,
            };
            let popped = self
                .buffers
                .get_mut(&shard.key())
                .and_then(|mut buf| buf.remove(&next_seq));
            match popped {
                Some(buffered) => {
                    self.store.set_last_seq(shard, next_seq).await?;
                    drained.push(buffered.event);
                }
                None => break,
            }
        }
        Ok(drained)
    }

    fn prune_stale(&self, shard: &Shard) {
        let Some(mut buf) = self.buffers.get_mut(&shard.key()) else {
            return;
        };
        let max_lateness = self.max_lateness;
        let now = Utc::now();
        let before = buf.len();
        buf.retain(|_, b| {
            now.signed_duration_since(b.received_at)
                .to_std()
                .map(|age| age <= max_lateness)
                .unwrap_or(true)
        });
        let dropped = before - buf.len();
        if dropped > 0 {
            self.counters
                .late_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use riftline_types::{EventType, Payload};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeSequenceStore {
        last: Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl SequenceStore for FakeSequenceStore {
        async fn last_seq(&self, shard: &Shard) -> Result<Option<u64>> {
            Ok(self.last.lock().unwrap().get(&shard.key()).copied())
        }

        async fn set_last_seq(&self, shard: &Shard, seq_no: u64) -> Result<()> {
            self.last.lock().unwrap().insert(shard.key(), seq_no);
            Ok(())
        }
    }

    fn event(seq_no: u64) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            match_id: "m1".to_string(),
            map_id: "de_dust2".to_string(),
            round_no: 1,
            ts_event: Utc::now(),
            ts_ingest: Utc::now(),
            event_type: EventType::Kill,
            source: "test".to_string(),
            seq_no,
            payload: Payload::Opaque(serde_json::json!({})),
            trace_id: None,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn first_event_for_a_shard_is_processed() {
        let validator = SequenceValidator::new(
            Arc::new(FakeSequenceStore::default()),
            DEFAULT_GAP_THRESHOLD,
            DEFAULT_MAX_LATENESS,
        );
        let e = event(0);
        let action = validator.validate(e.clone()).await.unwrap();
        assert_eq!(action, ValidationAction::Process(vec![e]));
    }

    #[tokio::test]
    async fn small_gap_is_buffered_then_drained_in_order() {
        let validator = SequenceValidator::new(
            Arc::new(FakeSequenceStore::default()),
            DEFAULT_GAP_THRESHOLD,
            DEFAULT_MAX_LATENESS,
        );
        validator.validate(event(0)).await.unwrap();

        // seq 2 arrives before seq 1: buffered.
        let action = validator.validate(event(2)).await.unwrap();
        assert_eq!(action, ValidationAction::Buffer);

        // seq 1 arrives: both 1 and 2 are now processed in order.
        let action = validator.validate(event(1)).await.unwrap();
        match action {
            ValidationAction::Process(events) => {
                assert_eq!(events.iter().map(|e| e.seq_no).collect::<Vec<_>>(), vec![1, 2]);
            }
            other => panic!("expected Process, got {other:?}"),
        }
        assert_eq!(validator.counters().gaps_detected, 1);
    }

    #[tokio::test]
    async fn gap_beyond_threshold_is_skipped_and_processed() {
        let validator = SequenceValidator::new(
            Arc::new(FakeSequenceStore::default()),
            2, // tight threshold
            DEFAULT_MAX_LATENESS,
        );
        validator.validate(event(0)).await.unwrap();
        let e = event(10);
        let action = validator.validate(e.clone()).await.unwrap();
        assert_eq!(action, ValidationAction::Process(vec![e]));
    }

    #[tokio::test]
    async fn duplicate_seq_no_within_lateness_window_is_reprocessed() {
        let validator = SequenceValidator::new(
            Arc::new(FakeSequenceStore::default()),
            DEFAULT_GAP_THRESHOLD,
            DEFAULT_MAX_LATENESS,
        );
        validator.validate(event(5)).await.unwrap();
        let action = validator.validate(event(5)).await.unwrap();
        assert_eq!(action, ValidationAction::Reprocess);
    }

    #[tokio::test]
    async fn stale_duplicate_is_dropped() {
        let validator = SequenceValidator::new(
            Arc::new(FakeSequenceStore::default()),
            DEFAULT_GAP_THRESHOLD,
            Duration::from_millis(0),
        );
        validator.validate(event(5)).await.unwrap();
        let mut stale = event(4);
        stale.ts_event = Utc::now() - chrono::Duration::seconds(10);
        let action = validator.validate(stale).await.unwrap();
        assert_eq!(action, ValidationAction::Drop);
    }
}
