#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-store-redis** -- Redis-backed storage driver for the Riftline
//! pipeline.
//!
//! This crate implements every trait in `riftline-store-core` against a
//! Redis-compatible server: streams + consumer groups for the durable log,
//! `SET ... NX PX` plus a compare-and-extend/compare-and-delete Lua script
//! for the lease lock, sorted/plain sets for dedup, strings for sequence
//! counters and snapshots, lists for the DLQ, and native pub/sub for
//! fanout. It mirrors the "single struct wrapping an embedded handle, async
//! trait impl below" shape of the workspace's other storage drivers.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use riftline_store_core::{
    match_update_channel, prediction_update_channel, DedupStore, DlqEntry, DlqStore, DurableLog,
    LockStore, LogEntry, MatchStateStore, PredictionStore, Publisher, Result, SequenceStore,
    StoreError,
};
use riftline_types::{Event, MatchState, Prediction, Shard};
use uuid::Uuid;

pub mod memory;

/// Default bound on a per-match dedup set before pruning kicks in (§4.2).
pub const DEFAULT_DEDUP_CAP: usize = 50_000;

/// TTL applied to `seq:last:{shard}`.
const SEQ_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// TTL applied to `match:{match_id}` snapshots.
const MATCH_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL applied to `prediction:{match_id}` -- short-lived, the consumer
/// rewrites it on every triggering event.
const PREDICTION_TTL: Duration = Duration::from_secs(10 * 60);

/// Approximate cap streams are trimmed to on every append (§4.4).
const STREAM_MAXLEN: usize = 50_000;

/// Consumer group name shared by every consumer process.
const CONSUMER_GROUP: &str = "riftline-consumers";

fn err(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn ser<T: serde::Serialize>(v: &T) -> Result<String> {
    serde_json::to_string(v).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn de<T: for<'de> serde::Deserialize<'de>>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn log_key(shard: &Shard) -> String {
    format!("events:{}:{}", shard.match_id, shard.map_id)
}

fn shards_set_key() -> &'static str {
    "shards:active"
}

fn dedup_key(match_id: &str) -> String {
    format!("match:events:{match_id}")
}

fn seq_key(shard: &Shard) -> String {
    format!("seq:last:{}", shard.key())
}

fn lock_key(shard: &Shard) -> String {
    format!("shard:lock:{}", shard.key())
}

fn state_key(match_id: &str) -> String {
    format!("match:{match_id}")
}

fn prediction_key(match_id: &str) -> String {
    format!("prediction:{match_id}")
}

fn dlq_key(shard: &Shard) -> String {
    format!("dlq:{}", shard.key())
}

fn dlq_shards_set_key() -> &'static str {
    "dlq:shards"
}

/// Compare-and-extend: only refreshes the lease if `owner_id` still holds it.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Compare-and-delete: only releases the lock if `owner_id` still holds it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A Redis-compatible backend implementing the full `riftline-store-core`
/// trait surface. Cloning is cheap -- the inner `ConnectionManager` shares
/// its connection pool and auto-reconnects.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    dedup_ttl: Duration,
}

impl RedisStore {
    /// Connect to `redis_url`, establishing a managed connection that
    /// transparently reconnects on transport failure. `dedup_ttl` is the
    /// TTL applied to a match's dedup set (§6's `DEDUP_TTL`).
    pub async fn connect(redis_url: &str, dedup_ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(err)?;
        let conn = client.get_tokio_connection_manager().await.map_err(err)?;
        Ok(Self { conn, dedup_ttl })
    }

    /// Issue a `PING` over the managed connection. Used by the ingestion
    /// service's readiness probe -- it returns before a connection error
    /// would surface from an actual append.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(err)?;
        Ok(())
    }

    async fn ensure_group(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let res: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match res {
            Ok(()) => Ok(()),
            // BUSYGROUP: the group already exists -- not an error for us.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(err(e)),
        }
    }
}

#[async_trait]
impl DurableLog for RedisStore {
    async fn append(&self, shard: &Shard, event: &Event) -> Result<String> {
        let key = log_key(shard);
        self.ensure_group(&key).await?;
        let payload = ser(event)?;
        let mut conn = self.conn.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("event")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(err)?;
        conn.sadd::<_, _, ()>(shards_set_key(), key)
            .await
            .map_err(err)?;
        Ok(entry_id)
    }

    async fn discover_pending_shards(&self) -> Result<Vec<Shard>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(shards_set_key()).await.map_err(err)?;
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                let rest = k.strip_prefix("events:")?;
                let (match_id, map_id) = rest.split_once(':')?;
                Some(Shard::new(match_id.to_string(), map_id.to_string()))
            })
            .collect())
    }

    async fn read_group(
        &self,
        shard: &Shard,
        consumer_id: &str,
        batch_size: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>> {
        let key = log_key(shard);
        self.ensure_group(&key).await?;
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer_id)
            .count(batch_size)
            .block(block_ms as usize);
        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[&key], &[">"], &opts)
            .await
            .map_err(err)?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let Some(redis::Value::Data(bytes)) = id.map.get("event") else {
                    continue;
                };
                let raw = String::from_utf8_lossy(bytes).into_owned();
                let event: Event = de(&raw)?;
                out.push(LogEntry {
                    entry_id: id.id,
                    event,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, shard: &Shard, entry_id: &str) -> Result<()> {
        let key = log_key(shard);
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(&key, CONSUMER_GROUP, &[entry_id])
            .await
            .map_err(err)?;
        Ok(())
    }

    async fn republish(&self, shard: &Shard, event: &Event) -> Result<String> {
        self.append(shard, event).await
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn acquire(&self, shard: &Shard, owner_id: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(lock_key(shard))
            .arg(owner_id)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(err)?;
        Ok(result.is_some())
    }

    async fn extend(&self, shard: &Shard, owner_id: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(EXTEND_SCRIPT);
        let extended: i64 = script
            .key(lock_key(shard))
            .arg(owner_id)
            .arg(lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(err)?;
        Ok(extended == 1)
    }

    async fn release(&self, shard: &Shard, owner_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let _: i64 = script
            .key(lock_key(shard))
            .arg(owner_id)
            .invoke_async(&mut conn)
            .await
            .map_err(err)?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for RedisStore {
    async fn is_duplicate(&self, event_id: Uuid, match_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let is_member: bool = conn
            .sismember(dedup_key(match_id), event_id.to_string())
            .await
            .map_err(err)?;
        Ok(is_member)
    }

    async fn mark_seen(&self, event_id: Uuid, match_id: &str) -> Result<()> {
        let key = dedup_key(match_id);
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(&key, event_id.to_string())
            .await
            .map_err(err)?;
        if added > 0 {
            // Only (re)install the TTL; an existing TTL is left alone so a
            // long-running match's dedup window doesn't reset on every event.
            let has_ttl: i64 = redis::cmd("TTL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(err)?;
            if has_ttl < 0 {
                conn.expire::<_, ()>(&key, self.dedup_ttl.as_secs() as i64)
                    .await
                    .map_err(err)?;
            }
        }

        let cardinality: usize = conn.scard(&key).await.map_err(err)?;
        if cardinality > DEFAULT_DEDUP_CAP {
            let overflow = cardinality - DEFAULT_DEDUP_CAP;
            let victims: Vec<String> = conn
                .srandmember_multiple(&key, overflow)
                .await
                .map_err(err)?;
            if !victims.is_empty() {
                conn.srem::<_, _, ()>(&key, victims).await.map_err(err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for RedisStore {
    async fn last_seq(&self, shard: &Shard) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let raw: Option<u64> = conn.get(seq_key(shard)).await.map_err(err)?;
        Ok(raw)
    }

    async fn set_last_seq(&self, shard: &Shard, seq_no: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(seq_key(shard), seq_no, SEQ_TTL.as_secs())
            .await
            .map_err(err)?;
        Ok(())
    }
}

#[async_trait]
impl MatchStateStore for RedisStore {
    async fn load(&self, match_id: &str) -> Result<Option<MatchState>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(state_key(match_id)).await.map_err(err)?;
        raw.map(|s| de(&s)).transpose()
    }

    async fn save(&self, state: &MatchState) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = ser(state)?;
        conn.set_ex::<_, _, ()>(
            state_key(&state.match_id),
            raw,
            MATCH_STATE_TTL.as_secs(),
        )
        .await
        .map_err(err)?;
        Ok(())
    }
}

#[async_trait]
impl PredictionStore for RedisStore {
    async fn load_latest(&self, match_id: &str) -> Result<Option<Prediction>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(prediction_key(match_id)).await.map_err(err)?;
        raw.map(|s| de(&s)).transpose()
    }

    async fn save_latest(&self, prediction: &Prediction) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = ser(prediction)?;
        conn.set_ex::<_, _, ()>(
            prediction_key(&prediction.match_id),
            raw,
            PREDICTION_TTL.as_secs(),
        )
        .await
        .map_err(err)?;
        Ok(())
    }
}

#[async_trait]
impl DlqStore for RedisStore {
    async fn push(&self, shard: &Shard, entry: DlqEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = ser(&entry)?;
        conn.rpush::<_, _, ()>(dlq_key(shard), raw)
            .await
            .map_err(err)?;
        conn.sadd::<_, _, ()>(dlq_shards_set_key(), shard.key())
            .await
            .map_err(err)?;
        Ok(())
    }

    async fn shards_with_entries(&self) -> Result<Vec<Shard>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(dlq_shards_set_key()).await.map_err(err)?;
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                let (match_id, map_id) = k.split_once(':')?;
                Some(Shard::new(match_id.to_string(), map_id.to_string()))
            })
            .collect())
    }

    async fn entries(&self, shard: &Shard, limit: usize) -> Result<Vec<DlqEntry>> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn
            .lrange(dlq_key(shard), 0, limit.max(1) as isize - 1)
            .await
            .map_err(err)?;
        raws.iter().map(|r| de(r)).collect()
    }

    async fn pop(&self, shard: &Shard) -> Result<Option<DlqEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.lpop(dlq_key(shard), None).await.map_err(err)?;
        raw.map(|r| de(&r)).transpose()
    }
}

#[async_trait]
impl Publisher for RedisStore {
    async fn publish(&self, channel: &str, message: &serde_json::Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(message).map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.publish::<_, _, ()>(channel, raw).await.map_err(err)?;
        Ok(())
    }
}

/// Convenience: publish a match-state snapshot on its canonical channel.
pub async fn publish_match_update(
    publisher: &dyn Publisher,
    state: &MatchState,
) -> Result<()> {
    let channel = match_update_channel(&state.match_id);
    let message = serde_json::to_value(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
    publisher.publish(&channel, &message).await
}

/// Convenience: publish a prediction on its canonical channel.
pub async fn publish_prediction_update(
    publisher: &dyn Publisher,
    prediction: &Prediction,
) -> Result<()> {
    let channel = prediction_update_channel(&prediction.match_id);
    let message =
        serde_json::to_value(prediction).map_err(|e| StoreError::Serialization(e.to_string()))?;
    publisher.publish(&channel, &message).await
}
