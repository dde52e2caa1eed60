#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-writer** -- the batched, non-blocking writer to the Analytics
//! Store, fronted by a circuit breaker and a local-disk spool (§4.8).
//!
//! The only path to data loss in this crate is the one the contract names
//! explicitly: the in-memory buffer is full, the disk spool also fails, and
//! the incoming batch cannot be held anywhere. That path increments
//! [`DurableWriter::data_loss`] and nothing else does.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use riftline_types::Event;
use tokio::sync::Mutex;

pub mod circuit;
pub mod http;
pub mod spool;

use circuit::{CircuitBreaker, CircuitState};
use spool::SpoolStore;

pub use http::HttpAnalyticsClient;

/// Default number of events accumulated before a flush is triggered.
pub const DEFAULT_FLUSH_COUNT: usize = 500;

/// Default interval between time-triggered flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// Buffer size past which the oldest chunk is spooled to disk while open.
pub const DEFAULT_SPOOL_THRESHOLD: usize = 2000;

/// Absolute cap on the in-memory buffer. Past this, with the spool also
/// failing, events are dropped and counted as data loss.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 50_000;

/// Errors surfaced by a single insert attempt against the Analytics Store.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The insert attempt failed or timed out.
    #[error("analytics insert failed: {0}")]
    InsertFailed(String),
}

/// The write path to the durable Analytics Store, abstracted so the writer
/// can be tested without a live store.
#[async_trait::async_trait]
pub trait AnalyticsClient: Send + Sync {
    /// Insert a batch of events. Must fail (rather than partially succeed)
    /// so the writer can treat the batch as atomic for retry purposes.
    async fn insert(&self, events: &[Event]) -> std::result::Result<(), WriteError>;
}

/// Tunables for [`DurableWriter`], mirroring the defaults named in the
/// contract.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush once the buffer reaches this many events.
    pub flush_count: usize,
    /// Flush at least this often regardless of buffer size.
    pub flush_interval: Duration,
    /// Spool the oldest chunk once the buffer exceeds this size while open.
    pub spool_threshold: usize,
    /// Absolute cap on the in-memory buffer.
    pub max_buffer_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_count: DEFAULT_FLUSH_COUNT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

struct WriterState {
    buffer: VecDeque<Event>,
    breaker: CircuitBreaker,
}

/// Batches events in memory and writes them to the Analytics Store, spooling
/// to disk when the store is unreachable and draining the spool on recovery.
pub struct DurableWriter {
    config: WriterConfig,
    client: Arc<dyn AnalyticsClient>,
    spool: SpoolStore,
    state: Mutex<WriterState>,
    data_loss: AtomicU64,
}

impl DurableWriter {
    /// Build a writer inserting through `client`, spooling to `spool`.
    pub fn new(config: WriterConfig, client: Arc<dyn AnalyticsClient>, spool: SpoolStore) -> Self {
        Self {
            config,
            client,
            spool,
            state: Mutex::new(WriterState {
                buffer: VecDeque::new(),
                breaker: CircuitBreaker::new(),
            }),
            data_loss: AtomicU64::new(0),
        }
    }

    /// Total events dropped because neither the buffer nor the disk spool
    /// had room for them. Any non-zero value here should page someone.
    pub fn data_loss(&self) -> u64 {
        self.data_loss.load(Ordering::Relaxed)
    }

    /// Enqueue `event`. Returns immediately; the event is not yet durable
    /// until a later flush succeeds or spools it.
    pub async fn write(&self, event: Event) {
        let mut state = self.state.lock().await;
        if state.buffer.len() >= self.config.max_buffer_size {
            tracing::error!(event_id = %event.event_id, "writer buffer at capacity, dropping event");
            self.data_loss.fetch_add(1, Ordering::Relaxed);
            return;
        }
        state.buffer.push_back(event);
        let should_flush = state.buffer.len() >= self.config.flush_count;
        drop(state);
        if should_flush {
            self.flush_once().await;
        }
    }

    /// Attempt one flush cycle: drain up to `flush_count` events and either
    /// insert them, or, if the circuit is open, move them toward the spool.
    pub async fn flush_once(&self) {
        let mut state = self.state.lock().await;
        if state.buffer.is_empty() {
            return;
        }

        match state.breaker.state() {
            CircuitState::Closed | CircuitState::HalfOpen => {
                let take = self.config.flush_count.min(state.buffer.len());
                let batch: Vec<Event> = state.buffer.drain(..take).collect();
                let was_half_open = state.breaker.state() == CircuitState::HalfOpen;
                drop(state);

                match self.client.insert(&batch).await {
                    Ok(()) => {
                        self.state.lock().await.breaker.record_success();
                        if was_half_open {
                            self.recover_spool().await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, batch_size = batch.len(), "analytics insert failed");
                        let mut state = self.state.lock().await;
                        state.breaker.record_failure();
                        for event in batch.into_iter().rev() {
                            state.buffer.push_front(event);
                        }
                        self.spool_overflow(&mut state).await;
                    }
                }
            }
            CircuitState::Open => {
                self.spool_overflow(&mut state).await;
            }
        }
    }

    /// While the circuit is open and the buffer has grown past the spool
    /// threshold, write the oldest chunk to disk.
    async fn spool_overflow(&self, state: &mut WriterState) {
        if state.buffer.len() <= self.config.spool_threshold {
            return;
        }
        let take = state.buffer.len() - self.config.spool_threshold;
        let chunk: Vec<Event> = state.buffer.drain(..take).collect();

        match self.spool.write_chunk(&chunk).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), count = chunk.len(), "spooled events to disk");
            }
            Err(err) => {
                tracing::error!(error = %err, "disk spool failed, attempting to hold chunk in memory");
                let room = self.config.max_buffer_size.saturating_sub(state.buffer.len());
                let keep = room.min(chunk.len());
                let dropped = chunk.len() - keep;
                for event in chunk.into_iter().take(keep).rev() {
                    state.buffer.push_front(event);
                }
                if dropped > 0 {
                    tracing::error!(dropped, "neither network nor disk spool had room, dropping events");
                    self.data_loss.fetch_add(dropped as u64, Ordering::Relaxed);
                }
            }
        }
    }

    /// Replay spooled chunks into the Analytics Store, oldest first, after
    /// the breaker closes. Stops at the first failure, leaving the rest for
    /// the next recovery pass.
    async fn recover_spool(&self) {
        let chunks = match self.spool.list_chunks().await {
            Ok(chunks) => chunks,
            Err(err) => {
                tracing::error!(error = %err, "failed to list spool directory during recovery");
                return;
            }
        };

        for path in chunks {
            let events = match self.spool.read_chunk(&path).await {
                Ok(events) => events,
                Err(err) => {
                    tracing::error!(error = %err, path = %path.display(), "failed to read spool chunk, skipping");
                    continue;
                }
            };
            match self.client.insert(&events).await {
                Ok(()) => {
                    if let Err(err) = self.spool.remove_chunk(&path).await {
                        tracing::warn!(error = %err, path = %path.display(), "reinserted spool chunk but failed to delete it");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "spool recovery insert failed, will retry next pass");
                    self.state.lock().await.breaker.record_failure();
                    break;
                }
            }
        }
    }

    /// Background loop flushing on `flush_interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.drain().await;
    }

    /// Flush repeatedly until the in-memory buffer is empty. Used on
    /// graceful shutdown; the caller is expected to bound this with its own
    /// timeout (default 30s per the contract).
    pub async fn drain(&self) {
        loop {
            let empty = self.state.lock().await.buffer.is_empty();
            if empty {
                break;
            }
            self.flush_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riftline_types::{EventType, Payload};
    use std::sync::atomic::AtomicBool;
    use uuid::Uuid;

    struct FlakyClient {
        fail_until: AtomicU64,
        attempts: AtomicU64,
        always_fail: AtomicBool,
    }

    impl FlakyClient {
        fn failing_n_times(n: u64) -> Self {
            Self {
                fail_until: AtomicU64::new(n),
                attempts: AtomicU64::new(0),
                always_fail: AtomicBool::new(false),
            }
        }

        fn always_failing() -> Self {
            Self {
                fail_until: AtomicU64::new(0),
                attempts: AtomicU64::new(0),
                always_fail: AtomicBool::new(true),
            }
        }
    }

    #[async_trait::async_trait]
    impl AnalyticsClient for FlakyClient {
        async fn insert(&self, _events: &[Event]) -> std::result::Result<(), WriteError> {
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
            if self.always_fail.load(Ordering::Relaxed) || attempt < self.fail_until.load(Ordering::Relaxed) {
                return Err(WriteError::InsertFailed("simulated outage".to_string()));
            }
            Ok(())
        }
    }

    fn event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            match_id: "m1".to_string(),
            map_id: "de_dust2".to_string(),
            round_no: 1,
            ts_event: Utc::now(),
            ts_ingest: Utc::now(),
            event_type: EventType::Kill,
            source: "test".to_string(),
            seq_no: 1,
            payload: Payload::Opaque(serde_json::json!({})),
            trace_id: None,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn nominal_flushes_incur_no_data_loss() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolStore::new(dir.path()).await.unwrap();
        let writer = DurableWriter::new(
            WriterConfig {
                flush_count: 2,
                ..Default::default()
            },
            Arc::new(FlakyClient::failing_n_times(0)),
            spool,
        );

        for _ in 0..10 {
            writer.write(event()).await;
        }
        writer.drain().await;

        assert_eq!(writer.data_loss(), 0);
    }

    #[tokio::test]
    async fn outage_spools_to_disk_with_zero_data_loss() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolStore::new(dir.path()).await.unwrap();
        let writer = Arc::new(DurableWriter::new(
            WriterConfig {
                flush_count: 10,
                spool_threshold: 5,
                ..Default::default()
            },
            Arc::new(FlakyClient::always_failing()),
            spool,
        ));

        for _ in 0..20 {
            writer.write(event()).await;
        }
        // Trip the breaker open.
        for _ in 0..5 {
            writer.flush_once().await;
        }

        assert_eq!(writer.data_loss(), 0);
    }

    #[tokio::test]
    async fn buffer_past_capacity_is_the_only_data_loss_path() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolStore::new(dir.path()).await.unwrap();
        let writer = DurableWriter::new(
            WriterConfig {
                max_buffer_size: 3,
                flush_count: 1000,
                ..Default::default()
            },
            Arc::new(FlakyClient::always_failing()),
            spool,
        );

        for _ in 0..5 {
            writer.write(event()).await;
        }

        assert_eq!(writer.data_loss(), 2);
    }
}
