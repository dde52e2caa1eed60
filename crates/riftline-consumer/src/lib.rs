#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-consumer** -- the state-consumer loop (§4.9): the orchestrator
//! that claims shards, pulls ordered batches, runs the per-event pipeline
//! (sequence validation -> state engine -> durable write -> prediction),
//! and acks or routes to the DLQ.
//!
//! One [`StateConsumer`] may claim many shards; each claimed shard is driven
//! by its own `tokio::task` so shards pipeline concurrently within a single
//! process, while the lock manager guarantees at most one process holds any
//! given shard at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use riftline_bus::{publish_dual, BusEvent, EventBus};
use riftline_dlq::DlqManager;
use riftline_prediction::PredictionEngine;
use riftline_shard::LockManager;
use riftline_sequence::{SequenceValidator, ValidationAction};
use riftline_state::StateEngine;
use riftline_store_core::{DurableLog, PredictionStore, Publisher};
use riftline_types::{Event, Shard};
use riftline_writer::DurableWriter;
use tokio::sync::{watch, Mutex};

pub mod metrics;
pub use metrics::ConsumerMetrics;

/// Default cadence for discovering shards with pending work.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_millis(5000);

/// Default number of entries pulled per `read_group` call.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default blocking duration for a `read_group` call that finds nothing.
pub const DEFAULT_BLOCK_MS: u64 = 2000;

/// Default bound on how long graceful shutdown waits for in-flight batches
/// and the writer drain before giving up.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for the consumer loop, mirroring the defaults named in the
/// concurrency contract.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How often to re-run shard discovery.
    pub discovery_interval: Duration,
    /// Max entries pulled per `read_group` call.
    pub batch_size: usize,
    /// Blocking duration passed to `read_group`.
    pub block_ms: u64,
    /// Bound on graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            block_ms: DEFAULT_BLOCK_MS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// The orchestrator wiring the Log, Lock Manager, Sequence Validator, State
/// Engine, Prediction Engine, Durable Writer, DLQ Manager, and pub/sub
/// fanout into the claim/pull/process/ack loop.
pub struct StateConsumer {
    config: ConsumerConfig,
    log: Arc<dyn DurableLog>,
    locks: Arc<LockManager>,
    sequence: Arc<SequenceValidator>,
    state: Arc<StateEngine>,
    prediction: Arc<PredictionEngine>,
    prediction_store: Arc<dyn PredictionStore>,
    writer: Arc<DurableWriter>,
    dlq: Arc<DlqManager>,
    bus: Arc<dyn EventBus>,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<ConsumerMetrics>,
}

impl StateConsumer {
    /// Build a consumer from its fully-wired collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsumerConfig,
        log: Arc<dyn DurableLog>,
        locks: Arc<LockManager>,
        sequence: Arc<SequenceValidator>,
        state: Arc<StateEngine>,
        prediction: Arc<PredictionEngine>,
        prediction_store: Arc<dyn PredictionStore>,
        writer: Arc<DurableWriter>,
        dlq: Arc<DlqManager>,
        bus: Arc<dyn EventBus>,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            config,
            log,
            locks,
            sequence,
            state,
            prediction,
            prediction_store,
            writer,
            dlq,
            bus,
            publisher,
            metrics,
        }
    }

    /// Run the discovery loop until `shutdown` fires, spawning one task per
    /// newly discovered shard. Returns once every spawned shard task has
    /// exited.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut claimed: HashMap<Shard, tokio::task::JoinHandle<()>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.discovery_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    claimed.retain(|_, handle| !handle.is_finished());
                    match self.log.discover_pending_shards().await {
                        Ok(shards) => {
                            for shard in shards {
                                if claimed.contains_key(&shard) {
                                    continue;
                                }
                                let consumer = self.clone();
                                let shard_shutdown = shutdown.clone();
                                let shard_for_task = shard.clone();
                                let handle = tokio::spawn(async move {
                                    consumer.run_shard(shard_for_task, shard_shutdown).await;
                                });
                                claimed.insert(shard, handle);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "shard discovery failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (_, handle) in claimed {
            let _ = handle.await;
        }
    }

    /// Claim one shard and drive its batches until the lock is lost or
    /// shutdown is requested.
    async fn run_shard(self: Arc<Self>, shard: Shard, mut shutdown: watch::Receiver<bool>) {
        match self.locks.acquire(&shard).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(shard = %shard.key(), error = %e, "lock acquisition failed");
                return;
            }
        }
        self.metrics.active_shards.inc();
        let bucket = shard.bucket(crate::metrics::SHARD_METRIC_BUCKETS).to_string();
        self.metrics.active_shards_by_bucket.with_label_values(&[&bucket]).inc();

        let locks = self.locks.clone();
        let heartbeat_shard = shard.clone();
        let heartbeat = locks.spawn_heartbeat(move |lost_shard| {
            if lost_shard == heartbeat_shard {
                tracing::warn!(shard = %lost_shard.key(), "lost lock during heartbeat");
            }
        });

        let pending_acks: Mutex<HashMap<uuid::Uuid, String>> = Mutex::new(HashMap::new());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let entries = tokio::select! {
                result = self.log.read_group(&shard, self.locks.owner_id(), self.config.batch_size, self.config.block_ms) => result,
                _ = shutdown.changed() => break,
            };

            let entries = match entries {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(shard = %shard.key(), error = %e, "read_group failed");
                    continue;
                }
            };

            for entry in entries {
                pending_acks
                    .lock()
                    .await
                    .insert(entry.event.event_id, entry.entry_id.clone());
                self.process_entry(&shard, entry, &pending_acks).await;
            }
        }

        heartbeat.abort();
        let _ = self.locks.release(&shard).await;
        self.metrics.active_shards.dec();
        self.metrics.active_shards_by_bucket.with_label_values(&[&bucket]).dec();
    }

    /// Process one log entry through sequence validation, the pipeline, and
    /// ack/DLQ handling.
    async fn process_entry(
        &self,
        shard: &Shard,
        entry: riftline_store_core::LogEntry,
        pending_acks: &Mutex<HashMap<uuid::Uuid, String>>,
    ) {
        let ts_process_start = Utc::now();
        let event = entry.event;

        let action = match self.sequence.validate(event.clone()).await {
            Ok(action) => action,
            Err(e) => {
                self.handle_failure(shard, &event, e.to_string(), pending_acks).await;
                return;
            }
        };

        match action {
            ValidationAction::Buffer | ValidationAction::Drop => {
                // Neither path acks: Buffer awaits its predecessor, Drop
                // leaves the source entry for the log's idle-reclaim path.
            }
            ValidationAction::Process(events) => {
                for e in events {
                    self.run_pipeline_and_ack(shard, e, ts_process_start, pending_acks).await;
                }
            }
            ValidationAction::Reprocess => {
                self.run_pipeline_and_ack(shard, event, ts_process_start, pending_acks).await;
            }
        }
    }

    async fn run_pipeline_and_ack(
        &self,
        shard: &Shard,
        event: Event,
        ts_process_start: chrono::DateTime<Utc>,
        pending_acks: &Mutex<HashMap<uuid::Uuid, String>>,
    ) {
        match self.apply_pipeline(&event, ts_process_start).await {
            Ok(()) => {
                if let Some(entry_id) = pending_acks.lock().await.remove(&event.event_id) {
                    if let Err(e) = self.log.ack(shard, &entry_id).await {
                        tracing::warn!(shard = %shard.key(), error = %e, "ack failed");
                    }
                }
                self.metrics.events_processed_total.inc();
            }
            Err(e) => {
                self.handle_failure(shard, &event, e, pending_acks).await;
            }
        }
    }

    /// Steps (c)-(g): state application, durable write, prediction, and
    /// latency accounting.
    async fn apply_pipeline(&self, event: &Event, ts_process_start: chrono::DateTime<Utc>) -> Result<(), String> {
        let state = self
            .state
            .apply_event(event)
            .await
            .map_err(|e| e.to_string())?;

        publish_dual(
            self.bus.as_ref(),
            self.publisher.as_ref(),
            BusEvent::MatchUpdated {
                match_id: state.match_id.clone(),
                state: state.clone(),
            },
        )
        .await
        .map_err(|e| e.to_string())?;

        self.writer.write(event.clone()).await;

        if event.event_type.is_prediction_trigger() {
            let prediction = self
                .prediction
                .predict(&state, event)
                .await
                .map_err(|e| e.to_string())?;

            self.prediction_store
                .save_latest(&prediction)
                .await
                .map_err(|e| e.to_string())?;

            publish_dual(
                self.bus.as_ref(),
                self.publisher.as_ref(),
                BusEvent::PredictionUpdated {
                    match_id: prediction.match_id.clone(),
                    prediction,
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        }

        let ts_predict_published = Utc::now();
        let e2e_latency = (ts_predict_published - event.ts_ingest).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics.e2e_latency_seconds.observe(e2e_latency);
        tracing::debug!(
            event_id = %event.event_id,
            processing_ms = (ts_predict_published - ts_process_start).num_milliseconds(),
            e2e_latency_sec = e2e_latency,
            "pipeline applied"
        );

        Ok(())
    }

    async fn handle_failure(
        &self,
        shard: &Shard,
        event: &Event,
        error: String,
        pending_acks: &Mutex<HashMap<uuid::Uuid, String>>,
    ) {
        self.metrics.processing_failures_total.inc();
        match self.dlq.record_failure(shard, event, error).await {
            Ok(true) => {
                self.metrics.dead_lettered_total.inc();
                if let Some(entry_id) = pending_acks.lock().await.remove(&event.event_id) {
                    if let Err(e) = self.log.ack(shard, &entry_id).await {
                        tracing::warn!(shard = %shard.key(), error = %e, "ack after dead-lettering failed");
                    }
                }
            }
            Ok(false) => {
                // Retry budget remains; leave the entry un-acked so the log
                // redelivers it.
            }
            Err(e) => {
                tracing::error!(shard = %shard.key(), error = %e, "dlq manager itself failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riftline_bus::InMemoryBus;
    use riftline_sequence::DEFAULT_GAP_THRESHOLD;
    use riftline_shard::DEFAULT_LEASE;
    use riftline_store_redis::memory::InMemoryStore;
    use riftline_types::{EventType, Payload};
    use riftline_writer::spool::SpoolStore;
    use riftline_writer::{AnalyticsClient, DurableWriter, WriteError, WriterConfig};
    use uuid::Uuid;

    struct AlwaysInsert;

    #[async_trait::async_trait]
    impl AnalyticsClient for AlwaysInsert {
        async fn insert(&self, _events: &[Event]) -> Result<(), WriteError> {
            Ok(())
        }
    }

    async fn build_consumer(store: InMemoryStore) -> Arc<StateConsumer> {
        let registry = prometheus::Registry::new();
        let metrics = Arc::new(ConsumerMetrics::new(&registry).unwrap());
        let locks = Arc::new(LockManager::new(
            Arc::new(store.clone()),
            "test-owner".to_string(),
            DEFAULT_LEASE,
        ));
        let sequence = Arc::new(SequenceValidator::new(
            Arc::new(store.clone()),
            DEFAULT_GAP_THRESHOLD,
            Duration::from_millis(2000),
        ));
        let state = Arc::new(StateEngine::new(Arc::new(store.clone())));
        let prediction = Arc::new(PredictionEngine::new(Arc::new(store.clone())));
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolStore::new(dir.path()).await.unwrap();
        let writer = Arc::new(DurableWriter::new(
            WriterConfig::default(),
            Arc::new(AlwaysInsert),
            spool,
        ));
        let dlq = Arc::new(DlqManager::new(Arc::new(store.clone()), Arc::new(store.clone())));
        let bus = Arc::new(InMemoryBus::new(16));

        Arc::new(StateConsumer::new(
            ConsumerConfig {
                discovery_interval: Duration::from_millis(20),
                batch_size: 10,
                block_ms: 0,
                shutdown_timeout: Duration::from_secs(1),
            },
            Arc::new(store.clone()),
            locks,
            sequence,
            state,
            prediction,
            Arc::new(store.clone()),
            writer,
            dlq,
            bus,
            Arc::new(store.clone()),
            metrics,
        ))
    }

    fn event(seq_no: u64, event_type: EventType) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            match_id: "m1".to_string(),
            map_id: "de_dust2".to_string(),
            round_no: 1,
            ts_event: Utc::now(),
            ts_ingest: Utc::now(),
            event_type,
            source: "test".to_string(),
            seq_no,
            payload: Payload::Opaque(serde_json::json!({})),
            trace_id: None,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn in_order_events_are_applied_acked_and_metered() {
        let store = InMemoryStore::new();
        let shard = Shard::new("m1", "de_dust2");
        store.append(&shard, &event(0, EventType::RoundStart)).await.unwrap();
        store.append(&shard, &event(1, EventType::Kill)).await.unwrap();

        let consumer = build_consumer(store.clone()).await;
        let (_tx, rx) = watch::channel(false);

        // Drive one read/process pass directly rather than the full
        // discovery loop, which runs until shutdown.
        consumer.clone().run_shard_once_for_test(shard.clone(), rx).await;

        let state = store.load("m1").await.unwrap().unwrap();
        assert_eq!(state.state_version, 2);
        assert_eq!(state.team_a.kills_total, 0);
    }

    impl StateConsumer {
        /// Test seam: process exactly one `read_group` pass for `shard`
        /// without looping, so tests don't need a long-lived shutdown
        /// handshake to stop the loop.
        async fn run_shard_once_for_test(self: Arc<Self>, shard: Shard, _shutdown: watch::Receiver<bool>) {
            assert!(self.locks.acquire(&shard).await.unwrap());
            let entries = self
                .log
                .read_group(&shard, self.locks.owner_id(), self.config.batch_size, 0)
                .await
                .unwrap();
            let pending_acks = Mutex::new(HashMap::new());
            for entry in entries {
                pending_acks.lock().await.insert(entry.event.event_id, entry.entry_id.clone());
                self.process_entry(&shard, entry, &pending_acks).await;
            }
            let _ = self.locks.release(&shard).await;
        }
    }
}
