#![forbid(unsafe_code)]

//! **riftline-service** -- process wiring for the two binaries that make up
//! a Riftline deployment: the HTTP ingestion edge (`bin/ingest.rs`) and the
//! state-consumer process (`bin/consumer.rs`).
//!
//! Neither binary carries its own construction logic. Everything that both
//! share -- config parsing, picking a storage backend, building the chain
//! of engines the pipeline is assembled from -- lives here, mirroring how
//! the orchestration service in this codebase's lineage keeps its `Cli` and
//! service-state wiring in one place a `main.rs` just calls into.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use riftline_bus::{EventBus, InMemoryBus};
use riftline_consumer::{ConsumerConfig, ConsumerMetrics, StateConsumer};
use riftline_dedup::{DedupMode, DedupService};
use riftline_dlq::DlqManager;
use riftline_prediction::PredictionEngine;
use riftline_sequence::SequenceValidator;
use riftline_shard::{generate_consumer_id, LockManager};
use riftline_state::StateEngine;
use riftline_store_core::{
    DedupStore, DlqStore, DurableLog, LockStore, MatchStateStore, PredictionStore, Publisher,
    SequenceStore,
};
use riftline_store_redis::{memory::InMemoryStore, RedisStore};
use riftline_writer::http::HttpAnalyticsClient;
use riftline_writer::spool::SpoolStore;
use riftline_writer::{AnalyticsClient, DurableWriter, WriterConfig};

pub mod metrics;

/// Process-wide configuration, parsed from CLI flags with environment
/// fallbacks -- the authoritative env var set (`SPEC_FULL.md` §6) plus the
/// ambient tuning knobs that aren't producer-facing.
#[derive(Parser, Debug, Clone)]
#[command(name = "riftline", about = "Riftline real-time ingest-and-score pipeline")]
pub struct Config {
    /// HTTP listen port for the ingestion service.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// HTTP listen host for the ingestion service.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Redis-compatible URL for the durable log and all other storage
    /// concerns. When unset, the process falls back to an in-memory store
    /// -- fine for local development, never for a real deployment.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Base URL of the analytics sink (ClickHouse HTTP interface or
    /// equivalent bulk-insert endpoint).
    #[arg(long, env = "CLICKHOUSE_URL")]
    pub clickhouse_url: Option<String>,

    /// Database name passed to the analytics sink as a query parameter.
    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "riftline")]
    pub clickhouse_database: String,

    /// Durable writer flush threshold, in buffered events.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 500)]
    pub batch_size: usize,

    /// Durable writer flush interval, in milliseconds.
    #[arg(long, env = "BATCH_FLUSH_INTERVAL", default_value_t = 1000)]
    pub batch_flush_interval_ms: u64,

    /// Entries pulled per consumer `read_group` call.
    #[arg(long, env = "CONSUMER_BATCH_SIZE", default_value_t = 50)]
    pub consumer_batch_size: usize,

    /// Blocking duration for the consumer's `read_group` call.
    #[arg(long, env = "CONSUMER_BLOCK_MS", default_value_t = 2000)]
    pub consumer_block_ms: u64,

    /// How often the consumer re-scans for newly pending shards.
    #[arg(long, env = "DISCOVERY_INTERVAL_MS", default_value_t = 5000)]
    pub discovery_interval_ms: u64,

    /// TTL, in seconds, of the per-match dedup set.
    #[arg(long, env = "DEDUP_TTL", default_value_t = 7200)]
    pub dedup_ttl_sec: u64,

    /// Log level understood by the tracing `EnvFilter` (overridden by
    /// `RUST_LOG` if that is also set).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Sequence gap tolerated before a shard's reorder buffer gives up and
    /// advances past a hole.
    #[arg(long, env = "GAP_THRESHOLD", default_value_t = 10)]
    pub gap_threshold: u64,

    /// Events older than this, relative to the shard's last-seen sequence,
    /// are dropped instead of buffered.
    #[arg(long, env = "MAX_LATENESS_MS", default_value_t = 2_000)]
    pub max_lateness_ms: u64,

    /// Shard lock lease duration, in milliseconds.
    #[arg(long, env = "LOCK_LEASE_MS", default_value_t = 30_000)]
    pub lock_lease_ms: u64,

    /// Failures tolerated before an event is dead-lettered.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Directory the durable writer spools overflow batches to on disk.
    #[arg(long, env = "SPOOL_DIR", default_value = "./spool")]
    pub spool_dir: String,
}

impl Config {
    /// The effective log filter: `RUST_LOG` wins over `LOG_LEVEL` when set,
    /// matching the precedence `tracing_subscriber::EnvFilter` itself gives
    /// an explicit directive over a library default.
    pub fn log_filter(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.log_level.clone())
    }
}

/// Initialize the global tracing subscriber. Mirrors the workspace's
/// `init_logging` shape: an `EnvFilter` plus the default fmt layer.
pub fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_filter()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Every storage-backed trait object the pipeline needs, plus a readiness
/// probe, behind whichever concrete backend was selected. Hand-rolled
/// instead of making the two backends implement every trait on one shared
/// object, since `InMemoryStore` and `RedisStore` each already satisfy the
/// full `riftline-store-core` surface independently.
#[derive(Clone)]
pub struct Storage {
    pub log: Arc<dyn DurableLog>,
    pub locks: Arc<dyn LockStore>,
    pub dedup: Arc<dyn DedupStore>,
    pub sequence: Arc<dyn SequenceStore>,
    pub match_state: Arc<dyn MatchStateStore>,
    pub prediction: Arc<dyn PredictionStore>,
    pub dlq: Arc<dyn DlqStore>,
    pub publisher: Arc<dyn Publisher>,
    ready: Arc<dyn Fn() -> ReadyFuture + Send + Sync>,
}

type ReadyFuture = std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>;

impl Storage {
    /// Connect to Redis if `redis_url` is configured, otherwise fall back to
    /// the in-memory test double for local development.
    pub async fn build(config: &Config) -> Result<Self> {
        match &config.redis_url {
            Some(url) => {
                let store = Arc::new(
                    RedisStore::connect(url, Duration::from_secs(config.dedup_ttl_sec))
                        .await
                        .with_context(|| format!("failed to connect to Redis at {url}"))?,
                );
                Ok(Self::from_redis(store))
            }
            None => {
                tracing::warn!("REDIS_URL not set, falling back to an in-memory store");
                Ok(Self::from_memory(Arc::new(InMemoryStore::new())))
            }
        }
    }

    fn from_redis(store: Arc<RedisStore>) -> Self {
        let ready_store = store.clone();
        Self {
            log: store.clone(),
            locks: store.clone(),
            dedup: store.clone(),
            sequence: store.clone(),
            match_state: store.clone(),
            prediction: store.clone(),
            dlq: store.clone(),
            publisher: store.clone(),
            ready: Arc::new(move || {
                let store = ready_store.clone();
                Box::pin(async move { store.ping().await.is_ok() })
            }),
        }
    }

    fn from_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            log: store.clone(),
            locks: store.clone(),
            dedup: store.clone(),
            sequence: store.clone(),
            match_state: store.clone(),
            prediction: store.clone(),
            dlq: store.clone(),
            publisher: store.clone(),
            ready: Arc::new(|| Box::pin(async { true })),
        }
    }

    /// Whether the underlying log is currently reachable, for `/readyz`.
    pub async fn is_ready(&self) -> bool {
        (self.ready)().await
    }
}

/// Everything the ingestion HTTP handlers close over.
#[derive(Clone)]
pub struct IngestState {
    pub storage: Storage,
    pub dedup: Arc<DedupService>,
    pub bus: Arc<dyn EventBus>,
    pub dlq: Arc<DlqManager>,
    pub metrics: Arc<metrics::IngestMetrics>,
    pub registry: Arc<prometheus::Registry>,
    pub shutting_down: Arc<std::sync::atomic::AtomicBool>,
}

/// Build the shared state the ingestion binary's router closes over.
pub async fn build_ingest_state(config: &Config) -> Result<IngestState> {
    let storage = Storage::build(config).await?;
    let dedup = Arc::new(DedupService::new(storage.dedup.clone(), DedupMode::PerMatch));
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(1024));
    let dlq = Arc::new(DlqManager::new(storage.dlq.clone(), storage.log.clone()).with_max_retries(config.max_retries));
    let registry = Arc::new(prometheus::Registry::new());
    let metrics = Arc::new(metrics::IngestMetrics::new(&registry).context("failed to register ingest metrics")?);

    Ok(IngestState {
        storage,
        dedup,
        bus,
        dlq,
        metrics,
        registry,
        shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    })
}

/// A fully-wired consumer plus the durable writer it shares -- the writer
/// runs its own periodic-flush loop independently of the consumer's shard
/// tasks, so the binary needs a handle to both.
pub struct ConsumerHandles {
    pub consumer: Arc<StateConsumer>,
    pub writer: Arc<DurableWriter>,
}

/// Build a fully-wired [`StateConsumer`] from `config` and `storage`.
pub async fn build_consumer(config: &Config, storage: &Storage, registry: &prometheus::Registry) -> Result<ConsumerHandles> {
    let consumer_config = ConsumerConfig {
        discovery_interval: Duration::from_millis(config.discovery_interval_ms),
        batch_size: config.consumer_batch_size,
        block_ms: config.consumer_block_ms,
        shutdown_timeout: Duration::from_secs(30),
    };

    let owner_id = generate_consumer_id();
    let locks = Arc::new(LockManager::new(
        storage.locks.clone(),
        owner_id,
        Duration::from_millis(config.lock_lease_ms),
    ));
    let sequence = Arc::new(SequenceValidator::new(
        storage.sequence.clone(),
        config.gap_threshold,
        Duration::from_millis(config.max_lateness_ms),
    ));
    let state = Arc::new(StateEngine::new(storage.match_state.clone()));
    let prediction = Arc::new(PredictionEngine::new(storage.prediction.clone()));

    let spool = SpoolStore::new(config.spool_dir.clone())
        .await
        .context("failed to open the writer's spool directory")?;
    let client: Arc<dyn AnalyticsClient> = match &config.clickhouse_url {
        Some(url) => Arc::new(HttpAnalyticsClient::new(format!(
            "{url}/?database={}",
            config.clickhouse_database
        ))),
        None => {
            tracing::warn!("CLICKHOUSE_URL not set, analytics writes will spool indefinitely");
            Arc::new(HttpAnalyticsClient::new(String::new()))
        }
    };
    let writer_config = WriterConfig {
        flush_count: config.batch_size,
        flush_interval: Duration::from_millis(config.batch_flush_interval_ms),
        ..WriterConfig::default()
    };
    let writer = Arc::new(DurableWriter::new(writer_config, client, spool));

    let dlq = Arc::new(DlqManager::new(storage.dlq.clone(), storage.log.clone()).with_max_retries(config.max_retries));
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(1024));
    let consumer_metrics = Arc::new(ConsumerMetrics::new(registry).context("failed to register consumer metrics")?);

    let consumer = Arc::new(StateConsumer::new(
        consumer_config,
        storage.log.clone(),
        locks,
        sequence,
        state,
        prediction,
        storage.prediction.clone(),
        writer.clone(),
        dlq,
        bus,
        storage.publisher.clone(),
        consumer_metrics,
    ));

    Ok(ConsumerHandles { consumer, writer })
}

/// Await Ctrl+C or SIGTERM, whichever comes first. Identical in shape to the
/// rest of this codebase's service binaries.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(spool_dir: &std::path::Path) -> Config {
        Config {
            port: 8080,
            host: "0.0.0.0".to_string(),
            redis_url: None,
            clickhouse_url: None,
            clickhouse_database: "riftline".to_string(),
            batch_size: 500,
            batch_flush_interval_ms: 1000,
            consumer_batch_size: 50,
            consumer_block_ms: 2000,
            discovery_interval_ms: 5000,
            dedup_ttl_sec: 7200,
            log_level: "info".to_string(),
            gap_threshold: 10,
            max_lateness_ms: 2_000,
            lock_lease_ms: 30_000,
            max_retries: 3,
            spool_dir: spool_dir.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn log_filter_prefers_rust_log_over_log_level() {
        let spool = tempfile::tempdir().unwrap();
        let mut config = test_config(spool.path());
        config.log_level = "info".to_string();

        std::env::set_var("RUST_LOG", "debug");
        assert_eq!(config.log_filter(), "debug");
        std::env::remove_var("RUST_LOG");

        assert_eq!(config.log_filter(), "info");
    }

    #[tokio::test]
    async fn storage_falls_back_to_in_memory_without_redis_url() {
        let spool = tempfile::tempdir().unwrap();
        let config = test_config(spool.path());

        let storage = Storage::build(&config).await.expect("in-memory build never fails");
        assert!(storage.is_ready().await);
    }

    #[tokio::test]
    async fn build_ingest_state_wires_a_usable_pipeline() {
        let spool = tempfile::tempdir().unwrap();
        let config = test_config(spool.path());

        let state = build_ingest_state(&config).await.expect("ingest state should build");
        assert!(state.storage.is_ready().await);
        assert!(!state.shutting_down.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn build_consumer_wires_a_usable_pipeline() {
        let spool = tempfile::tempdir().unwrap();
        let config = test_config(spool.path());

        let storage = Storage::build(&config).await.expect("in-memory build never fails");
        let registry = prometheus::Registry::new();
        let handles = build_consumer(&config, &storage, &registry)
            .await
            .expect("consumer should build against an in-memory backend");

        assert!(Arc::strong_count(&handles.consumer) >= 1);
        assert!(Arc::strong_count(&handles.writer) >= 1);
    }
}
