//! Prometheus instrumentation for the consumer loop, registered the same
//! way the orchestration service exposes its own `/metrics` route.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

/// Number of coarse-grained buckets shards are hashed into for the
/// per-bucket active-shard gauge, via [`riftline_types::Shard::bucket`].
/// Small and fixed so the label stays low-cardinality regardless of how
/// many distinct matches are in flight.
pub const SHARD_METRIC_BUCKETS: u32 = 16;

/// Counters, gauges, and histograms the consumer loop updates per entry.
pub struct ConsumerMetrics {
    /// Total events successfully applied and acked.
    pub events_processed_total: IntCounter,
    /// Total events that failed processing and were routed to the DLQ path.
    pub processing_failures_total: IntCounter,
    /// Total events moved to the dead-letter queue after exhausting retries.
    pub dead_lettered_total: IntCounter,
    /// Shards this process currently holds the lock for.
    pub active_shards: IntGauge,
    /// Active shards, labeled by `Shard::bucket(SHARD_METRIC_BUCKETS)` --
    /// a coarse view of load distribution across the hash space.
    pub active_shards_by_bucket: IntGaugeVec,
    /// End-to-end latency from ingest to published prediction, in seconds.
    pub e2e_latency_seconds: Histogram,
}

impl ConsumerMetrics {
    /// Build and register the consumer's metrics in `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let events_processed_total = IntCounter::with_opts(Opts::new(
            "state_consumer_events_processed_total",
            "Events successfully applied and acked by the state consumer.",
        ))?;
        let processing_failures_total = IntCounter::with_opts(Opts::new(
            "state_consumer_processing_failures_total",
            "Events whose pipeline application raised an error.",
        ))?;
        let dead_lettered_total = IntCounter::with_opts(Opts::new(
            "state_consumer_dead_lettered_total",
            "Events moved to the dead-letter queue after exhausting retries.",
        ))?;
        let active_shards = IntGauge::with_opts(Opts::new(
            "state_consumer_active_shards",
            "Shards this process currently holds the lock for.",
        ))?;
        let active_shards_by_bucket = IntGaugeVec::new(
            Opts::new(
                "state_consumer_active_shards_by_bucket",
                "Active shards, bucketed by the shard key's CRC32 hash.",
            ),
            &["bucket"],
        )?;
        let e2e_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "state_consumer_e2e_latency_seconds",
            "Seconds from ts_ingest to the published prediction update.",
        ))?;

        registry.register(Box::new(events_processed_total.clone()))?;
        registry.register(Box::new(processing_failures_total.clone()))?;
        registry.register(Box::new(dead_lettered_total.clone()))?;
        registry.register(Box::new(active_shards.clone()))?;
        registry.register(Box::new(active_shards_by_bucket.clone()))?;
        registry.register(Box::new(e2e_latency_seconds.clone()))?;

        Ok(Self {
            events_processed_total,
            processing_failures_total,
            dead_lettered_total,
            active_shards,
            active_shards_by_bucket,
            e2e_latency_seconds,
        })
    }
}
