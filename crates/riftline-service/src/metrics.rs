//! Prometheus instrumentation for the ingestion HTTP edge, registered into
//! the same registry the `/metrics` route serves.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Counters and a latency histogram for the admission path.
pub struct IngestMetrics {
    /// Events accepted, by whether admission found them a duplicate.
    pub events_admitted_total: IntCounterVec,
    /// Requests rejected at validation, labeled by error code.
    pub validation_rejections_total: IntCounterVec,
    /// Requests that failed to append to the durable log.
    pub append_failures_total: IntCounter,
    /// End-to-end admission latency, in seconds.
    pub admission_latency_seconds: Histogram,
}

impl IngestMetrics {
    /// Build and register the ingestion path's metrics in `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let events_admitted_total = IntCounterVec::new(
            Opts::new(
                "ingest_events_admitted_total",
                "Events that passed validation, labeled by duplicate status.",
            ),
            &["duplicate"],
        )?;
        let validation_rejections_total = IntCounterVec::new(
            Opts::new(
                "ingest_validation_rejections_total",
                "Events rejected at admission, labeled by error code.",
            ),
            &["code"],
        )?;
        let append_failures_total = IntCounter::with_opts(Opts::new(
            "ingest_append_failures_total",
            "Admitted events whose log append failed.",
        ))?;
        let admission_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "ingest_admission_latency_seconds",
            "Seconds from request receipt to the admission response.",
        ))?;

        registry.register(Box::new(events_admitted_total.clone()))?;
        registry.register(Box::new(validation_rejections_total.clone()))?;
        registry.register(Box::new(append_failures_total.clone()))?;
        registry.register(Box::new(admission_latency_seconds.clone()))?;

        Ok(Self {
            events_admitted_total,
            validation_rejections_total,
            append_failures_total,
            admission_latency_seconds,
        })
    }
}
