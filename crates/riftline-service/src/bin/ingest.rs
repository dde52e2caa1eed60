#![forbid(unsafe_code)]

//! **riftline-ingest** -- the HTTP admission edge (`SPEC_FULL.md` §6).
//!
//! Validates and deduplicates incoming events, appends admitted ones to the
//! durable log, and exposes health, readiness, metrics, and the DLQ admin
//! surface. Does no state-engine or prediction work itself -- that is the
//! consumer process's job once it claims a shard.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use riftline_service::{build_ingest_state, init_logging, shutdown_signal, Config, IngestState};
use riftline_types::{Event, Shard};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();
    init_logging(&config)?;

    info!("starting riftline-ingest v{}", env!("CARGO_PKG_VERSION"));

    let state = build_ingest_state(&config)
        .await
        .context("failed to build ingestion service state")?;

    let app = router(state.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "listening");

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "http server error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    state.shutting_down.store(true, Ordering::SeqCst);
    Ok(())
}

fn router(state: IngestState) -> Router {
    Router::new()
        .route("/events", post(post_event))
        .route("/events/batch", post(post_events_batch))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/admin/dlq/stats", get(dlq_stats))
        .route("/admin/dlq/shards", get(dlq_shards))
        .route("/admin/dlq/:shard/entries", get(dlq_entries))
        .route("/admin/dlq/requeue/:shard", post(dlq_requeue_one))
        .route("/admin/dlq/requeue/:shard/all", post(dlq_requeue_all))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

//-----------------------------
//  Admission
//-----------------------------

const MAX_BATCH_ITEMS: usize = 100;

#[derive(Serialize)]
struct AdmissionResponse {
    success: bool,
    event_id: Uuid,
    trace_id: Uuid,
    stream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<bool>,
    latency_ms: f64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorCode,
}

#[derive(Serialize)]
struct ErrorCode {
    code: &'static str,
}

fn error_response(status: StatusCode, code: &'static str) -> axum::response::Response {
    (status, Json(ErrorBody { error: ErrorCode { code } })).into_response()
}

async fn post_event(State(state): State<IngestState>, body: axum::body::Bytes) -> axum::response::Response {
    if state.shutting_down.load(Ordering::SeqCst) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN");
    }

    match admit_one(&state, &body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(AdmissionError::Validation(code)) => {
            state
                .metrics
                .validation_rejections_total
                .with_label_values(&[code])
                .inc();
            error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        }
        Err(AdmissionError::Append) => {
            state.metrics.append_failures_total.inc();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        }
        Err(AdmissionError::Internal) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum BatchOutcome {
    Ok(AdmissionResponse),
    Err { error: ErrorCode },
}

async fn post_events_batch(State(state): State<IngestState>, body: axum::body::Bytes) -> axum::response::Response {
    if state.shutting_down.load(Ordering::SeqCst) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN");
    }

    let items: Vec<Value> = match serde_json::from_slice(&body) {
        Ok(Value::Array(items)) => items,
        _ => return error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
    };
    if items.len() > MAX_BATCH_ITEMS {
        return error_response(StatusCode::BAD_REQUEST, "BATCH_TOO_LARGE");
    }

    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let raw = serde_json::to_vec(&item).unwrap_or_default();
        let outcome = match admit_one(&state, &raw).await {
            Ok(response) => BatchOutcome::Ok(response),
            Err(AdmissionError::Validation(code)) => {
                state
                    .metrics
                    .validation_rejections_total
                    .with_label_values(&[code])
                    .inc();
                BatchOutcome::Err {
                    error: ErrorCode { code: "VALIDATION_ERROR" },
                }
            }
            Err(AdmissionError::Append) => {
                state.metrics.append_failures_total.inc();
                BatchOutcome::Err {
                    error: ErrorCode { code: "INTERNAL_ERROR" },
                }
            }
            Err(AdmissionError::Internal) => BatchOutcome::Err {
                error: ErrorCode { code: "INTERNAL_ERROR" },
            },
        };
        results.push(outcome);
    }

    (StatusCode::OK, Json(results)).into_response()
}

enum AdmissionError {
    Validation(&'static str),
    Append,
    Internal,
}

async fn admit_one(state: &IngestState, raw: &[u8]) -> Result<AdmissionResponse, AdmissionError> {
    let started = Instant::now();

    let mut event: Event = riftline_schema::validate(raw).map_err(|e| AdmissionError::Validation(e.code()))?;

    if event.trace_id.is_none() {
        event.trace_id = Some(Uuid::new_v4());
    }
    let trace_id = event.trace_id.expect("stamped above");

    let duplicate = state
        .dedup
        .check_and_mark(event.event_id, &event.match_id)
        .await
        .map_err(|_| AdmissionError::Internal)?;

    if duplicate {
        state.metrics.events_admitted_total.with_label_values(&["true"]).inc();
        return Ok(AdmissionResponse {
            success: true,
            event_id: event.event_id,
            trace_id,
            stream_id: String::new(),
            duplicate: Some(true),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
    }

    let shard: Shard = event.shard();
    let stream_id = state
        .storage
        .log
        .append(&shard, &event)
        .await
        .map_err(|_| AdmissionError::Append)?;

    state.metrics.events_admitted_total.with_label_values(&["false"]).inc();
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.metrics.admission_latency_seconds.observe(latency_ms / 1000.0);

    Ok(AdmissionResponse {
        success: true,
        event_id: event.event_id,
        trace_id,
        stream_id,
        duplicate: None,
        latency_ms,
    })
}

//-----------------------------
//  Health, readiness, metrics
//-----------------------------

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<IngestState>) -> StatusCode {
    if state.storage.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<IngestState>) -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = state.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

//-----------------------------
//  DLQ admin surface
//-----------------------------

fn parse_shard(key: &str) -> Option<Shard> {
    let (match_id, map_id) = key.split_once(':')?;
    Some(Shard::new(match_id, map_id))
}

#[derive(Deserialize)]
struct EntriesQuery {
    limit: Option<usize>,
}

async fn dlq_stats(State(state): State<IngestState>) -> axum::response::Response {
    match state.dlq.stats().await {
        Ok(stats) => Json(json!({
            "shards_with_entries": stats.shards_with_entries,
            "events_in_retry": stats.events_in_retry,
        }))
        .into_response(),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

async fn dlq_shards(State(state): State<IngestState>) -> axum::response::Response {
    match state.dlq.dlq_shards().await {
        Ok(shards) => Json(shards.iter().map(Shard::key).collect::<Vec<_>>()).into_response(),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

async fn dlq_entries(
    State(state): State<IngestState>,
    Path(shard_key): Path<String>,
    Query(query): Query<EntriesQuery>,
) -> axum::response::Response {
    let Some(shard) = parse_shard(&shard_key) else {
        return error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR");
    };
    match state.dlq.dlq_entries(&shard, query.limit.unwrap_or(50)).await {
        Ok(entries) => Json(entries).into_response(),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

async fn dlq_requeue_one(State(state): State<IngestState>, Path(shard_key): Path<String>) -> axum::response::Response {
    let Some(shard) = parse_shard(&shard_key) else {
        return error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR");
    };
    match state.dlq.requeue_one(&shard).await {
        Ok(Some(entry_id)) => Json(json!({ "requeued": true, "stream_id": entry_id })).into_response(),
        Ok(None) => Json(json!({ "requeued": false })).into_response(),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

async fn dlq_requeue_all(State(state): State<IngestState>, Path(shard_key): Path<String>) -> axum::response::Response {
    let Some(shard) = parse_shard(&shard_key) else {
        return error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR");
    };
    match state.dlq.requeue_all(&shard).await {
        Ok(count) => Json(json!({ "requeued_count": count })).into_response(),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_shard_splits_on_first_colon() {
        let shard = parse_shard("match-123:de_dust2").expect("valid shard key");
        assert_eq!(shard.key(), "match-123:de_dust2");
    }

    #[test]
    fn parse_shard_rejects_keys_without_a_colon() {
        assert!(parse_shard("match-123").is_none());
    }

    #[test]
    fn parse_shard_keeps_only_the_first_colon_as_the_split_point() {
        let shard = parse_shard("match:123:de_dust2:extra").expect("valid shard key");
        assert_eq!(shard.key(), "match:123:de_dust2:extra");
    }
}
