#![forbid(unsafe_code)]

//! **riftline-consumer-process** -- runs [`riftline_consumer::StateConsumer`]
//! until asked to stop, then drains the durable writer and releases every
//! shard lock before exiting.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use riftline_service::{build_consumer, init_logging, shutdown_signal, Config, Storage};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();
    init_logging(&config)?;

    info!("starting riftline-consumer v{}", env!("CARGO_PKG_VERSION"));

    let storage = Storage::build(&config).await.context("failed to build storage backend")?;
    let registry = Arc::new(prometheus::Registry::new());
    let handles = build_consumer(&config, &storage, &registry)
        .await
        .context("failed to build the state consumer")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let writer_shutdown = shutdown_rx.clone();
    let writer_handle = tokio::spawn(handles.writer.clone().run(writer_shutdown));
    let run_handle = tokio::spawn(handles.consumer.clone().run(shutdown_rx.clone()));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "metrics listening");
    let metrics_app = Router::new().route("/metrics", get(metrics)).with_state(registry);
    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_handle = tokio::spawn(async move {
        let server = axum::serve(listener, metrics_app);
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!(error = %e, "metrics http server error");
                }
            }
            _ = metrics_shutdown.changed() => {}
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    shutdown_tx.send(true).ok();

    let shutdown_timeout = std::time::Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, run_handle).await.is_err() {
        tracing::warn!("consumer did not shut down within the timeout, exiting anyway");
    }

    if tokio::time::timeout(shutdown_timeout, writer_handle).await.is_err() {
        tracing::warn!("writer did not finish draining within the timeout");
    }

    if tokio::time::timeout(shutdown_timeout, metrics_handle).await.is_err() {
        tracing::warn!("metrics server did not shut down within the timeout");
    }

    info!("riftline-consumer stopped");
    Ok(())
}

async fn metrics(State(registry): State<Arc<prometheus::Registry>>) -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}
