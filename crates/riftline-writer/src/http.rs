//! The production [`AnalyticsClient`](crate::AnalyticsClient): a bulk-insert
//! HTTP call to the Analytics Store, with a soft per-attempt timeout.

use std::time::Duration;

use riftline_types::Event;

use crate::{AnalyticsClient, WriteError};

/// Soft timeout for a single insert attempt before it counts as a failure.
pub const DEFAULT_INSERT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk-inserts events into the Analytics Store over HTTP.
pub struct HttpAnalyticsClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpAnalyticsClient {
    /// Build a client posting batches to `endpoint` (e.g. a ClickHouse or
    /// analytics-gateway bulk-insert URL).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout: DEFAULT_INSERT_TIMEOUT,
        }
    }

    /// Override the per-attempt soft timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl AnalyticsClient for HttpAnalyticsClient {
    async fn insert(&self, events: &[Event]) -> Result<(), WriteError> {
        let request = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(events)
            .send();

        let response = request
            .await
            .map_err(|e| WriteError::InsertFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WriteError::InsertFailed(format!(
                "analytics store returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
