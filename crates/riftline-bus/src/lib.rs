#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-bus** -- in-process event bus for match-state and prediction
//! updates.
//!
//! This crate provides the fundamental event bus trait and an in-memory
//! broadcast implementation used by the HTTP service to fan a shard's
//! updates out to whatever is currently attached to it (long-poll or
//! streaming clients). It carries no persistence or cross-process delivery
//! on its own -- [`publish_dual`] bridges a publish onto a
//! `riftline_store_core::Publisher` (Redis `PUBLISH`) for consumers in other
//! processes.

use std::sync::Arc;

use anyhow::Result;
use riftline_store_core::{match_update_channel, prediction_update_channel, Publisher};
use riftline_types::{MatchState, Prediction};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A single fanout-worthy update, wrapping the two kinds of deltas the
/// pipeline produces as it processes a shard's events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub enum BusEvent {
    /// A match's aggregate state changed.
    MatchUpdated {
        /// The match that changed.
        match_id: String,
        /// The new snapshot.
        state: MatchState,
    },
    /// A new win-probability estimate was computed.
    PredictionUpdated {
        /// The match the prediction applies to.
        match_id: String,
        /// The new prediction.
        prediction: Prediction,
    },
}

impl BusEvent {
    /// The match this update applies to, regardless of variant.
    pub fn match_id(&self) -> &str {
        match self {
            BusEvent::MatchUpdated { match_id, .. } => match_id,
            BusEvent::PredictionUpdated { match_id, .. } => match_id,
        }
    }
}

/// In-process publish-subscribe abstraction for [`BusEvent`].
///
/// Implementations must be thread-safe and support multiple subscribers;
/// a slow or absent subscriber must never block a publisher.
pub trait EventBus: Send + Sync {
    /// Publish an update to all current subscribers. Never blocks; a full
    /// ring buffer drops the oldest event rather than backpressuring.
    fn publish(&self, event: &BusEvent) -> Result<()>;

    /// Subscribe to the live update stream. The receiver only observes
    /// events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// Broadcast-channel-backed [`EventBus`] with a bounded ring buffer.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<BusEvent>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Build a bus whose ring buffer holds up to `capacity` events before
    /// the slowest subscriber starts missing them.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: &BusEvent) -> Result<()> {
        // A send error just means there are no subscribers right now.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

/// Errors raised while bridging a [`BusEvent`] onto a durable
/// [`Publisher`].
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The event could not be bridged onto the cross-process publisher.
    #[error("failed to forward event to durable publisher: {0}")]
    ForwardFailed(String),
}

/// Publish `event` to the local bus and forward it onto `publisher`'s
/// matching Redis channel, so both in-process listeners and other
/// processes observe the same update.
pub async fn publish_dual(
    bus: &dyn EventBus,
    publisher: &dyn Publisher,
    event: BusEvent,
) -> std::result::Result<(), BusError> {
    bus.publish(&event)
        .map_err(|e| BusError::ForwardFailed(e.to_string()))?;

    let (channel, message) = match &event {
        BusEvent::MatchUpdated { match_id, state } => (
            match_update_channel(match_id),
            serde_json::to_value(state).map_err(|e| BusError::ForwardFailed(e.to_string()))?,
        ),
        BusEvent::PredictionUpdated {
            match_id,
            prediction,
        } => (
            prediction_update_channel(match_id),
            serde_json::to_value(prediction)
                .map_err(|e| BusError::ForwardFailed(e.to_string()))?,
        ),
    };

    publisher
        .publish(&channel, &message)
        .await
        .map_err(|e| BusError::ForwardFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riftline_store_core::StoreError;
    use uuid::Uuid;

    struct NoopPublisher;

    #[async_trait::async_trait]
    impl Publisher for NoopPublisher {
        async fn publish(
            &self,
            _channel: &str,
            _message: &serde_json::Value,
        ) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    fn sample_state() -> MatchState {
        MatchState::new("m1", Uuid::new_v4(), Utc::now())
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = InMemoryBus::new(16);
        let mut rx = bus.subscribe();

        let event = BusEvent::MatchUpdated {
            match_id: "m1".to_string(),
            state: sample_state(),
        };
        bus.publish(&event).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = InMemoryBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = BusEvent::MatchUpdated {
            match_id: "m1".to_string(),
            state: sample_state(),
        };
        bus.publish(&event).unwrap();

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publish_dual_forwards_to_durable_publisher() {
        let bus = InMemoryBus::new(16);
        let publisher = NoopPublisher;
        let event = BusEvent::MatchUpdated {
            match_id: "m1".to_string(),
            state: sample_state(),
        };
        publish_dual(&bus, &publisher, event).await.unwrap();
    }
}
