#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-state** -- the pure event-to-state reducer and the service
//! that wires it to durable storage (§4.6).
//!
//! [`reducer::apply`] is the whole of the system's business logic for
//! turning an event into a new match snapshot: a deterministic function with
//! no I/O. [`StateEngine`] is the thin shell around it the consumer actually
//! calls -- load-or-create, apply, persist. Keeping the two separate is what
//! lets `apply` be property-tested in isolation (L1, L2, P3) without a store.

use std::sync::Arc;

use riftline_store_core::{MatchStateStore, Result};
use riftline_types::{Event, MatchState};

pub mod reducer;

pub use reducer::apply;

/// Loads, applies, and persists match state on behalf of the consumer loop.
///
/// The state store is the single owner of a match's snapshot; this engine
/// never races itself because the shard lock manager guarantees only one
/// consumer processes a given match's events at a time.
pub struct StateEngine {
    store: Arc<dyn MatchStateStore>,
}

impl StateEngine {
    /// Build an engine persisting through `store`.
    pub fn new(store: Arc<dyn MatchStateStore>) -> Self {
        Self { store }
    }

    /// Apply `event` to the match's current snapshot (creating one if this is
    /// the first event ever observed for the match), persist the result, and
    /// return it.
    pub async fn apply_event(&self, event: &Event) -> Result<MatchState> {
        let base = match self.store.load(&event.match_id).await? {
            Some(existing) => existing,
            None => MatchState::new(event.match_id.clone(), event.event_id, event.ts_ingest),
        };
        let next = reducer::apply(&base, event);
        self.store.save(&next).await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use riftline_types::{EventType, Payload};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeStateStore {
        states: Mutex<HashMap<String, MatchState>>,
    }

    #[async_trait]
    impl MatchStateStore for FakeStateStore {
        async fn load(&self, match_id: &str) -> Result<Option<MatchState>> {
            Ok(self.states.lock().unwrap().get(match_id).cloned())
        }

        async fn save(&self, state: &MatchState) -> Result<()> {
            self.states
                .lock()
                .unwrap()
                .insert(state.match_id.clone(), state.clone());
            Ok(())
        }
    }

    fn kill_event(match_id: &str, seq_no: u64) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            match_id: match_id.to_string(),
            map_id: "de_dust2".to_string(),
            round_no: 1,
            ts_event: Utc::now(),
            ts_ingest: Utc::now(),
            event_type: EventType::Death,
            source: "test".to_string(),
            seq_no,
            payload: Payload::Opaque(serde_json::json!({})),
            trace_id: None,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn first_event_creates_state_and_persists_it() {
        let engine = StateEngine::new(Arc::new(FakeStateStore::default()));
        let state = engine.apply_event(&kill_event("m1", 1)).await.unwrap();
        assert_eq!(state.match_id, "m1");
        assert_eq!(state.state_version, 1);
    }

    #[tokio::test]
    async fn subsequent_events_load_and_advance_the_same_state() {
        let engine = StateEngine::new(Arc::new(FakeStateStore::default()));
        engine.apply_event(&kill_event("m1", 1)).await.unwrap();
        let state = engine.apply_event(&kill_event("m1", 2)).await.unwrap();
        assert_eq!(state.state_version, 2);
    }
}
