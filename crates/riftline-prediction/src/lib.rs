#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-prediction** -- the deterministic rule-based win-probability
//! scorer, with swing damping and circuit-breaker fallback to the last
//! known-good estimate (§4.7).
//!
//! The engine only ever runs for the trigger event types named in
//! [`riftline_types::EventType::is_prediction_trigger`]; callers are expected
//! to check that before invoking [`PredictionEngine::predict`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use riftline_store_core::PredictionStore;
use riftline_types::{Event, MatchState, Prediction};
use thiserror::Error;

pub mod features;

const MODEL_VERSION: &str = "rule-based-v1";

/// Errors raised computing or persisting a prediction.
#[derive(Debug, Error)]
pub enum PredictionError {
    /// The underlying store failed.
    #[error("prediction store error: {0}")]
    Store(#[from] riftline_store_core::StoreError),
    /// The scorer failed and no previous prediction existed to fall back to.
    #[error("scoring failed with no prior prediction to fall back on")]
    NoFallback,
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, PredictionError>;

/// Computes and caches win-probability predictions for matches.
pub struct PredictionEngine {
    store: Arc<dyn PredictionStore>,
}

impl PredictionEngine {
    /// Build an engine backed by `store` for reading the previous prediction.
    pub fn new(store: Arc<dyn PredictionStore>) -> Self {
        Self { store }
    }

    /// Compute the prediction for `state` triggered by `event`, damped
    /// against the previous prediction for the match if one exists.
    ///
    /// This does not persist the result; the caller (the consumer loop) owns
    /// writing the cache key and publishing the update, per the contract.
    pub async fn predict(&self, state: &MatchState, event: &Event) -> Result<Prediction> {
        let prev = self.store.load_latest(&state.match_id).await?;

        let scored = catch_unwind(AssertUnwindSafe(|| score(state)));

        let (p_team_a_win, confidence) = match scored {
            Ok((p, c)) => {
                let damped = match &prev {
                    Some(prev) => damp(p, prev.p_team_a_win, age_seconds(prev, event)),
                    None => p,
                };
                (damped, c)
            }
            Err(_) => match &prev {
                Some(prev) => {
                    tracing::warn!(match_id = %state.match_id, "scorer panicked, falling back to last known-good prediction");
                    (prev.p_team_a_win, 0.1)
                }
                None => return Err(PredictionError::NoFallback),
            },
        };

        let p_a = round4(p_team_a_win);
        let p_b = round4(1.0 - p_team_a_win);

        Ok(Prediction {
            match_id: state.match_id.clone(),
            p_team_a_win: p_a,
            p_team_b_win: p_b,
            confidence: round4(confidence),
            model_version: MODEL_VERSION.to_string(),
            trigger_event_id: event.event_id,
            trigger_event_type: event.event_type.clone(),
            ts_calc: Utc::now(),
            state_version: state.state_version,
        })
    }
}

fn age_seconds(prev: &Prediction, event: &Event) -> f64 {
    (event.ts_event - prev.ts_calc).num_milliseconds() as f64 / 1000.0
}

fn score(state: &MatchState) -> (f64, f64) {
    let f = features::extract(state);
    let p = features::raw_score(&f);
    let c = features::confidence(&f, state.team_a.alive_count, state.team_b.alive_count);
    (p, c)
}

/// Clamp a proposed move away from `p_prev` to the maximum allowed swing for
/// `age_sec` seconds of elapsed time (§4.7).
fn damp(p: f64, p_prev: f64, age_sec: f64) -> f64 {
    let max_move = 0.20 + age_sec.max(0.0) * 0.05;
    let delta = p - p_prev;
    if delta.abs() > max_move {
        p_prev + delta.signum() * max_move
    } else {
        p
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use riftline_store_core::Result as StoreResult;
    use riftline_types::{EventType, Payload};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakePredictionStore {
        latest: Mutex<Option<Prediction>>,
    }

    #[async_trait]
    impl PredictionStore for FakePredictionStore {
        async fn load_latest(&self, _match_id: &str) -> StoreResult<Option<Prediction>> {
            Ok(self.latest.lock().unwrap().clone())
        }

        async fn save_latest(&self, prediction: &Prediction) -> StoreResult<()> {
            *self.latest.lock().unwrap() = Some(prediction.clone());
            Ok(())
        }
    }

    fn state() -> MatchState {
        MatchState::new("m1", Uuid::new_v4(), Utc::now())
    }

    fn event_at(event_type: EventType, ts_event: chrono::DateTime<Utc>) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            match_id: "m1".to_string(),
            map_id: "de_dust2".to_string(),
            round_no: 1,
            ts_event,
            ts_ingest: ts_event,
            event_type,
            source: "test".to_string(),
            seq_no: 1,
            payload: Payload::Opaque(serde_json::json!({})),
            trace_id: None,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn first_prediction_has_no_prior_to_damp_against() {
        let engine = PredictionEngine::new(Arc::new(FakePredictionStore::default()));
        let pred = engine
            .predict(&state(), &event_at(EventType::RoundStart, Utc::now()))
            .await
            .unwrap();
        assert_eq!(pred.p_team_a_win, 0.5);
        assert_eq!(pred.p_team_b_win, 0.5);
    }

    #[tokio::test]
    async fn probabilities_sum_to_one_after_rounding() {
        let engine = PredictionEngine::new(Arc::new(FakePredictionStore::default()));
        let mut s = state();
        s.team_a.alive_count = 5;
        s.team_b.alive_count = 1;
        let pred = engine
            .predict(&s, &event_at(EventType::Kill, Utc::now()))
            .await
            .unwrap();
        assert!((pred.p_team_a_win + pred.p_team_b_win - 1.0).abs() < 1e-9);
        assert!((0.05..=0.95).contains(&pred.p_team_a_win));
    }

    #[tokio::test]
    async fn bomb_swing_is_bounded_by_the_damping_window() {
        // Spec scenario: p_prev = 0.50 at t=0, a bomb plant half a second
        // later raises the raw score to 0.80. The damped result must not
        // exceed p_prev + (0.20 + 0.5*0.05) = 0.725.
        let t0 = Utc::now();
        let store = Arc::new(FakePredictionStore::default());
        store
            .save_latest(&Prediction {
                match_id: "m1".to_string(),
                p_team_a_win: 0.50,
                p_team_b_win: 0.50,
                confidence: 0.5,
                model_version: MODEL_VERSION.to_string(),
                trigger_event_id: Uuid::new_v4(),
                trigger_event_type: EventType::RoundStart,
                ts_calc: t0,
                state_version: 1,
            })
            .await
            .unwrap();

        let engine = PredictionEngine::new(store);
        let mut s = state();
        s.bomb_planted = true;
        s.team_a.side = riftline_types::state::Side::T;

        let t1 = t0 + chrono::Duration::milliseconds(500);
        let pred = engine
            .predict(&s, &event_at(EventType::BombPlanted, t1))
            .await
            .unwrap();

        assert!(pred.p_team_a_win <= 0.725 + 1e-9, "{}", pred.p_team_a_win);
    }

    #[tokio::test]
    async fn small_moves_pass_through_undamped() {
        let t0 = Utc::now();
        let store = Arc::new(FakePredictionStore::default());
        store
            .save_latest(&Prediction {
                match_id: "m1".to_string(),
                p_team_a_win: 0.50,
                p_team_b_win: 0.50,
                confidence: 0.5,
                model_version: MODEL_VERSION.to_string(),
                trigger_event_id: Uuid::new_v4(),
                trigger_event_type: EventType::RoundStart,
                ts_calc: t0,
                state_version: 1,
            })
            .await
            .unwrap();

        let engine = PredictionEngine::new(store);
        let mut s = state();
        s.team_b.alive_count = 4;

        let pred = engine
            .predict(&s, &event_at(EventType::Kill, t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(pred.p_team_a_win, 0.65);
    }
}
