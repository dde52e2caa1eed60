#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-dedup** -- per-match bounded deduplication of event ids.
//!
//! Wraps a [`riftline_store_core::DedupStore`] with the admission-time
//! policy: check-then-mark, with a choice of keying mode. The store itself
//! only knows how to maintain one bounded set per key; this crate decides
//! what that key is.

use std::sync::Arc;

use riftline_store_core::{DedupStore, Result};
use uuid::Uuid;

/// The key a duplicate check is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    /// Scope the seen-set to `match_id` (the default, authoritative mode).
    PerMatch,
    /// Scope all events to a single global seen-set, for clients that do
    /// not reliably send `match_id`. Equivalent semantics, coarser sharing.
    PerEventKey,
}

const GLOBAL_DEDUP_KEY: &str = "__global__";

/// Admission-time duplicate suppression in front of a [`DedupStore`].
pub struct DedupService {
    store: Arc<dyn DedupStore>,
    mode: DedupMode,
}

impl DedupService {
    /// Build a service over `store` using `mode` to scope its keys.
    pub fn new(store: Arc<dyn DedupStore>, mode: DedupMode) -> Self {
        Self { store, mode }
    }

    fn key_for(&self, match_id: &str) -> &str {
        match self.mode {
            DedupMode::PerMatch => match_id,
            DedupMode::PerEventKey => GLOBAL_DEDUP_KEY,
        }
    }

    /// Whether `event_id` has already been admitted for `match_id`.
    pub async fn is_duplicate(&self, event_id: Uuid, match_id: &str) -> Result<bool> {
        self.store.is_duplicate(event_id, self.key_for(match_id)).await
    }

    /// Check `event_id` for `match_id` and, if new, mark it seen in the same
    /// call. Returns `true` if the event was already seen (the caller
    /// should short-circuit and skip the log append).
    pub async fn check_and_mark(&self, event_id: Uuid, match_id: &str) -> Result<bool> {
        let key = self.key_for(match_id);
        if self.store.is_duplicate(event_id, key).await? {
            return Ok(true);
        }
        self.store.mark_seen(event_id, key).await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        seen: Mutex<std::collections::HashSet<(Uuid, String)>>,
    }

    #[async_trait]
    impl DedupStore for FakeStore {
        async fn is_duplicate(&self, event_id: Uuid, match_id: &str) -> Result<bool> {
            Ok(self
                .seen
                .lock()
                .unwrap()
                .contains(&(event_id, match_id.to_string())))
        }

        async fn mark_seen(&self, event_id: Uuid, match_id: &str) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .insert((event_id, match_id.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn per_match_mode_scopes_to_match_id() {
        let service = DedupService::new(Arc::new(FakeStore::default()), DedupMode::PerMatch);
        let id = Uuid::new_v4();

        assert!(!service.check_and_mark(id, "m1").await.unwrap());
        assert!(service.check_and_mark(id, "m1").await.unwrap());
        // Same event id, different match: not yet seen there.
        assert!(!service.check_and_mark(id, "m2").await.unwrap());
    }

    #[tokio::test]
    async fn per_event_key_mode_shares_across_matches() {
        let service = DedupService::new(Arc::new(FakeStore::default()), DedupMode::PerEventKey);
        let id = Uuid::new_v4();

        assert!(!service.check_and_mark(id, "m1").await.unwrap());
        assert!(service.check_and_mark(id, "m2").await.unwrap());
    }

    #[tokio::test]
    async fn second_admission_of_same_id_is_reported_duplicate() {
        let service = DedupService::new(Arc::new(FakeStore::default()), DedupMode::PerMatch);
        let id = Uuid::new_v4();
        service.check_and_mark(id, "m1").await.unwrap();
        assert!(service.is_duplicate(id, "m1").await.unwrap());
    }
}
