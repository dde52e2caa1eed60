#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **riftline-shard** -- shard key derivation and lease-based lock management.
//!
//! The ordering domain is the `(match_id, map_id)` pair (see
//! [`riftline_types::Shard`]); this crate is concerned only with the second
//! half of the contract: making sure exactly one logical consumer holds a
//! shard at a time, via a lease that auto-expires if its owner disappears.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use rand::Rng;
use riftline_store_core::{LockStore, Result};
use riftline_types::Shard;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default lease duration granted on `acquire`/`extend` (§3 lifecycles).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Build a process-unique consumer/owner identifier: `"{pid}-{random}"`.
pub fn generate_consumer_id() -> String {
    let pid = std::process::id();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{pid}-{suffix:08x}")
}

/// Tracks and renews the shards a single consumer process currently holds.
///
/// Heartbeats must run at or below 1/3 of the lease interval so a single
/// missed tick never lets the lease lapse (per the concurrency contract).
pub struct LockManager {
    store: Arc<dyn LockStore>,
    owner_id: String,
    lease: Duration,
    held: DashSet<Shard>,
}

impl LockManager {
    /// Build a lock manager for `owner_id`, using `lease` as the hold duration.
    pub fn new(store: Arc<dyn LockStore>, owner_id: String, lease: Duration) -> Self {
        Self {
            store,
            owner_id,
            lease,
            held: DashSet::new(),
        }
    }

    /// This manager's owner identifier.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// The interval heartbeats should run at: 1/3 of the lease, per the
    /// concurrency contract's heartbeat rule.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease / 3
    }

    /// Attempt to claim `shard`. On success the shard is tracked for
    /// subsequent heartbeats.
    pub async fn acquire(&self, shard: &Shard) -> Result<bool> {
        let acquired = self.store.acquire(shard, &self.owner_id, self.lease).await?;
        if acquired {
            self.held.insert(shard.clone());
            debug!(shard = %shard, owner = %self.owner_id, "shard lock acquired");
        }
        Ok(acquired)
    }

    /// Release `shard`, whether or not this manager still holds it.
    pub async fn release(&self, shard: &Shard) -> Result<()> {
        self.store.release(shard, &self.owner_id).await?;
        self.held.remove(shard);
        debug!(shard = %shard, owner = %self.owner_id, "shard lock released");
        Ok(())
    }

    /// The shards currently believed to be held by this manager.
    pub fn held_shards(&self) -> Vec<Shard> {
        self.held.iter().map(|s| s.clone()).collect()
    }

    /// Extend every held shard's lease. Shards whose extend fails (another
    /// owner has taken over, or the backend rejected the renewal) are
    /// dropped from the held set and returned to the caller, which must
    /// stop processing them immediately.
    pub async fn heartbeat_all(&self) -> Result<Vec<Shard>> {
        let mut lost = Vec::new();
        for shard in self.held_shards() {
            match self.store.extend(&shard, &self.owner_id, self.lease).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(shard = %shard, owner = %self.owner_id, "lease lost, dropping shard");
                    self.held.remove(&shard);
                    lost.push(shard);
                }
                Err(e) => {
                    warn!(shard = %shard, owner = %self.owner_id, error = %e, "heartbeat failed, dropping shard");
                    self.held.remove(&shard);
                    lost.push(shard);
                }
            }
        }
        Ok(lost)
    }

    /// Release every currently held shard, best-effort. Used on graceful
    /// shutdown.
    pub async fn release_all(&self) {
        for shard in self.held_shards() {
            if let Err(e) = self.release(&shard).await {
                warn!(shard = %shard, owner = %self.owner_id, error = %e, "failed to release shard on shutdown");
            }
        }
    }

    /// Spawn a background task that heartbeats every held shard on
    /// [`Self::heartbeat_interval`], calling `on_lost` for any shard a
    /// heartbeat drops.
    pub fn spawn_heartbeat<F>(self: &Arc<Self>, on_lost: F) -> JoinHandle<()>
    where
        F: Fn(Shard) + Send + Sync + 'static,
    {
        let manager = Arc::clone(self);
        let interval = manager.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match manager.heartbeat_all().await {
                    Ok(lost) => lost.into_iter().for_each(&on_lost),
                    Err(e) => warn!(error = %e, "heartbeat pass failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use riftline_store_core::StoreError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLockStore {
        locks: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl LockStore for FakeLockStore {
        async fn acquire(&self, shard: &Shard, owner_id: &str, _lease: Duration) -> Result<bool> {
            let mut locks = self.locks.lock().unwrap();
            if locks.contains_key(&shard.key()) {
                return Ok(false);
            }
            locks.insert(shard.key(), owner_id.to_string());
            Ok(true)
        }

        async fn extend(&self, shard: &Shard, owner_id: &str, _lease: Duration) -> Result<bool> {
            let locks = self.locks.lock().unwrap();
            Ok(locks.get(&shard.key()).map(|o| o == owner_id).unwrap_or(false))
        }

        async fn release(&self, shard: &Shard, owner_id: &str) -> Result<()> {
            let mut locks = self.locks.lock().unwrap();
            if locks.get(&shard.key()).map(|o| o == owner_id).unwrap_or(false) {
                locks.remove(&shard.key());
            }
            Ok(())
        }
    }

    fn shard() -> Shard {
        Shard::new("m1", "de_dust2")
    }

    #[tokio::test]
    async fn second_owner_cannot_acquire_a_held_shard() {
        let store = Arc::new(FakeLockStore::default());
        let a = LockManager::new(store.clone(), "owner-a".into(), DEFAULT_LEASE);
        let b = LockManager::new(store, "owner-b".into(), DEFAULT_LEASE);

        assert!(a.acquire(&shard()).await.unwrap());
        assert!(!b.acquire(&shard()).await.unwrap());
    }

    #[tokio::test]
    async fn release_lets_another_owner_acquire() {
        let store = Arc::new(FakeLockStore::default());
        let a = LockManager::new(store.clone(), "owner-a".into(), DEFAULT_LEASE);
        let b = LockManager::new(store, "owner-b".into(), DEFAULT_LEASE);

        assert!(a.acquire(&shard()).await.unwrap());
        a.release(&shard()).await.unwrap();
        assert!(b.acquire(&shard()).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_drops_a_shard_whose_lease_was_stolen() {
        let store = Arc::new(FakeLockStore::default());
        let a = LockManager::new(store.clone(), "owner-a".into(), DEFAULT_LEASE);
        assert!(a.acquire(&shard()).await.unwrap());

        // Simulate another owner forcibly taking the lock out from under `a`.
        store.locks.lock().unwrap().insert(shard().key(), "owner-b".to_string());

        let lost = a.heartbeat_all().await.unwrap();
        assert_eq!(lost, vec![shard()]);
        assert!(a.held_shards().is_empty());
    }

    #[test]
    fn heartbeat_interval_is_a_third_of_the_lease() {
        let store = Arc::new(FakeLockStore::default());
        let manager = LockManager::new(store, "owner-a".into(), Duration::from_secs(30));
        assert_eq!(manager.heartbeat_interval(), Duration::from_secs(10));
    }

    #[allow(dead_code)]
    fn assert_store_error_is_send_sync() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<StoreError>();
    }
}
