//! Distributed mutex leases.
//!
//! A lease is an expiring cache entry written with "set if absent". The entry
//! holds a per-acquisition [`HolderId`] so release only ever deletes the
//! caller's own lease, never one re-acquired by another replica after expiry.
//!
//! Acquisition never blocks: if the key is held the caller is told so
//! immediately and is expected to retry the whole work item later.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{KeyValueStore, Result, expiry_after};
use crate::types::HolderId;

/// Prefix applied to application-supplied mutex keys.
const MUTEX_KEY_PREFIX: &str = "work-item-mutex:";

/// Returns the cache key used for an application mutex key.
pub fn mutex_cache_key(key: &str) -> String {
    format!("{MUTEX_KEY_PREFIX}{key}")
}

/// An exclusively held, TTL-bounded lock on an application key.
///
/// Release with [`MutexLease::release`]. If a lease is dropped without being
/// released (for example while a handler panics) the release is spawned on
/// the current runtime; with no runtime available the entry is left to expire.
#[derive(Debug)]
pub struct MutexLease<S: KeyValueStore> {
    store: Arc<S>,
    key: String,
    holder: HolderId,
    expires_at: Option<Instant>,
    released: bool,
}

impl<S: KeyValueStore> MutexLease<S> {
    /// Attempts to acquire the lease for `key`.
    ///
    /// Returns `Ok(None)` if another holder currently owns the key.
    pub async fn try_acquire(store: Arc<S>, key: &str, ttl: Duration) -> Result<Option<Self>> {
        let holder = HolderId::generate();
        let cache_key = mutex_cache_key(key);
        let acquired = store
            .set_if_absent(&cache_key, holder.to_string(), ttl)
            .await?;

        if !acquired {
            debug!(mutex_key = %key, "Mutex lease is held by another scope");
            return Ok(None);
        }

        trace!(mutex_key = %key, holder = %holder, ttl_secs = ttl.as_secs(), "Acquired mutex lease");
        Ok(Some(MutexLease {
            store,
            key: key.to_string(),
            holder,
            expires_at: expiry_after(Instant::now(), ttl),
            released: false,
        }))
    }

    /// The application key this lease protects.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The unique id of this acquisition.
    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    /// When the lease lapses if it is never released, or `None` if the TTL
    /// is too long to ever lapse.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Releases the lease.
    ///
    /// Returns `false` if the lease had already expired (and possibly been
    /// re-acquired by someone else), in which case nothing is deleted.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let deleted = self
            .store
            .try_delete_if_equals(&mutex_cache_key(&self.key), self.holder.as_str())
            .await?;
        if !deleted {
            warn!(mutex_key = %self.key, holder = %self.holder, "Mutex lease expired before release");
        }
        Ok(deleted)
    }
}

impl<S: KeyValueStore> Drop for MutexLease<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let cache_key = mutex_cache_key(&self.key);
        let holder = self.holder.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(mutex_key = %self.key, "Releasing dropped mutex lease in background");
                handle.spawn(async move {
                    if let Err(e) = store.try_delete_if_equals(&cache_key, &holder).await {
                        warn!(error = %e, cache_key = %cache_key, "Failed to release dropped mutex lease");
                    }
                });
            }
            Err(_) => {
                warn!(mutex_key = %self.key, "No runtime to release dropped mutex lease; leaving it to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStore;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn second_acquire_fails_fast_while_held() {
        let store = Arc::new(InMemoryStore::new());

        let first = MutexLease::try_acquire(store.clone(), "repo:main", TTL)
            .await
            .unwrap()
            .expect("first acquisition succeeds");
        let second = MutexLease::try_acquire(store.clone(), "repo:main", TTL)
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(first.release().await.unwrap());

        let third = MutexLease::try_acquire(store.clone(), "repo:main", TTL)
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let store = Arc::new(InMemoryStore::new());

        let a = MutexLease::try_acquire(store.clone(), "a", TTL).await.unwrap();
        let b = MutexLease::try_acquire(store.clone(), "b", TTL).await.unwrap();

        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_does_not_delete_new_holder() {
        let store = Arc::new(InMemoryStore::new());

        let stale = MutexLease::try_acquire(store.clone(), "k", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = MutexLease::try_acquire(store.clone(), "k", TTL)
            .await
            .unwrap()
            .unwrap();

        assert!(!stale.release().await.unwrap());
        assert_eq!(
            store.try_get(&mutex_cache_key("k")).await.unwrap(),
            Some(fresh.holder().to_string())
        );
    }

    #[tokio::test]
    async fn unrepresentable_ttl_never_lapses() {
        let store = Arc::new(InMemoryStore::new());

        let lease = MutexLease::try_acquire(store.clone(), "k", Duration::MAX)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(lease.expires_at(), None);
        assert!(lease.release().await.unwrap());
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_background() {
        let store = Arc::new(InMemoryStore::new());

        let lease = MutexLease::try_acquire(store.clone(), "k", TTL)
            .await
            .unwrap()
            .unwrap();
        drop(lease);

        // Let the spawned release run.
        tokio::task::yield_now().await;

        assert!(store.try_get(&mutex_cache_key("k")).await.unwrap().is_none());
    }
}
