//! In-process [`KeyValueStore`] implementation.
//!
//! Used by the host binary when running a single replica and as the cache
//! double in tests. Expiry is evaluated lazily against `tokio::time::Instant`,
//! so paused-clock tests can advance past a TTL deterministically. Expired
//! entries are swept from the map every [`PRUNE_EVERY_WRITES`] writes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::{KeyValueStore, Result, expiry_after, glob_matches};

/// Number of writes between sweeps of expired entries.
pub const PRUNE_EVERY_WRITES: u64 = 64;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// A process-local cache with TTL support.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// Returns true if the store has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts an entry, sweeping expired keys every few writes.
    fn insert(
        &self,
        entries: &mut HashMap<String, Entry>,
        key: &str,
        entry: Entry,
        now: Instant,
    ) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PRUNE_EVERY_WRITES == 0 {
            entries.retain(|_, e| e.is_live(now));
        }
        entries.insert(key.to_string(), entry);
    }

    #[cfg(test)]
    fn stored_entries(&self) -> usize {
        self.lock().len()
    }

    fn live_value(entries: &HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }
}

impl KeyValueStore for InMemoryStore {
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send {
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: ttl.and_then(|ttl| expiry_after(now, ttl)),
        };
        self.insert(&mut self.lock(), key, entry, now);
        std::future::ready(Ok(()))
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        let now = Instant::now();
        let mut entries = self.lock();
        let written = if Self::live_value(&entries, key, now).is_some() {
            false
        } else {
            let entry = Entry {
                value,
                expires_at: expiry_after(now, ttl),
            };
            self.insert(&mut entries, key, entry, now);
            true
        };
        std::future::ready(Ok(written))
    }

    fn try_get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send {
        let value = Self::live_value(&self.lock(), key, Instant::now());
        std::future::ready(Ok(value))
    }

    fn try_delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        let now = Instant::now();
        let removed = self.lock().remove(key).is_some_and(|e| e.is_live(now));
        std::future::ready(Ok(removed))
    }

    fn try_delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool>> + Send {
        let now = Instant::now();
        let mut entries = self.lock();
        let matches = Self::live_value(&entries, key, now).is_some_and(|v| v == expected);
        if matches {
            entries.remove(key);
        }
        std::future::ready(Ok(matches))
    }

    fn keys_by_pattern(&self, pattern: &str) -> impl Future<Output = Result<Vec<String>>> + Send {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        std::future::ready(Ok(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let store = InMemoryStore::new();
        store.set("k", "v".to_string(), None).await.unwrap();

        assert_eq!(store.try_get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.try_get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = InMemoryStore::new();
        store
            .set("k", "v".to_string(), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.try_get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.try_get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_live_and_expired_entries() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(5);

        assert!(store.set_if_absent("lock", "a".to_string(), ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", "b".to_string(), ttl).await.unwrap());
        assert_eq!(store.try_get("lock").await.unwrap(), Some("a".to_string()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_if_absent("lock", "b".to_string(), ttl).await.unwrap());
        assert_eq!(store.try_get("lock").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_swept_by_later_writes() {
        let store = InMemoryStore::new();
        for i in 0..10 {
            let key = format!("work-item-mutex:lapsed-{i}");
            let ttl = Duration::from_secs(1);
            assert!(store.set_if_absent(&key, "holder".to_string(), ttl).await.unwrap());
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.stored_entries(), 10);

        for i in 10..PRUNE_EVERY_WRITES {
            let key = format!("other-{i}");
            store.set(&key, String::new(), None).await.unwrap();
        }

        let survivors = usize::try_from(PRUNE_EVERY_WRITES - 10).unwrap();
        assert_eq!(store.stored_entries(), survivors);
        assert!(store.keys_by_pattern("work-item-mutex:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn huge_ttl_does_not_overflow() {
        let store = InMemoryStore::new();
        let written = store.set_if_absent("lock", "a".to_string(), Duration::MAX);
        assert!(written.await.unwrap());
        store.set("k", "v".to_string(), Some(Duration::MAX)).await.unwrap();

        assert_eq!(store.try_get("lock").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.try_get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_matching_value() {
        let store = InMemoryStore::new();
        store.set("lock", "owner-a".to_string(), None).await.unwrap();

        assert!(!store.try_delete_if_equals("lock", "owner-b").await.unwrap());
        assert!(store.try_get("lock").await.unwrap().is_some());

        assert!(store.try_delete_if_equals("lock", "owner-a").await.unwrap());
        assert!(store.try_get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn try_delete_reports_whether_anything_was_removed() {
        let store = InMemoryStore::new();
        store.set("k", "v".to_string(), None).await.unwrap();

        assert!(store.try_delete("k").await.unwrap());
        assert!(!store.try_delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn keys_by_pattern_filters_and_sorts() {
        let store = InMemoryStore::new();
        for key in ["state:b", "state:a", "mutex:x"] {
            store.set(key, String::new(), None).await.unwrap();
        }

        let keys = store.keys_by_pattern("state:*").await.unwrap();
        assert_eq!(keys, vec!["state:a".to_string(), "state:b".to_string()]);
    }
}
