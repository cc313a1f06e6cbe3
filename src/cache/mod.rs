//! Shared key-value cache contract.
//!
//! Every replica talks to the same cache. The engine uses it for two things:
//! - persisting each replica's processor state so deployment tooling can
//!   observe and command it ([`crate::state`])
//! - distributed mutex leases ([`mutex`])
//!
//! All operations are single-key and idempotent; nothing here needs a
//! multi-step transaction.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

pub mod memory;
pub mod mutex;

pub use memory::InMemoryStore;
pub use mutex::MutexLease;

/// Errors surfaced by a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached or rejected the operation.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be (de)serialized.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Deadline `ttl` after `now`, or `None` when it is past what an `Instant`
/// can represent. An unrepresentable deadline never expires.
pub(crate) fn expiry_after(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// A shared cache reachable by every replica.
///
/// Values are opaque strings; callers serialize with `serde_json`.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Stores `value` under `key`, replacing any existing value.
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stores `value` only if `key` is absent (or expired).
    ///
    /// Returns `true` if the value was written.
    fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Returns the value under `key`, if present and not expired.
    fn try_get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Deletes `key`. Returns `true` if a live value was removed.
    fn try_delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Deletes `key` only if it currently holds `expected`.
    fn try_delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Lists live keys matching a glob `pattern` (`*` and `?` wildcards).
    fn keys_by_pattern(&self, pattern: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Matches `key` against a glob pattern where `*` matches any run of
/// characters and `?` matches exactly one.
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0, 0);
    // Position of the last `*` seen and the key index it was matched against.
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, k));
                p += 1;
            }
            Some('?') => {
                p += 1;
                k += 1;
            }
            Some(c) if *c == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    k = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
