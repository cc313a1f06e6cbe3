//! The persisted form of a replica's processor state.
//!
//! Each replica writes `{state, replica, lastUpdated}` under
//! `work-item-processor-state:<replica>` on every transition. Deployment
//! tooling reads these records to wait for a drain and writes them to request
//! a stop or start (see [`super::client`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transitions::ProcessorState;
use crate::cache::{CacheError, KeyValueStore};
use crate::types::ReplicaId;

/// Key prefix for replica state records.
pub const STATE_KEY_PREFIX: &str = "work-item-processor-state:";

/// Returns the cache key holding `replica`'s state record.
pub fn state_cache_key(replica: &ReplicaId) -> String {
    format!("{STATE_KEY_PREFIX}{replica}")
}

/// Returns the replica id encoded in a state key, if it is one.
pub fn replica_from_key(key: &str) -> Option<ReplicaId> {
    key.strip_prefix(STATE_KEY_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(ReplicaId::from)
}

/// A replica's state as stored in the shared cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedProcessorState {
    pub state: ProcessorState,
    pub replica: ReplicaId,
    pub last_updated: DateTime<Utc>,
}

impl PersistedProcessorState {
    /// Creates a record stamped with the current time.
    pub fn now(replica: ReplicaId, state: ProcessorState) -> Self {
        PersistedProcessorState {
            state,
            replica,
            last_updated: Utc::now(),
        }
    }
}

/// Reads a replica's record from the store.
pub async fn load_record<S: KeyValueStore>(
    store: &S,
    replica: &ReplicaId,
) -> Result<Option<PersistedProcessorState>, CacheError> {
    match store.try_get(&state_cache_key(replica)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Writes a replica's record to the store (no expiry).
pub async fn store_record<S: KeyValueStore>(
    store: &S,
    record: &PersistedProcessorState,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(record)?;
    store
        .set(&state_cache_key(&record.replica), raw, None)
        .await
}
