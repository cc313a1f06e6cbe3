//! Deployment-tool side of the processor state protocol.
//!
//! A rolling deployment drains old replicas before removing them: it writes
//! `Stopping` to each replica's record, polls until the replica reports
//! `Stopped`, and on rollback writes `Working` to resume it. Replicas pick
//! these requests up through [`super::run_state_sync`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::record::{
    PersistedProcessorState, STATE_KEY_PREFIX, load_record, replica_from_key, store_record,
};
use super::transitions::ProcessorState;
use crate::cache::{KeyValueStore, Result};
use crate::types::ReplicaId;

/// Reads and requests replica states through the shared store.
#[derive(Debug)]
pub struct ReplicaStateClient<S: KeyValueStore> {
    store: Arc<S>,
}

impl<S: KeyValueStore> Clone for ReplicaStateClient<S> {
    fn clone(&self) -> Self {
        ReplicaStateClient {
            store: self.store.clone(),
        }
    }
}

impl<S: KeyValueStore> ReplicaStateClient<S> {
    pub fn new(store: Arc<S>) -> Self {
        ReplicaStateClient { store }
    }

    /// Returns the last state `replica` persisted, or `None` if it never has.
    pub async fn get_state(&self, replica: &ReplicaId) -> Result<Option<ProcessorState>> {
        Ok(load_record(&*self.store, replica).await?.map(|r| r.state))
    }

    /// Asks `replica` to stop admitting work and drain.
    #[instrument(skip(self), fields(replica = %replica))]
    pub async fn request_stop(&self, replica: &ReplicaId) -> Result<()> {
        info!("Requesting drain");
        self.request(replica, ProcessorState::Stopping).await
    }

    /// Asks `replica` to resume admitting work.
    #[instrument(skip(self), fields(replica = %replica))]
    pub async fn request_start(&self, replica: &ReplicaId) -> Result<()> {
        info!("Requesting start");
        self.request(replica, ProcessorState::Working).await
    }

    /// Polls every `poll` until `replica` reports `Stopped`.
    ///
    /// Returns `false` if `timeout` elapses first.
    #[instrument(skip(self), fields(replica = %replica))]
    pub async fn wait_for_stopped(
        &self,
        replica: &ReplicaId,
        poll: Duration,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.get_state(replica).await?;
            if state == Some(ProcessorState::Stopped) {
                info!("Replica stopped");
                return Ok(true);
            }
            if tokio::time::Instant::now() + poll > deadline {
                warn!(state = ?state, "Timed out waiting for replica to stop");
                return Ok(false);
            }
            debug!(state = ?state, "Replica not stopped yet");
            tokio::time::sleep(poll).await;
        }
    }

    /// Lists the records of every replica that has persisted its state.
    pub async fn discover(&self) -> Result<Vec<PersistedProcessorState>> {
        let keys = self
            .store
            .keys_by_pattern(&format!("{STATE_KEY_PREFIX}*"))
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(replica) = replica_from_key(&key) else {
                continue;
            };
            // The record may have been deleted between listing and reading.
            if let Some(record) = load_record(&*self.store, &replica).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn request(&self, replica: &ReplicaId, state: ProcessorState) -> Result<()> {
        let record = PersistedProcessorState::now(replica.clone(), state);
        store_record(&*self.store, &record).await
    }
}
