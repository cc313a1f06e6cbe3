//! Execution of a single work item inside an admitted scope.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{ScopeError, WorkItemOutcome};
use crate::cache::{KeyValueStore, MutexLease};
use crate::processor::{PreparedWorkItem, ProcessorRegistry};
use crate::state::ReplicaState;
use crate::state::replica::persist_in_background;
use crate::telemetry::TelemetryRecorder;
use crate::types::{WorkItemType, peek_work_item_type};

/// An admitted unit of work.
///
/// Holds one slot of the replica's concurrency budget until closed. Prefer
/// [`WorkItemScope::close`]; dropping an unclosed scope also releases the
/// slot, persisting any resulting state change in the background.
pub struct WorkItemScope<S: KeyValueStore> {
    state: Arc<ReplicaState<S>>,
    registry: ProcessorRegistry,
    telemetry: Arc<dyn TelemetryRecorder>,
    mutex_ttl: Duration,
    closed: bool,
}

impl<S: KeyValueStore> std::fmt::Debug for WorkItemScope<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemScope")
            .field("replica", self.state.replica())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> WorkItemScope<S> {
    pub(crate) fn new(
        state: Arc<ReplicaState<S>>,
        registry: ProcessorRegistry,
        telemetry: Arc<dyn TelemetryRecorder>,
        mutex_ttl: Duration,
    ) -> Self {
        WorkItemScope {
            state,
            registry,
            telemetry,
            mutex_ttl,
            closed: false,
        }
    }

    /// Runs one raw work-item payload.
    ///
    /// Unknown discriminators and undecodable payloads are returned as
    /// errors before anything runs. If the item's mutex key is held the
    /// processor is not invoked and [`WorkItemOutcome::MutexContended`] is
    /// returned. Processor errors propagate as [`ScopeError::Processor`];
    /// the lease is released and telemetry closed on every path.
    pub async fn run_work_item(
        &self,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkItemOutcome, ScopeError> {
        let work_item_type = peek_work_item_type(payload)?;
        let descriptor = self.registry.resolve(&work_item_type)?;
        let prepared = descriptor.prepare(payload)?;

        let span = info_span!(
            "work_item",
            work_item_type = %work_item_type,
            processor = descriptor.processor_name(),
            context = %format_context(prepared.logging_context()),
        );

        self.run_prepared(work_item_type, prepared, cancel)
            .instrument(span)
            .await
    }

    async fn run_prepared(
        &self,
        work_item_type: WorkItemType,
        prepared: PreparedWorkItem,
        cancel: &CancellationToken,
    ) -> Result<WorkItemOutcome, ScopeError> {
        let lease = match prepared.mutex_key() {
            Some(key) => {
                let acquired =
                    MutexLease::try_acquire(self.state.store().clone(), key, self.mutex_ttl)
                        .await?;
                match acquired {
                    Some(lease) => Some(lease),
                    None => {
                        info!(mutex_key = %key, "Mutex key held elsewhere, retry later");
                        return Ok(WorkItemOutcome::MutexContended);
                    }
                }
            }
            None => None,
        };

        let mut completion = self.telemetry.record_completion(&work_item_type);
        let result = prepared.process(cancel.clone()).await;
        if matches!(result, Ok(true)) {
            completion.set_success();
        }
        drop(completion);

        if let Some(lease) = lease
            && let Err(e) = lease.release().await
        {
            warn!(error = %e, "Failed to release mutex lease; it will expire");
        }

        match result {
            Ok(true) => Ok(WorkItemOutcome::Processed),
            Ok(false) => {
                debug!("Processor reported failure");
                Ok(WorkItemOutcome::Failed)
            }
            Err(e) => Err(ScopeError::Processor(e)),
        }
    }

    /// Closes the scope, persisting the state if this was the last scope of
    /// a drain.
    pub async fn close(mut self) {
        self.closed = true;
        if self.state.notify_scope_closed() {
            // Failures are logged by the state.
            let _ = self.state.persist().await;
        }
    }
}

impl<S: KeyValueStore> Drop for WorkItemScope<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.state.notify_scope_closed() {
            persist_in_background(self.state.clone());
        }
    }
}

fn format_context(context: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in context {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "{key}={value}");
    }
    out
}
