//! The scope gate.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::{ScopeError, WorkItemScope};
use crate::cache::KeyValueStore;
use crate::processor::ProcessorRegistry;
use crate::state::ReplicaState;
use crate::state::replica::Admission;
use crate::telemetry::TelemetryRecorder;

/// Default time-to-live for mutex leases.
pub const DEFAULT_MUTEX_TTL: Duration = Duration::from_secs(60);

/// Maximum number of scopes open at once on one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyLimit {
    #[default]
    Unbounded,
    Bounded(NonZeroUsize),
}

impl ConcurrencyLimit {
    /// Interprets a configured `max_parallel`: any negative value is
    /// unbounded, positive values are a ceiling. Zero is rejected.
    pub fn from_max_parallel(max_parallel: i64) -> Option<Self> {
        match max_parallel {
            n if n < 0 => Some(ConcurrencyLimit::Unbounded),
            n if n > 0 => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(ConcurrencyLimit::Bounded),
            _ => None,
        }
    }

    pub fn max_open(self) -> Option<usize> {
        match self {
            ConcurrencyLimit::Unbounded => None,
            ConcurrencyLimit::Bounded(n) => Some(n.get()),
        }
    }
}

/// Hands out [`WorkItemScope`]s when the replica may start new work.
///
/// Admission is FIFO across concurrent callers on one replica.
pub struct WorkItemScopeManager<S: KeyValueStore> {
    state: Arc<ReplicaState<S>>,
    registry: ProcessorRegistry,
    telemetry: Arc<dyn TelemetryRecorder>,
    limit: ConcurrencyLimit,
    mutex_ttl: Duration,
}

impl<S: KeyValueStore> Clone for WorkItemScopeManager<S> {
    fn clone(&self) -> Self {
        WorkItemScopeManager {
            state: self.state.clone(),
            registry: self.registry.clone(),
            telemetry: self.telemetry.clone(),
            limit: self.limit,
            mutex_ttl: self.mutex_ttl,
        }
    }
}

impl<S: KeyValueStore> std::fmt::Debug for WorkItemScopeManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemScopeManager")
            .field("replica", self.state.replica())
            .field("limit", &self.limit)
            .field("mutex_ttl", &self.mutex_ttl)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore> WorkItemScopeManager<S> {
    /// Creates an unbounded gate with the default mutex TTL.
    pub fn new(
        state: Arc<ReplicaState<S>>,
        registry: ProcessorRegistry,
        telemetry: Arc<dyn TelemetryRecorder>,
    ) -> Self {
        WorkItemScopeManager {
            state,
            registry,
            telemetry,
            limit: ConcurrencyLimit::Unbounded,
            mutex_ttl: DEFAULT_MUTEX_TTL,
        }
    }

    pub fn with_limit(mut self, limit: ConcurrencyLimit) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_mutex_ttl(mut self, ttl: Duration) -> Self {
        self.mutex_ttl = ttl;
        self
    }

    pub fn state(&self) -> &Arc<ReplicaState<S>> {
        &self.state
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn limit(&self) -> ConcurrencyLimit {
        self.limit
    }

    /// Waits until the replica is `Working` with capacity, then opens a scope.
    ///
    /// The open-scope count is incremented under the same lock as the
    /// admission check. Fails with [`ScopeError::Disposed`] if the state is
    /// disposed, or [`ScopeError::Cancelled`] if `cancel` fires first.
    #[instrument(skip_all, fields(replica = %self.state.replica()))]
    pub async fn begin_scope_when_ready(
        &self,
        cancel: &CancellationToken,
    ) -> Result<WorkItemScope<S>, ScopeError> {
        let mut waiter = Waiter {
            state: &self.state,
            ticket: self.state.join_queue(),
            admitted: false,
        };
        trace!(ticket = waiter.ticket, "Waiting for admission");

        loop {
            // Registered before checking, so a signal in between still wakes us.
            let notified = self.state.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.try_open_scope(waiter.ticket, self.limit.max_open()) {
                Admission::Admitted => {
                    waiter.admitted = true;
                    debug!(ticket = waiter.ticket, "Work item scope opened");
                    return Ok(WorkItemScope::new(
                        self.state.clone(),
                        self.registry.clone(),
                        self.telemetry.clone(),
                        self.mutex_ttl,
                    ));
                }
                Admission::Disposed => return Err(ScopeError::Disposed),
                Admission::Wait => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(ticket = waiter.ticket, "Cancelled while waiting for admission");
                    return Err(ScopeError::Cancelled);
                }
                _ = &mut notified => {}
            }
        }
    }
}

/// A place in the admission queue; leaves the queue unless admitted.
struct Waiter<'a, S: KeyValueStore> {
    state: &'a ReplicaState<S>,
    ticket: u64,
    admitted: bool,
}

impl<S: KeyValueStore> Drop for Waiter<'_, S> {
    fn drop(&mut self) {
        if !self.admitted {
            self.state.leave_queue(self.ticket);
        }
    }
}
