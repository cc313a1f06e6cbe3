//! Per-replica processor state.
//!
//! [`ReplicaState`] owns the replica's [`ProcessorState`], the number of open
//! work-item scopes, and the FIFO queue of callers waiting for admission. All
//! three live behind one mutex and are paired with a single [`Notify`]:
//! anything that could let a waiter proceed (start, a scope closing, a
//! waiter leaving or being admitted, dispose) calls `notify_waiters`.
//!
//! The in-memory value is authoritative for local gating. Every transition
//! is also written to the shared cache so deployment tooling can observe the
//! replica, and [`ReplicaState::sync_from_store`] applies stop/start requests
//! that tooling wrote back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::record::{PersistedProcessorState, load_record, store_record};
use super::transitions::{ProcessorState, StateCommand, TransitionError, next_state};
use crate::cache::{CacheError, KeyValueStore};
use crate::types::ReplicaId;

/// Errors from processor state operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The command is not valid in the current state.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The transition was applied locally but could not be persisted.
    #[error("failed to persist processor state: {0}")]
    Cache(#[from] CacheError),
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Outcome of an admission attempt for a queued waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// A scope was opened for the waiter.
    Admitted,
    /// The waiter must keep waiting.
    Wait,
    /// The state was disposed; no scope will ever be admitted.
    Disposed,
}

#[derive(Debug)]
struct Inner {
    state: ProcessorState,
    open_scopes: usize,
    /// Incremented on every state change; compared with the last persisted
    /// revision to detect unwritten local transitions.
    revision: u64,
    disposed: bool,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// The processor state machine for one replica.
#[derive(Debug)]
pub struct ReplicaState<S: KeyValueStore> {
    replica: ReplicaId,
    store: Arc<S>,
    inner: Mutex<Inner>,
    changed: Notify,
    /// Revision last written to the store; `None` before the first write.
    persisted: tokio::sync::Mutex<Option<u64>>,
}

impl<S: KeyValueStore> ReplicaState<S> {
    /// Creates the state for `replica` in [`ProcessorState::Initializing`].
    pub fn new(replica: ReplicaId, store: Arc<S>) -> Self {
        ReplicaState {
            replica,
            store,
            inner: Mutex::new(Inner {
                state: ProcessorState::Initializing,
                open_scopes: 0,
                revision: 0,
                disposed: false,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            changed: Notify::new(),
            persisted: tokio::sync::Mutex::new(None),
        }
    }

    /// The replica this state belongs to.
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// The shared store the state is persisted to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the current local state.
    pub fn state(&self) -> ProcessorState {
        self.lock().state
    }

    /// Returns the number of currently open work-item scopes.
    pub fn open_scopes(&self) -> usize {
        self.lock().open_scopes
    }

    /// Returns true once [`ReplicaState::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Moves `Initializing -> Stopped`.
    ///
    /// Calling this twice is a programming error and returns
    /// [`TransitionError::AlreadyInitialized`].
    #[instrument(skip(self), fields(replica = %self.replica))]
    pub async fn mark_initializing_done(&self) -> Result<()> {
        self.apply(StateCommand::MarkInitializingDone)?;
        self.persist().await
    }

    /// Moves `Stopped -> Working` and wakes callers waiting for admission.
    ///
    /// A no-op (that still wakes waiters) while `Working` or `Stopping`.
    #[instrument(skip(self), fields(replica = %self.replica))]
    pub async fn start(&self) -> Result<()> {
        let changed = self.apply(StateCommand::Start)?;
        self.signal();
        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    /// Stops admitting new work.
    ///
    /// With no open scopes the replica is `Stopped` on return; otherwise it is
    /// `Stopping` and becomes `Stopped` when the last scope closes. In-flight
    /// work is never cancelled. Returns the state after the request.
    #[instrument(skip(self), fields(replica = %self.replica))]
    pub async fn request_stop_and_drain(&self) -> Result<ProcessorState> {
        let changed = self.apply(StateCommand::RequestStopAndDrain)?;
        if changed {
            self.persist().await?;
        }
        Ok(self.state())
    }

    /// Wakes every caller parked waiting for a state change.
    pub fn signal(&self) {
        self.changed.notify_waiters();
    }

    /// Makes every pending and future admission attempt fail.
    pub fn dispose(&self) {
        self.lock().disposed = true;
        debug!(replica = %self.replica, "Processor state disposed");
        self.signal();
    }

    /// Waits until the replica reaches `Stopped`, or `timeout` elapses.
    ///
    /// Returns true if the replica stopped in time.
    pub async fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.state() == ProcessorState::Stopped {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Writes the current local state to the store if it has not been
    /// written yet.
    pub async fn persist(&self) -> Result<()> {
        let mut persisted = self.persisted.lock().await;
        let (state, revision) = self.snapshot();
        if *persisted == Some(revision) {
            return Ok(());
        }
        self.write_record(state, revision, &mut persisted).await
    }

    /// Applies a state change requested through the shared store.
    ///
    /// Deployment tooling requests a drain by writing `Stopping` (or
    /// `Stopped`) and a start by writing `Working`. Requests that cannot be
    /// applied in the current state are overwritten with the local value, and
    /// local transitions that have not been written yet always take
    /// precedence over the stored record.
    ///
    /// Returns the command that was applied, if any.
    #[instrument(skip(self), fields(replica = %self.replica))]
    pub async fn sync_from_store(&self) -> Result<Option<StateCommand>> {
        let command = {
            let mut persisted = self.persisted.lock().await;
            let (local, revision) = self.snapshot();

            if *persisted != Some(revision) {
                self.write_record(local, revision, &mut persisted).await?;
                return Ok(None);
            }

            let requested = match load_record(&*self.store, &self.replica).await? {
                Some(record) if record.state == local => return Ok(None),
                Some(record) => record.state,
                None => {
                    self.write_record(local, revision, &mut persisted).await?;
                    return Ok(None);
                }
            };

            match requested_command(local, requested) {
                Some(command) => {
                    info!(local = %local, requested = %requested, "Applying requested processor state");
                    command
                }
                None => {
                    debug!(local = %local, requested = %requested, "Ignoring inapplicable state request");
                    self.write_record(local, revision, &mut persisted).await?;
                    return Ok(None);
                }
            }
        };

        match command {
            StateCommand::Start => self.start().await?,
            _ => {
                self.request_stop_and_drain().await?;
            }
        }
        Ok(Some(command))
    }

    // ─── Admission (used by the scope manager) ───

    /// Returns a future that completes on the next state signal.
    ///
    /// Callers must `enable` it before re-checking their condition so that a
    /// signal between the check and the await is not lost.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Appends a new waiter to the admission queue and returns its ticket.
    pub(crate) fn join_queue(&self) -> u64 {
        let mut inner = self.lock();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.waiters.push_back(ticket);
        ticket
    }

    /// Removes a waiter that gave up without being admitted.
    pub(crate) fn leave_queue(&self, ticket: u64) {
        self.lock().waiters.retain(|t| *t != ticket);
        self.signal();
    }

    /// Opens a scope for `ticket` if it is first in line, the replica is
    /// `Working`, and fewer than `max_open` scopes are open.
    ///
    /// The check and the open-scope increment happen under one lock, so a
    /// concurrent drain request always sees the new scope.
    pub(crate) fn try_open_scope(&self, ticket: u64, max_open: Option<usize>) -> Admission {
        let mut inner = self.lock();
        if inner.disposed {
            return Admission::Disposed;
        }

        let first_in_line = inner.waiters.front() == Some(&ticket);
        let has_capacity = max_open.is_none_or(|max| inner.open_scopes < max);
        if !first_in_line || inner.state != ProcessorState::Working || !has_capacity {
            return Admission::Wait;
        }

        inner.waiters.pop_front();
        inner.open_scopes += 1;
        drop(inner);

        // The next waiter in line may also be admissible.
        self.signal();
        Admission::Admitted
    }

    /// Records that a scope closed. When the last scope closes during a
    /// drain the replica moves `Stopping -> Stopped`.
    ///
    /// Returns true if the state changed and needs persisting.
    pub(crate) fn notify_scope_closed(&self) -> bool {
        let changed = {
            let mut inner = self.lock();
            debug_assert!(inner.open_scopes > 0, "scope closed more times than opened");
            inner.open_scopes = inner.open_scopes.saturating_sub(1);

            match next_state(inner.state, StateCommand::ScopeClosed, inner.open_scopes) {
                Ok(next) if next != inner.state => {
                    info!(replica = %self.replica, from = %inner.state, to = %next, "Last scope closed, drain complete");
                    inner.state = next;
                    inner.revision += 1;
                    true
                }
                _ => false,
            }
        };
        self.signal();
        changed
    }

    // ─── Internals ───

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves `Inner` consistent, so a poisoned
        // lock is still safe to use.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> (ProcessorState, u64) {
        let inner = self.lock();
        (inner.state, inner.revision)
    }

    /// Applies `command` locally. Returns true if the state changed.
    fn apply(&self, command: StateCommand) -> std::result::Result<bool, TransitionError> {
        let mut inner = self.lock();
        let next = next_state(inner.state, command, inner.open_scopes)?;
        if next == inner.state {
            debug!(replica = %self.replica, state = %next, ?command, "State unchanged");
            return Ok(false);
        }

        info!(replica = %self.replica, from = %inner.state, to = %next, ?command, "Processor state changed");
        inner.state = next;
        inner.revision += 1;
        Ok(true)
    }

    async fn write_record(
        &self,
        state: ProcessorState,
        revision: u64,
        persisted: &mut Option<u64>,
    ) -> Result<()> {
        let record = PersistedProcessorState::now(self.replica.clone(), state);
        if let Err(e) = store_record(&*self.store, &record).await {
            warn!(replica = %self.replica, state = %state, error = %e, "Failed to persist processor state");
            return Err(e.into());
        }
        *persisted = Some(revision);
        Ok(())
    }
}

/// Maps a state written by deployment tooling to the command that realizes it.
fn requested_command(local: ProcessorState, requested: ProcessorState) -> Option<StateCommand> {
    match (local, requested) {
        (ProcessorState::Working, ProcessorState::Stopping | ProcessorState::Stopped) => {
            Some(StateCommand::RequestStopAndDrain)
        }
        (ProcessorState::Stopped, ProcessorState::Working) => Some(StateCommand::Start),
        _ => None,
    }
}

/// Persists the state after a scope closed outside an async context.
///
/// Spawns the write on the current runtime; without one, the next transition
/// or store sync writes the state instead.
pub(crate) fn persist_in_background<S: KeyValueStore>(state: Arc<ReplicaState<S>>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                // Failures are already logged by `write_record`.
                let _ = state.persist().await;
            });
        }
        Err(_) => {
            warn!(replica = %state.replica, "No runtime to persist processor state; deferring to next sync");
        }
    }
}

/// Runs [`ReplicaState::sync_from_store`] every `interval` until `shutdown`
/// is cancelled.
///
/// This is how a replica picks up drain and start requests written by
/// deployment tooling.
pub async fn run_state_sync<S: KeyValueStore>(
    state: Arc<ReplicaState<S>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(replica = %state.replica, interval_secs = interval.as_secs(), "State sync loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(replica = %state.replica, "Shutdown signal received, stopping state sync");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = state.sync_from_store().await {
                    warn!(replica = %state.replica, error = %e, "State sync failed");
                }
            }
        }
    }
}
