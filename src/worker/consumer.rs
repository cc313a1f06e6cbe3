//! Worker loop that feeds queued payloads through the scope gate.
//!
//! Each iteration:
//! 1. Wait for the gate to admit a new scope (blocks while not `Working`)
//! 2. Receive one message, waiting at most `receive_wait`
//! 3. Run it in the scope
//! 4. Complete the message on success, abandon it otherwise
//! 5. Close the scope
//!
//! The loop exits when `shutdown` is cancelled or the state is disposed.
//! Shutdown should only be cancelled after a drain has finished; in-flight
//! work is never cancelled by a drain.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{QueueMessage, WorkQueue};
use crate::cache::KeyValueStore;
use crate::scope::{ScopeError, WorkItemOutcome, WorkItemScope, WorkItemScopeManager};

/// Default delay before an abandoned message becomes visible again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Completed,
    Abandoned,
}

/// Runs one worker loop against a queue.
pub struct WorkItemConsumer<S: KeyValueStore, Q: WorkQueue> {
    worker: usize,
    manager: WorkItemScopeManager<S>,
    queue: Arc<Q>,
    receive_wait: Duration,
    retry_delay: Duration,
}

impl<S: KeyValueStore, Q: WorkQueue> WorkItemConsumer<S, Q> {
    pub fn new(
        worker: usize,
        manager: WorkItemScopeManager<S>,
        queue: Arc<Q>,
        receive_wait: Duration,
    ) -> Self {
        WorkItemConsumer {
            worker,
            manager,
            queue,
            receive_wait,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn manager(&self) -> &WorkItemScopeManager<S> {
        &self.manager
    }

    /// Runs until `shutdown` is cancelled or the processor state is disposed.
    #[instrument(skip_all, fields(worker = self.worker))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Work item consumer started");

        loop {
            let scope = match self.manager.begin_scope_when_ready(&shutdown).await {
                Ok(scope) => scope,
                Err(ScopeError::Cancelled) => {
                    info!("Shutdown signal received, stopping consumer");
                    break;
                }
                Err(ScopeError::Disposed) => {
                    info!("Processor state disposed, stopping consumer");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Unexpected error waiting for a scope");
                    break;
                }
            };

            self.run_in_scope(&scope, &shutdown).await;
            scope.close().await;
        }
    }

    /// Receives at most one message and runs it in `scope`.
    ///
    /// Returns `None` if no message arrived within the receive wait.
    pub async fn run_in_scope(
        &self,
        scope: &WorkItemScope<S>,
        shutdown: &CancellationToken,
    ) -> Option<MessageDisposition> {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return None,
            received = self.queue.receive(self.receive_wait) => received,
        };

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to receive from queue");
                // Avoid spinning on a broken queue while holding a scope.
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.receive_wait) => {}
                }
                return None;
            }
        };

        debug!(message_id = %message.id, dequeue_count = message.dequeue_count, "Received work item");
        let outcome = scope.run_work_item(&message.body, shutdown).await;
        Some(self.settle(message, outcome).await)
    }

    async fn settle(
        &self,
        message: QueueMessage,
        outcome: Result<WorkItemOutcome, ScopeError>,
    ) -> MessageDisposition {
        let message_id = message.id;
        let (disposition, result) = match outcome {
            Ok(WorkItemOutcome::Processed) => (
                MessageDisposition::Completed,
                self.queue.complete(message).await,
            ),
            Ok(WorkItemOutcome::Failed) => {
                info!(message_id = %message_id, "Work item not processed, will retry");
                (
                    MessageDisposition::Abandoned,
                    self.queue.abandon(message, self.retry_delay).await,
                )
            }
            Ok(WorkItemOutcome::MutexContended) => (
                MessageDisposition::Abandoned,
                self.queue.abandon(message, self.retry_delay).await,
            ),
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Work item failed");
                (
                    MessageDisposition::Abandoned,
                    self.queue.abandon(message, self.retry_delay).await,
                )
            }
        };

        if let Err(e) = result {
            warn!(message_id = %message_id, error = %e, "Failed to settle queue message");
        }
        disposition
    }
}
