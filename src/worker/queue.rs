//! Queue transport for raw work-item payloads.
//!
//! The engine does not own the physical queue; [`WorkQueue`] is the seam the
//! consumer talks to. [`InMemoryQueue`] backs the host binary and tests with
//! a tokio channel.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Messages abandoned this many times are dead-lettered instead of requeued.
pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 5;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue has been shut down.
    #[error("queue is closed")]
    Closed,
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// A message received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: Uuid,
    /// The raw work-item JSON.
    pub body: String,
    /// How many times this message has been received, including this time.
    pub dequeue_count: u32,
}

/// A queue of raw work-item payloads with at-least-once delivery.
pub trait WorkQueue: Send + Sync + 'static {
    /// Enqueues a payload.
    fn send(&self, body: String) -> impl Future<Output = Result<()>> + Send;

    /// Receives the next message, waiting at most `wait`.
    fn receive(&self, wait: Duration) -> impl Future<Output = Result<Option<QueueMessage>>> + Send;

    /// Removes a successfully processed message.
    fn complete(&self, message: QueueMessage) -> impl Future<Output = Result<()>> + Send;

    /// Returns a message to the queue, visible again after `delay`.
    fn abandon(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// A process-local [`WorkQueue`].
#[derive(Debug)]
pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
    max_dequeue_count: u32,
    dead_letters: Mutex<Vec<QueueMessage>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_max_dequeue_count(DEFAULT_MAX_DEQUEUE_COUNT)
    }

    pub fn with_max_dequeue_count(max_dequeue_count: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        InMemoryQueue {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            max_dequeue_count,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Messages that were abandoned too many times.
    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push(&self, message: QueueMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| QueueError::Closed)
    }
}

impl WorkQueue for InMemoryQueue {
    fn send(&self, body: String) -> impl Future<Output = Result<()>> + Send {
        let message = QueueMessage {
            id: Uuid::new_v4(),
            body,
            dequeue_count: 0,
        };
        trace!(message_id = %message.id, "Message enqueued");
        std::future::ready(self.push(message))
    }

    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(mut message)) => {
                message.dequeue_count += 1;
                Ok(Some(message))
            }
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }

    fn complete(&self, message: QueueMessage) -> impl Future<Output = Result<()>> + Send {
        trace!(message_id = %message.id, "Message completed");
        std::future::ready(Ok(()))
    }

    async fn abandon(&self, message: QueueMessage, delay: Duration) -> Result<()> {
        if message.dequeue_count >= self.max_dequeue_count {
            error!(
                message_id = %message.id,
                dequeue_count = message.dequeue_count,
                "Message exceeded max dequeue count, dead-lettering"
            );
            self.dead_letters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(message);
            return Ok(());
        }

        debug!(message_id = %message.id, dequeue_count = message.dequeue_count, delay_ms = delay.as_millis() as u64, "Message abandoned");
        if delay.is_zero() {
            return self.push(message);
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The queue may have been dropped meanwhile; the message goes with it.
            let _ = tx.send(message);
        });
        Ok(())
    }
}
