//! Queue consumption for the host.
//!
//! - [`queue`]: the queue seam and its in-process implementation
//! - [`consumer`]: the worker loop that drives payloads through scopes

pub mod consumer;
pub mod queue;

#[cfg(test)]
mod tests;

pub use consumer::{DEFAULT_RETRY_DELAY, MessageDisposition, WorkItemConsumer};
pub use queue::{InMemoryQueue, QueueError, QueueMessage, WorkQueue};
