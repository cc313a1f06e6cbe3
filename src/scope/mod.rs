//! Admission control and per-item execution.
//!
//! A worker loop asks the [`WorkItemScopeManager`] for a scope, which waits
//! until the replica is `Working` and below its concurrency ceiling. The
//! returned [`WorkItemScope`] runs one raw payload: resolve the processor,
//! take the optional mutex lease, decode, process, record telemetry, and
//! release everything on every exit path.

pub mod manager;
pub mod work_item_scope;


use thiserror::Error;

use crate::cache::CacheError;
use crate::processor::RegistryError;
use crate::types::WorkItemError;

pub use manager::{ConcurrencyLimit, WorkItemScopeManager};
pub use work_item_scope::WorkItemScope;

/// How a work item run ended, when it did not fail with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemOutcome {
    /// The processor handled the item.
    Processed,
    /// The processor returned `false`; the item was not handled.
    Failed,
    /// The item's mutex key is held elsewhere; retry later.
    MutexContended,
}

impl WorkItemOutcome {
    /// True only for [`WorkItemOutcome::Processed`].
    pub fn is_processed(self) -> bool {
        self == WorkItemOutcome::Processed
    }
}

/// Errors from opening a scope or running a work item in it.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// The processor state was disposed while waiting for admission.
    #[error("processor state has been disposed")]
    Disposed,

    /// The caller's cancellation token fired while waiting for admission.
    #[error("cancelled while waiting for a work item scope")]
    Cancelled,

    /// The payload's type has no registered processor.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The payload could not be decoded.
    #[error(transparent)]
    Payload(#[from] WorkItemError),

    /// The mutex lease could not be acquired because the cache failed.
    #[error("mutex lease error: {0}")]
    Cache(#[from] CacheError),

    /// The processor returned an error.
    #[error("processor failed: {0:#}")]
    Processor(anyhow::Error),
}
