//! The handler contract for typed work items.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::types::WorkItem;

/// Processes work items of type `T`.
///
/// A single processor type may implement this for several work-item types
/// and be registered once per type.
pub trait WorkItemProcessor<T: WorkItem>: Send + Sync + 'static {
    /// Processes one work item.
    ///
    /// `Ok(true)` means the item was handled and can be removed from the
    /// queue. `Ok(false)` is a logical failure: not an error, but the item
    /// was not handled. `Err` propagates to the caller of the scope.
    fn process_work_item(
        &self,
        item: T,
        cancel: &CancellationToken,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// Returns a key that must be held exclusively while `item` is processed.
    ///
    /// Items with the same key never run concurrently across replicas.
    fn mutex_key(&self, _item: &T) -> Option<String> {
        None
    }

    /// Extra fields attached to the log span of `item`.
    fn logging_context(&self, _item: &T) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

impl<T: WorkItem, P: WorkItemProcessor<T>> WorkItemProcessor<T> for Arc<P> {
    fn process_work_item(
        &self,
        item: T,
        cancel: &CancellationToken,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send {
        (**self).process_work_item(item, cancel)
    }

    fn mutex_key(&self, item: &T) -> Option<String> {
        (**self).mutex_key(item)
    }

    fn logging_context(&self, item: &T) -> BTreeMap<String, String> {
        (**self).logging_context(item)
    }
}
