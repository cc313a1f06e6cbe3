//! Type-erased dispatch from work-item discriminators to processors.
//!
//! Each registration captures the concrete work-item and processor types in
//! a closure, so the scope can go from a raw payload to a running handler
//! knowing only the discriminator. The registry is built once at start-up
//! and is immutable afterwards.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::handler::WorkItemProcessor;
use crate::types::{WorkItem, WorkItemError, WorkItemType, decode_work_item};

/// Errors from building or querying the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two processors were registered for the same discriminator.
    #[error("work item type {work_item_type} registered more than once")]
    Duplicate { work_item_type: WorkItemType },

    /// No processor is registered for the discriminator.
    #[error("no processor registered for work item type {work_item_type}")]
    Unregistered { work_item_type: WorkItemType },

    /// The start-up self-check found discriminators with no processor.
    #[error("no processor registered for work item types: {}", join(.missing))]
    Missing { missing: Vec<WorkItemType> },
}

fn join(types: &[WorkItemType]) -> String {
    types
        .iter()
        .map(WorkItemType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send>>;
type RunFn = Box<dyn FnOnce(CancellationToken) -> ProcessFuture + Send>;
type PrepareFn =
    Arc<dyn Fn(&str) -> Result<PreparedWorkItem, WorkItemError> + Send + Sync + 'static>;

/// A decoded work item bound to the processor instance that will run it.
pub struct PreparedWorkItem {
    mutex_key: Option<String>,
    logging_context: BTreeMap<String, String>,
    run: RunFn,
}

impl PreparedWorkItem {
    /// The key to hold exclusively while processing, if any.
    pub fn mutex_key(&self) -> Option<&str> {
        self.mutex_key.as_deref()
    }

    /// Fields for the work item's log span.
    pub fn logging_context(&self) -> &BTreeMap<String, String> {
        &self.logging_context
    }

    /// Runs the processor on the item.
    pub fn process(self, cancel: CancellationToken) -> ProcessFuture {
        (self.run)(cancel)
    }
}

impl fmt::Debug for PreparedWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedWorkItem")
            .field("mutex_key", &self.mutex_key)
            .field("logging_context", &self.logging_context)
            .finish_non_exhaustive()
    }
}

/// The registration for one discriminator.
#[derive(Clone)]
pub struct HandlerDescriptor {
    work_item_type: WorkItemType,
    processor_name: &'static str,
    prepare: PrepareFn,
}

impl HandlerDescriptor {
    pub fn work_item_type(&self) -> &WorkItemType {
        &self.work_item_type
    }

    /// Type name of the registered processor, for logs.
    pub fn processor_name(&self) -> &'static str {
        self.processor_name
    }

    /// Decodes `payload` and builds a processor for it.
    pub fn prepare(&self, payload: &str) -> Result<PreparedWorkItem, WorkItemError> {
        (self.prepare)(payload)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("work_item_type", &self.work_item_type)
            .field("processor_name", &self.processor_name)
            .finish_non_exhaustive()
    }
}

/// Collects registrations before any scope can be opened.
#[derive(Debug, Default)]
pub struct ProcessorRegistryBuilder {
    handlers: HashMap<WorkItemType, HandlerDescriptor>,
    duplicate: Option<WorkItemType>,
}

impl ProcessorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `T`. The factory is called once per work item.
    pub fn register_factory<T, P, F>(mut self, factory: F) -> Self
    where
        T: WorkItem,
        P: WorkItemProcessor<T>,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let work_item_type = T::work_item_type();
        if self.handlers.contains_key(&work_item_type) {
            self.duplicate.get_or_insert(work_item_type);
            return self;
        }

        let prepare: PrepareFn = Arc::new(move |payload: &str| -> Result<PreparedWorkItem, WorkItemError> {
            let item: T = decode_work_item(payload)?;
            let processor = factory();
            let mutex_key = processor.mutex_key(&item);
            let logging_context = processor.logging_context(&item);
            let run: RunFn = Box::new(move |cancel: CancellationToken| -> ProcessFuture {
                Box::pin(async move { processor.process_work_item(item, &cancel).await })
            });
            Ok(PreparedWorkItem {
                mutex_key,
                logging_context,
                run,
            })
        });

        let processor_name = std::any::type_name::<P>();
        debug!(work_item_type = %work_item_type, processor = processor_name, "Registered work item processor");
        self.handlers.insert(
            work_item_type.clone(),
            HandlerDescriptor {
                work_item_type,
                processor_name,
                prepare,
            },
        );
        self
    }

    /// Registers a shared processor instance for `T`.
    ///
    /// Registering clones of one `Arc` for several types shares the same
    /// underlying logic object between them.
    pub fn register<T, P>(self, processor: Arc<P>) -> Self
    where
        T: WorkItem,
        P: WorkItemProcessor<T>,
    {
        self.register_factory::<T, Arc<P>, _>(move || processor.clone())
    }

    /// Registers `P` for `T`, constructing a fresh `P::default()` per item.
    pub fn register_default<T, P>(self) -> Self
    where
        T: WorkItem,
        P: WorkItemProcessor<T> + Default,
    {
        self.register_factory::<T, P, _>(P::default)
    }

    /// Finishes registration.
    pub fn build(self) -> Result<ProcessorRegistry, RegistryError> {
        if let Some(work_item_type) = self.duplicate {
            return Err(RegistryError::Duplicate { work_item_type });
        }
        info!(processors = self.handlers.len(), "Processor registry built");
        Ok(ProcessorRegistry {
            handlers: Arc::new(self.handlers),
        })
    }
}

/// Immutable map from discriminator to processor registration.
///
/// Cheap to clone; clones share the same registrations.
#[derive(Debug, Clone)]
pub struct ProcessorRegistry {
    handlers: Arc<HashMap<WorkItemType, HandlerDescriptor>>,
}

impl ProcessorRegistry {
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::new()
    }

    /// Looks up the registration for a discriminator.
    pub fn resolve(&self, work_item_type: &WorkItemType) -> Result<&HandlerDescriptor, RegistryError> {
        self.handlers
            .get(work_item_type)
            .ok_or_else(|| RegistryError::Unregistered {
                work_item_type: work_item_type.clone(),
            })
    }

    pub fn contains(&self, work_item_type: &WorkItemType) -> bool {
        self.handlers.contains_key(work_item_type)
    }

    /// Verifies every expected discriminator resolves. Run at start-up.
    pub fn ensure_resolvable<I>(&self, expected: I) -> Result<(), RegistryError>
    where
        I: IntoIterator,
        I::Item: Into<WorkItemType>,
    {
        let mut missing: Vec<WorkItemType> = expected
            .into_iter()
            .map(Into::into)
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        missing.dedup();
        Err(RegistryError::Missing { missing })
    }

    /// All registered discriminators, sorted.
    pub fn work_item_types(&self) -> Vec<WorkItemType> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
