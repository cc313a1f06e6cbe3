//! Work-item processing engine.
//!
//! Services embed this crate to pull units of asynchronous work off a shared
//! queue and run them safely across many stateless replicas: admission
//! control, graceful drain during rolling deployments, distributed per-key
//! mutual exclusion, and typed dispatch to registered processors.

pub mod cache;
pub mod config;
pub mod processor;
pub mod scope;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{InMemoryStore, KeyValueStore, MutexLease};
pub use config::{ConfigError, EngineConfig};
pub use processor::{ProcessorRegistry, RegistryError, WorkItemProcessor};
pub use scope::{
    ConcurrencyLimit, ScopeError, WorkItemOutcome, WorkItemScope, WorkItemScopeManager,
};
pub use state::{ProcessorState, ReplicaState, ReplicaStateClient, StateError};
pub use telemetry::{TelemetryRecorder, TelemetryScope, TracingTelemetry};
pub use types::{ReplicaId, WorkItem, WorkItemType};
