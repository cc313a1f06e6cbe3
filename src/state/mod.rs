//! Per-replica processor state.
//!
//! The functional core lives in [`transitions`]; [`replica`] applies it under
//! a lock, tracks open scopes and admission waiters, and persists every
//! change to the shared cache. [`client`] is the other side of that record,
//! used by deployment tooling to drain and restart replicas.

pub mod client;
pub mod record;
pub mod replica;
pub mod transitions;

pub use client::ReplicaStateClient;
pub use record::{PersistedProcessorState, state_cache_key};
pub use replica::{ReplicaState, Result, StateError, run_state_sync};
pub use transitions::{ProcessorState, StateCommand, TransitionError, next_state};
