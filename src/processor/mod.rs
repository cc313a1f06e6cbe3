//! Work-item processors and the registry that dispatches to them.

pub mod handler;
pub mod heartbeat;
pub mod registry;

pub use handler::WorkItemProcessor;
pub use heartbeat::{HeartbeatProcessor, HeartbeatWorkItem};
pub use registry::{
    HandlerDescriptor, PreparedWorkItem, ProcessorRegistry, ProcessorRegistryBuilder,
    RegistryError,
};
